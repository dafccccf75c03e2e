//! Sleep phase: score the encoder against simulated catalogs.
//!
//! The simulator draws catalogs, renders them, and hands both the images and
//! the per-tile truth to [`SleepPhase::compute_loss`]. The encoder sees the
//! true counts (teacher forcing), and the loss engine matches its candidate
//! slots to the unordered true sources.

use ndarray::{Array2, Array3, Array4};
use tracing::debug;

use crate::config::LossConfig;
use crate::encoder::ImageEncoder;
use crate::error::{BlissError, Result};
use crate::loss::{LossEngine, TileLosses, TrueTileSources};
use crate::posterior::TilePosterior;

/// Shapes of the image simulator the training data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderInfo {
    pub n_bands: usize,
    pub tile_slen: usize,
    pub max_sources: usize,
    pub n_galaxy_params: usize,
}

/// One batch of simulated images with their per-tile truth.
///
/// Tiles are enumerated per image in the tile grid's row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingBatch {
    /// `[batch, H, W, bands]`
    pub images: Array4<f32>,
    /// `[batch, n_tiles, max, 2]`, tile-relative.
    pub locs: Array4<f64>,
    /// `[batch, n_tiles, max, n_galaxy_params]`
    pub galaxy_params: Array4<f64>,
    /// `[batch, n_tiles, max, n_bands]`
    pub log_fluxes: Array4<f64>,
    /// `[batch, n_tiles, max]`
    pub galaxy_bool: Array3<bool>,
    /// `[batch, n_tiles]`
    pub n_sources: Array2<usize>,
}

impl TrainingBatch {
    pub fn batch_size(&self) -> usize {
        self.images.dim().0
    }

    /// Number of tiles over the whole batch.
    pub fn n_ptiles(&self) -> usize {
        self.n_sources.len()
    }

    /// Flatten the truth so the first axis runs over every tile of the batch.
    pub fn tile_truth(&self) -> Result<TrueTileSources> {
        let (batch, n_tiles) = self.n_sources.dim();
        let n = batch * n_tiles;
        let (_, _, max, _) = self.locs.dim();

        let flat3 = |a: &Array4<f64>, what: &'static str| -> Result<Array3<f64>> {
            let (b, t, m, d) = a.dim();
            if (b, t, m) != (batch, n_tiles, max) {
                return Err(BlissError::shape(what, (batch, n_tiles, max), (b, t, m)));
            }
            a.to_shape((n, m, d))
                .map(|v| v.into_owned())
                .map_err(|e| BlissError::shape(what, (n, m, d), e.to_string()))
        };

        let locs = flat3(&self.locs, "true locs")?;
        if locs.dim().2 != 2 {
            return Err(BlissError::shape("true locs", 2, locs.dim().2));
        }
        let galaxy_params = flat3(&self.galaxy_params, "true galaxy params")?;
        let log_fluxes = flat3(&self.log_fluxes, "true log fluxes")?;

        if self.galaxy_bool.dim() != (batch, n_tiles, max) {
            return Err(BlissError::shape(
                "true galaxy bool",
                (batch, n_tiles, max),
                self.galaxy_bool.dim(),
            ));
        }
        let galaxy_bool = self
            .galaxy_bool
            .to_shape((n, max))
            .map(|v| v.into_owned())
            .map_err(|e| BlissError::shape("true galaxy bool", (n, max), e.to_string()))?;

        Ok(TrueTileSources {
            n_sources: self.n_sources.iter().cloned().collect(),
            locs,
            galaxy_params,
            log_fluxes,
            galaxy_bool,
        })
    }
}

/// Encoder plus loss engine, checked against the simulator's shapes.
#[derive(Debug)]
pub struct SleepPhase {
    encoder: ImageEncoder,
    decoder: DecoderInfo,
    loss: LossEngine,
}

impl SleepPhase {
    pub fn new(encoder: ImageEncoder, decoder: DecoderInfo, loss_config: LossConfig) -> Result<Self> {
        let cfg = encoder.config();
        if decoder.n_galaxy_params != cfg.n_galaxy_params {
            return Err(BlissError::InvalidConfig(format!(
                "decoder has {} galaxy params, encoder has {}",
                decoder.n_galaxy_params, cfg.n_galaxy_params
            )));
        }
        if decoder.max_sources != cfg.max_detections {
            return Err(BlissError::InvalidConfig(format!(
                "decoder max_sources {} != encoder max_detections {}",
                decoder.max_sources, cfg.max_detections
            )));
        }
        if decoder.n_bands != cfg.n_bands {
            return Err(BlissError::InvalidConfig(format!(
                "decoder has {} bands, encoder has {}",
                decoder.n_bands, cfg.n_bands
            )));
        }
        if decoder.tile_slen != cfg.tile_slen {
            return Err(BlissError::InvalidConfig(format!(
                "decoder tile_slen {} != encoder tile_slen {}",
                decoder.tile_slen, cfg.tile_slen
            )));
        }
        let loss = LossEngine::new(loss_config, cfg.max_detections)?;
        Ok(Self {
            encoder,
            decoder,
            loss,
        })
    }

    pub fn encoder(&self) -> &ImageEncoder {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut ImageEncoder {
        &mut self.encoder
    }

    pub fn decoder(&self) -> &DecoderInfo {
        &self.decoder
    }

    pub fn loss_engine(&self) -> &LossEngine {
        &self.loss
    }

    /// Teacher-forced posterior for every tile of the batch.
    pub fn forward(&self, batch: &TrainingBatch) -> Result<TilePosterior> {
        let (grid, tiles) = self.encoder.get_batch_in_tiles(batch.images.view())?;
        let (b, n_tiles) = batch.n_sources.dim();
        if b != batch.batch_size() || n_tiles != grid.n_tiles() {
            return Err(BlissError::shape(
                "batch n_sources",
                (batch.batch_size(), grid.n_tiles()),
                (b, n_tiles),
            ));
        }
        let counts: Vec<usize> = batch.n_sources.iter().cloned().collect();
        self.encoder.forward(tiles.view(), Some(&counts))
    }

    /// Loss of the batch: total and per-tile components.
    pub fn compute_loss(&self, batch: &TrainingBatch) -> Result<TileLosses> {
        let truth = batch.tile_truth()?;
        let pred = self.forward(batch)?;
        let losses = self.loss.compute(&pred, &truth)?;
        debug!(
            "Batch of {} images ({} tiles): loss {:.4}",
            batch.batch_size(),
            batch.n_ptiles(),
            losses.total
        );
        Ok(losses)
    }
}
