//! Variational posterior head: turns per-tile embeddings into a posterior over
//! the number of sources in each tile and over every candidate slot's latents.
//!
//! The head is an affine read-out of the embedding. Its output vector holds
//! the count logits followed by one parameter block per possible count
//! `n ∈ 1..=max_detections`; block `n` holds `n` slots. When the count of a
//! tile is known (teacher forcing during the sleep phase) the slots are read
//! from that count's block, otherwise from the block of the most probable
//! count. Slots beyond the count are off and are zero-filled.
//!
//! Per-slot layout inside a block:
//!
//! | field              | width            |
//! |--------------------|------------------|
//! | location mean      | 2                |
//! | location log-var   | 2                |
//! | log-flux mean      | `n_bands`        |
//! | log-flux log-var   | `n_bands`        |
//! | galaxy mean        | `n_galaxy_params`|
//! | galaxy log-var     | `n_galaxy_params`|
//! | galaxy logit       | 1                |

use anyhow::Context;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::{Rng, RngExt};
use rand_distr::{Distribution, Normal, StandardNormal};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::TileEstimate;
use crate::config::EncoderConfig;
use crate::error::{BlissError, Result};

/// Added to `exp(log_var)` so variances never collapse to zero.
pub const VARIANCE_FLOOR: f64 = 1e-5;

/// Galaxy probabilities live in `[PROB_GALAXY_EPS, 1 - PROB_GALAXY_EPS]`.
pub const PROB_GALAXY_EPS: f64 = 1e-6;

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Squash a logit into the open interval (0, 1), bounded away from both ends.
pub fn squash_prob_galaxy(logit: f64) -> f64 {
    PROB_GALAXY_EPS + (1.0 - 2.0 * PROB_GALAXY_EPS) * sigmoid(logit)
}

/// `exp(log_var) + VARIANCE_FLOOR`, elementwise.
pub fn floored_variance(log_var: &Array3<f64>) -> Array3<f64> {
    log_var.mapv(|lv| lv.exp() + VARIANCE_FLOOR)
}

/// Row-wise log-softmax.
pub fn log_softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
        row.mapv_inplace(|v| v - lse);
    }
    out
}

/// Index of the largest entry; ties go to the lowest index.
fn argmax(row: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

// ── Output layout ───────────────────────────────────────────────────────────

/// Position of every posterior parameter in the head's raw output vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosteriorLayout {
    pub max_detections: usize,
    pub n_bands: usize,
    pub n_galaxy_params: usize,
}

impl PosteriorLayout {
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            max_detections: config.max_detections,
            n_bands: config.n_bands,
            n_galaxy_params: config.n_galaxy_params,
        }
    }

    /// Number of raw outputs describing one candidate slot.
    pub fn params_per_source(&self) -> usize {
        4 + 2 * self.n_bands + 2 * self.n_galaxy_params + 1
    }

    /// Number of count classes, `max_detections + 1`.
    pub fn n_count_classes(&self) -> usize {
        self.max_detections + 1
    }

    /// Total width of the raw output vector.
    pub fn out_dim(&self) -> usize {
        let m = self.max_detections;
        self.n_count_classes() + self.params_per_source() * m * (m + 1) / 2
    }

    /// Offset of slot `slot` inside the block for count `n` (`1 <= n`, `slot < n`).
    pub fn slot_offset(&self, n: usize, slot: usize) -> usize {
        debug_assert!(n >= 1 && slot < n && n <= self.max_detections);
        self.n_count_classes() + self.params_per_source() * ((n - 1) * n / 2 + slot)
    }

    /// Decode raw head outputs `[n_tiles, out_dim]` into a posterior.
    ///
    /// With `true_counts`, slot parameters are read from the true count's
    /// block; otherwise from the block of the MAP count.
    pub fn decode(&self, raw: ArrayView2<f64>, true_counts: Option<&[usize]>) -> Result<TilePosterior> {
        let (n_tiles, width) = raw.dim();
        if width != self.out_dim() {
            return Err(BlissError::shape("posterior head output", self.out_dim(), width));
        }

        let n_source_log_probs = log_softmax(raw.slice(s![.., ..self.n_count_classes()]));

        let n_sources: Array1<usize> = match true_counts {
            Some(counts) => {
                if counts.len() != n_tiles {
                    return Err(BlissError::shape("true source counts", n_tiles, counts.len()));
                }
                if let Some(&bad) = counts.iter().find(|&&n| n > self.max_detections) {
                    return Err(BlissError::shape(
                        "true source count",
                        format!("<= {}", self.max_detections),
                        bad,
                    ));
                }
                Array1::from(counts.to_vec())
            }
            None => n_source_log_probs
                .rows()
                .into_iter()
                .map(argmax)
                .collect(),
        };

        let m = self.max_detections;
        let nb = self.n_bands;
        let ng = self.n_galaxy_params;
        let mut post = TilePosterior {
            n_source_log_probs,
            n_sources,
            loc_mean: Array3::zeros((n_tiles, m, 2)),
            loc_logvar: Array3::zeros((n_tiles, m, 2)),
            log_flux_mean: Array3::zeros((n_tiles, m, nb)),
            log_flux_logvar: Array3::zeros((n_tiles, m, nb)),
            galaxy_param_mean: Array3::zeros((n_tiles, m, ng)),
            galaxy_param_logvar: Array3::zeros((n_tiles, m, ng)),
            prob_galaxy: Array2::from_elem((n_tiles, m), 0.5),
        };

        for t in 0..n_tiles {
            let n = post.n_sources[t];
            for slot in 0..n {
                let mut o = self.slot_offset(n, slot);
                for d in 0..2 {
                    post.loc_mean[[t, slot, d]] = sigmoid(raw[[t, o + d]]);
                    post.loc_logvar[[t, slot, d]] = raw[[t, o + 2 + d]];
                }
                o += 4;
                for b in 0..nb {
                    post.log_flux_mean[[t, slot, b]] = raw[[t, o + b]];
                    post.log_flux_logvar[[t, slot, b]] = raw[[t, o + nb + b]];
                }
                o += 2 * nb;
                for g in 0..ng {
                    post.galaxy_param_mean[[t, slot, g]] = raw[[t, o + g]];
                    post.galaxy_param_logvar[[t, slot, g]] = raw[[t, o + ng + g]];
                }
                o += 2 * ng;
                post.prob_galaxy[[t, slot]] = squash_prob_galaxy(raw[[t, o]]);
            }
        }

        Ok(post)
    }
}

// ── Posterior ───────────────────────────────────────────────────────────────

/// Per-tile variational posterior for one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePosterior {
    /// Log-probabilities of `0..=max_detections` sources, `[n_tiles, max + 1]`.
    pub n_source_log_probs: Array2<f64>,
    /// Count whose parameter block the slots below were decoded from.
    pub n_sources: Array1<usize>,
    /// Location mean in tile units (row, col), `[n_tiles, max, 2]`, in (0, 1).
    pub loc_mean: Array3<f64>,
    pub loc_logvar: Array3<f64>,
    /// `[n_tiles, max, n_bands]`
    pub log_flux_mean: Array3<f64>,
    pub log_flux_logvar: Array3<f64>,
    /// `[n_tiles, max, n_galaxy_params]`
    pub galaxy_param_mean: Array3<f64>,
    pub galaxy_param_logvar: Array3<f64>,
    /// `[n_tiles, max]`, strictly inside (0, 1).
    pub prob_galaxy: Array2<f64>,
}

impl TilePosterior {
    pub fn n_tiles(&self) -> usize {
        self.n_source_log_probs.nrows()
    }

    pub fn max_detections(&self) -> usize {
        self.n_source_log_probs.ncols() - 1
    }

    /// Most probable source count per tile. Ties go to the smaller count.
    pub fn map_n_sources(&self) -> Array1<usize> {
        self.n_source_log_probs.rows().into_iter().map(argmax).collect()
    }

    /// Count probabilities, `exp(n_source_log_probs)`.
    pub fn count_probs(&self) -> Array2<f64> {
        self.n_source_log_probs.mapv(f64::exp)
    }

    pub fn loc_var(&self) -> Array3<f64> {
        floored_variance(&self.loc_logvar)
    }

    pub fn log_flux_var(&self) -> Array3<f64> {
        floored_variance(&self.log_flux_logvar)
    }

    pub fn galaxy_param_var(&self) -> Array3<f64> {
        floored_variance(&self.galaxy_param_logvar)
    }

    /// Deterministic read-out: the posterior means of the on slots.
    ///
    /// Slots are on for the count the posterior was decoded with; decode
    /// without true counts to get the MAP count.
    pub fn point_estimate(&self) -> TileEstimate {
        let is_on = crate::loss::is_on_from_n_sources(self.n_sources.view(), self.max_detections());
        let on3 = is_on.mapv(|b| if b { 1.0 } else { 0.0 }).insert_axis(Axis(2));

        TileEstimate {
            n_sources: self.n_sources.clone(),
            locs: &self.loc_mean * &on3,
            log_fluxes: &self.log_flux_mean * &on3,
            galaxy_params: &self.galaxy_param_mean * &on3,
            galaxy_bool: ndarray::Zip::from(&self.prob_galaxy)
                .and(&is_on)
                .map_collect(|&p, &on| on && p > 0.5),
            prob_galaxy: &self.prob_galaxy * &on3.index_axis(Axis(2), 0),
        }
    }

    /// Stochastic read-out with reparameterized Gaussian draws.
    ///
    /// Counts are taken as decoded; locations are drawn around the mean and
    /// clamped to the tile, galaxy flags are Bernoulli draws.
    pub fn sample_latents<R: Rng + ?Sized>(&self, rng: &mut R) -> TileEstimate {
        let mut est = self.point_estimate();
        let loc_sd = self.loc_var().mapv(f64::sqrt);
        let flux_sd = self.log_flux_var().mapv(f64::sqrt);
        let gal_sd = self.galaxy_param_var().mapv(f64::sqrt);

        for t in 0..self.n_tiles() {
            for slot in 0..est.n_sources[t] {
                for d in 0..2 {
                    let z: f64 = StandardNormal.sample(rng);
                    let v = self.loc_mean[[t, slot, d]] + loc_sd[[t, slot, d]] * z;
                    est.locs[[t, slot, d]] = v.clamp(0.0, 1.0 - f64::EPSILON);
                }
                for b in 0..flux_sd.dim().2 {
                    let z: f64 = StandardNormal.sample(rng);
                    est.log_fluxes[[t, slot, b]] =
                        self.log_flux_mean[[t, slot, b]] + flux_sd[[t, slot, b]] * z;
                }
                for g in 0..gal_sd.dim().2 {
                    let z: f64 = StandardNormal.sample(rng);
                    est.galaxy_params[[t, slot, g]] =
                        self.galaxy_param_mean[[t, slot, g]] + gal_sd[[t, slot, g]] * z;
                }
                let u: f64 = rng.random();
                est.galaxy_bool[[t, slot]] = u < self.prob_galaxy[[t, slot]];
            }
        }
        est
    }
}

/// Draw one count per tile from the categorical given by `log_probs`.
pub fn sample_counts<R: Rng + ?Sized>(log_probs: ArrayView2<f64>, rng: &mut R) -> Vec<usize> {
    log_probs
        .rows()
        .into_iter()
        .map(|row| {
            let u: f64 = rng.random();
            let mut acc = 0.0;
            for (n, &lp) in row.iter().enumerate() {
                acc += lp.exp();
                if u < acc {
                    return n;
                }
            }
            row.len() - 1
        })
        .collect()
}

// ── Head parameters ─────────────────────────────────────────────────────────

/// Flat, serializable parameters of the affine head.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct HeadWeights {
    pub embedding_dim: u32,
    pub out_dim: u32,
    /// Row-major `[out_dim, embedding_dim]`.
    pub weight: Vec<f64>,
    pub bias: Vec<f64>,
}

impl HeadWeights {
    /// Serialize the weights to bytes using rkyv.
    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    /// Deserialize weights previously written by [`to_rkyv_bytes`](Self::to_rkyv_bytes).
    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        // Archived f64 fields need an aligned buffer.
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
    }

    /// Save the weights to a file.
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
        info!("Saved head weights to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Load weights from a file written by [`save_to_file`](Self::save_to_file).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let weights = Self::from_rkyv_bytes(&bytes)?;
        info!(
            "Loaded head weights: {} outputs x {} embedding dims",
            weights.out_dim, weights.embedding_dim
        );
        Ok(weights)
    }
}

/// Affine posterior head: `raw = W · embedding + b`, decoded by
/// [`PosteriorLayout::decode`].
#[derive(Debug, Clone)]
pub struct PosteriorHead {
    layout: PosteriorLayout,
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl PosteriorHead {
    /// Head with all weights and biases zero: uniform count posterior,
    /// centered locations, unit variances.
    pub fn zeros(config: &EncoderConfig) -> Result<Self> {
        config.validate()?;
        let layout = PosteriorLayout::from_config(config);
        Ok(Self {
            layout,
            weight: Array2::zeros((layout.out_dim(), config.embedding_dim)),
            bias: Array1::zeros(layout.out_dim()),
        })
    }

    /// Head with Gaussian-initialized weights of standard deviation `scale`
    /// and zero biases.
    pub fn random<R: Rng + ?Sized>(config: &EncoderConfig, scale: f64, rng: &mut R) -> Result<Self> {
        let mut head = Self::zeros(config)?;
        let normal = Normal::new(0.0, scale)
            .map_err(|e| BlissError::InvalidConfig(format!("weight scale {scale}: {e}")))?;
        head.weight.mapv_inplace(|_| normal.sample(rng));
        Ok(head)
    }

    /// Rebuild a head from exported weights, checking them against `config`.
    pub fn from_weights(config: &EncoderConfig, weights: &HeadWeights) -> Result<Self> {
        config.validate()?;
        let layout = PosteriorLayout::from_config(config);
        let out_dim = weights.out_dim as usize;
        let emb = weights.embedding_dim as usize;
        if out_dim != layout.out_dim() || emb != config.embedding_dim {
            return Err(BlissError::shape(
                "head weights",
                (layout.out_dim(), config.embedding_dim),
                (out_dim, emb),
            ));
        }
        let weight = Array2::from_shape_vec((out_dim, emb), weights.weight.clone())
            .map_err(|_| BlissError::shape("head weight matrix", out_dim * emb, weights.weight.len()))?;
        if weights.bias.len() != out_dim {
            return Err(BlissError::shape("head bias", out_dim, weights.bias.len()));
        }
        Ok(Self {
            layout,
            weight,
            bias: Array1::from(weights.bias.clone()),
        })
    }

    /// Export the parameters.
    pub fn weights(&self) -> HeadWeights {
        HeadWeights {
            embedding_dim: self.weight.ncols() as u32,
            out_dim: self.weight.nrows() as u32,
            weight: self.weight.iter().cloned().collect(),
            bias: self.bias.to_vec(),
        }
    }

    pub fn layout(&self) -> &PosteriorLayout {
        &self.layout
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn weight_mut(&mut self) -> &mut Array2<f64> {
        &mut self.weight
    }

    pub fn bias_mut(&mut self) -> &mut Array1<f64> {
        &mut self.bias
    }

    /// Raw affine outputs `[n_tiles, out_dim]`.
    pub fn raw_output(&self, embeddings: ArrayView2<f64>) -> Result<Array2<f64>> {
        if embeddings.ncols() != self.embedding_dim() {
            return Err(BlissError::shape(
                "tile embeddings",
                self.embedding_dim(),
                embeddings.ncols(),
            ));
        }
        Ok(embeddings.dot(&self.weight.t()) + &self.bias)
    }

    /// Posterior for each tile. `true_counts` switches on teacher forcing.
    pub fn forward(&self, embeddings: ArrayView2<f64>, true_counts: Option<&[usize]>) -> Result<TilePosterior> {
        let raw = self.raw_output(embeddings)?;
        debug!(
            "Posterior head: {} tiles, {} outputs, teacher forced: {}",
            raw.nrows(),
            raw.ncols(),
            true_counts.is_some()
        );
        self.layout.decode(raw.view(), true_counts)
    }

    /// Draw counts from the count posterior, then latents for those counts.
    pub fn sample<R: Rng + ?Sized>(&self, embeddings: ArrayView2<f64>, rng: &mut R) -> Result<TileEstimate> {
        let raw = self.raw_output(embeddings)?;
        let log_probs = log_softmax(raw.slice(s![.., ..self.layout.n_count_classes()]));
        let counts = sample_counts(log_probs.view(), rng);
        let post = self.layout.decode(raw.view(), Some(&counts))?;
        Ok(post.sample_latents(rng))
    }
}
