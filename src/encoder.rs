//! The tiled image encoder: partition → feature network → posterior head.
//!
//! The feature network is an external function approximator. The encoder
//! only relies on its I/O contract: padded tiles in, one embedding row per
//! tile out.

use ndarray::{concatenate, Array2, Array4, ArrayView3, ArrayView4, Axis};
use rand::Rng;
use tracing::debug;

use crate::catalog::{stitch_catalog, Catalog, TileEstimate};
use crate::config::EncoderConfig;
use crate::error::{BlissError, Result};
use crate::posterior::{PosteriorHead, PosteriorLayout, TilePosterior};
use crate::tile::TileGrid;

/// Maps padded tiles `[n_tiles, bands, ptile, ptile]` to embeddings
/// `[n_tiles, embedding_dim]`.
pub trait FeatureNetwork {
    fn embedding_dim(&self) -> usize;
    fn embed(&self, tiles: ArrayView4<f32>) -> Result<Array2<f64>>;
}

/// Flattens each padded tile into its embedding. No learned parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFeatures {
    n_bands: usize,
    ptile_slen: usize,
}

impl PixelFeatures {
    pub fn new(n_bands: usize, ptile_slen: usize) -> Self {
        Self { n_bands, ptile_slen }
    }

    /// Features sized for `config`'s padded tiles.
    pub fn for_config(config: &EncoderConfig) -> Self {
        Self::new(config.n_bands, config.ptile_slen())
    }
}

impl FeatureNetwork for PixelFeatures {
    fn embedding_dim(&self) -> usize {
        self.n_bands * self.ptile_slen * self.ptile_slen
    }

    fn embed(&self, tiles: ArrayView4<f32>) -> Result<Array2<f64>> {
        let (n, b, h, w) = tiles.dim();
        if (b, h, w) != (self.n_bands, self.ptile_slen, self.ptile_slen) {
            return Err(BlissError::shape(
                "pixel features input",
                (self.n_bands, self.ptile_slen, self.ptile_slen),
                (b, h, w),
            ));
        }
        let flat: Vec<f64> = tiles.iter().map(|&v| v as f64).collect();
        Array2::from_shape_vec((n, b * h * w), flat)
            .map_err(|_| BlissError::shape("pixel features output", n * b * h * w, tiles.len()))
    }
}

/// Tiled variational encoder.
pub struct ImageEncoder {
    config: EncoderConfig,
    network: Box<dyn FeatureNetwork>,
    head: PosteriorHead,
}

impl std::fmt::Debug for ImageEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageEncoder")
            .field("config", &self.config)
            .field("embedding_dim", &self.network.embedding_dim())
            .finish()
    }
}

impl ImageEncoder {
    /// Assemble an encoder, checking that the network, head and configuration
    /// agree on every dimension.
    pub fn new(config: EncoderConfig, network: Box<dyn FeatureNetwork>, head: PosteriorHead) -> Result<Self> {
        config.validate()?;
        if network.embedding_dim() != config.embedding_dim {
            return Err(BlissError::InvalidConfig(format!(
                "feature network embedding dim {} != configured {}",
                network.embedding_dim(),
                config.embedding_dim
            )));
        }
        if head.embedding_dim() != config.embedding_dim {
            return Err(BlissError::InvalidConfig(format!(
                "posterior head embedding dim {} != configured {}",
                head.embedding_dim(),
                config.embedding_dim
            )));
        }
        if *head.layout() != PosteriorLayout::from_config(&config) {
            return Err(BlissError::InvalidConfig(format!(
                "posterior head layout {:?} does not match configuration",
                head.layout()
            )));
        }
        Ok(Self {
            config,
            network,
            head,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn head(&self) -> &PosteriorHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut PosteriorHead {
        &mut self.head
    }

    pub fn max_detections(&self) -> usize {
        self.config.max_detections
    }

    pub fn n_galaxy_params(&self) -> usize {
        self.config.n_galaxy_params
    }

    /// Tile grid for an image of the given size.
    pub fn tile_grid(&self, image_height: usize, image_width: usize) -> Result<TileGrid> {
        TileGrid::new(image_height, image_width, self.config.tile_slen, self.config.ptile_pad)
    }

    /// Padded tiles of one `[H, W, bands]` image.
    pub fn get_images_in_tiles(&self, image: ArrayView3<f32>) -> Result<(TileGrid, Array4<f32>)> {
        let (h, w, b) = image.dim();
        if b != self.config.n_bands {
            return Err(BlissError::shape("image bands", self.config.n_bands, b));
        }
        let grid = self.tile_grid(h, w)?;
        let tiles = grid.partition(image)?;
        Ok((grid, tiles))
    }

    /// Padded tiles of a `[batch, H, W, bands]` stack, image-major:
    /// tile `k` of image `i` is row `i * n_tiles + k`.
    pub fn get_batch_in_tiles(&self, images: ArrayView4<f32>) -> Result<(TileGrid, Array4<f32>)> {
        let (batch, h, w, _) = images.dim();
        let grid = self.tile_grid(h, w)?;
        let per_image = images
            .outer_iter()
            .map(|img| self.get_images_in_tiles(img).map(|(_, t)| t))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = per_image.iter().map(|t| t.view()).collect();
        let tiles = if views.is_empty() {
            let p = self.config.ptile_slen();
            Array4::zeros((0, self.config.n_bands, p, p))
        } else {
            concatenate(Axis(0), &views)
                .map_err(|e| BlissError::shape("batch tiles", batch * grid.n_tiles(), e.to_string()))?
        };
        Ok((grid, tiles))
    }

    fn check_tiles(&self, tiles: &ArrayView4<f32>) -> Result<()> {
        let (_, b, h, w) = tiles.dim();
        let p = self.config.ptile_slen();
        if (b, h, w) != (self.config.n_bands, p, p) {
            return Err(BlissError::shape("padded tiles", (self.config.n_bands, p, p), (b, h, w)));
        }
        Ok(())
    }

    fn embed(&self, tiles: ArrayView4<f32>) -> Result<Array2<f64>> {
        self.check_tiles(&tiles)?;
        let emb = self.network.embed(tiles)?;
        if emb.dim() != (tiles.dim().0, self.config.embedding_dim) {
            return Err(BlissError::shape(
                "feature network output",
                (tiles.dim().0, self.config.embedding_dim),
                emb.dim(),
            ));
        }
        Ok(emb)
    }

    /// Posterior for every tile. With `true_counts` the slot parameters are
    /// those of the true count (teacher forcing).
    pub fn forward(&self, tiles: ArrayView4<f32>, true_counts: Option<&[usize]>) -> Result<TilePosterior> {
        let emb = self.embed(tiles)?;
        self.head.forward(emb.view(), true_counts)
    }

    /// Deterministic MAP read-out: argmax count, posterior means of the on
    /// slots.
    pub fn map_estimate(&self, tiles: ArrayView4<f32>) -> Result<TileEstimate> {
        Ok(self.forward(tiles, None)?.point_estimate())
    }

    /// Partition `image` and read out the MAP estimate of every tile.
    pub fn tiled_map_estimate(&self, image: ArrayView3<f32>) -> Result<(TileGrid, TileEstimate)> {
        let (grid, tiles) = self.get_images_in_tiles(image)?;
        let est = self.map_estimate(tiles.view())?;
        debug!(
            "MAP estimate: {} sources over {} tiles",
            est.n_sources.sum(),
            grid.n_tiles()
        );
        Ok((grid, est))
    }

    /// Stochastic read-out; all randomness comes from `rng`.
    pub fn sample<R: Rng + ?Sized>(&self, tiles: ArrayView4<f32>, rng: &mut R) -> Result<TileEstimate> {
        let emb = self.embed(tiles)?;
        self.head.sample(emb.view(), rng)
    }

    /// MAP catalog of a full image.
    pub fn catalog(&self, image: ArrayView3<f32>, max_sources: Option<usize>) -> Result<Catalog> {
        let (grid, est) = self.tiled_map_estimate(image)?;
        stitch_catalog(&est, &grid, max_sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> EncoderConfig {
        EncoderConfig {
            tile_slen: 2,
            ptile_pad: 1,
            n_bands: 1,
            max_detections: 2,
            n_galaxy_params: 2,
            embedding_dim: 16,
        }
    }

    fn encoder(seed: u64) -> ImageEncoder {
        let config = small_config();
        let head = PosteriorHead::random(&config, 0.3, &mut StdRng::seed_from_u64(seed)).unwrap();
        ImageEncoder::new(config.clone(), Box::new(PixelFeatures::for_config(&config)), head).unwrap()
    }

    fn image() -> Array3<f32> {
        Array3::from_shape_fn((6, 4, 1), |(r, c, _)| ((r * 7 + c * 3) % 5) as f32)
    }

    #[test]
    fn test_mismatched_dims_rejected() {
        let config = small_config();
        let head = PosteriorHead::zeros(&config).unwrap();
        let wrong_net = PixelFeatures::new(1, 3);
        assert!(matches!(
            ImageEncoder::new(config.clone(), Box::new(wrong_net), head),
            Err(BlissError::InvalidConfig(_))
        ));

        let other = EncoderConfig {
            n_galaxy_params: 3,
            ..small_config()
        };
        let head = PosteriorHead::zeros(&other).unwrap();
        assert!(ImageEncoder::new(config.clone(), Box::new(PixelFeatures::for_config(&config)), head).is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let enc = encoder(1);
        let img = image();
        let (grid, tiles) = enc.get_images_in_tiles(img.view()).unwrap();
        assert_eq!(grid.n_tiles(), 6);
        assert_eq!(tiles.dim(), (6, 1, 4, 4));
        let post = enc.forward(tiles.view(), Some(&[0, 1, 2, 0, 1, 2])).unwrap();
        assert_eq!(post.loc_mean.dim(), (6, 2, 2));
        assert_eq!(post.galaxy_param_mean.dim(), (6, 2, 2));
        assert_eq!(post.n_source_log_probs.dim(), (6, 3));
    }

    #[test]
    fn test_map_estimate_idempotent() {
        let enc = encoder(2);
        let img = image();
        let (_, a) = enc.tiled_map_estimate(img.view()).unwrap();
        let (_, b) = enc.tiled_map_estimate(img.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_band_count() {
        let enc = encoder(3);
        let img = Array3::<f32>::zeros((6, 4, 2));
        assert!(enc.get_images_in_tiles(img.view()).is_err());
    }

    #[test]
    fn test_batch_tiles_are_image_major() {
        let enc = encoder(4);
        let img = image();
        let mut batch = ndarray::Array4::<f32>::zeros((2, 6, 4, 1));
        batch.index_axis_mut(Axis(0), 1).assign(&img);
        let (grid, tiles) = enc.get_batch_in_tiles(batch.view()).unwrap();
        assert_eq!(tiles.dim().0, 2 * grid.n_tiles());
        let (_, single) = enc.get_images_in_tiles(img.view()).unwrap();
        for k in 0..grid.n_tiles() {
            assert_eq!(tiles.index_axis(Axis(0), grid.n_tiles() + k), single.index_axis(Axis(0), k));
        }
    }

    #[test]
    fn test_catalog_matches_counts() {
        let enc = encoder(5);
        let img = image();
        let (_, est) = enc.tiled_map_estimate(img.view()).unwrap();
        let cat = enc.catalog(img.view(), None).unwrap();
        assert_eq!(cat.len(), est.n_sources.sum());
        for src in &cat.sources {
            assert!(src.position.x >= 0.0 && src.position.x < 6.0);
            assert!(src.position.y >= 0.0 && src.position.y < 4.0);
        }
    }
}
