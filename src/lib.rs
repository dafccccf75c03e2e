//! # bliss
//!
//! Tiled variational **source detection and deblending** for astronomical
//! images.
//!
//! An image is cut into small square tiles. For every tile, an encoder
//! produces a posterior over how many sources the tile holds (up to
//! `max_detections`) and, for each candidate slot, Gaussian posteriors over
//! the source location, per-band log-flux and galaxy shape, plus the
//! probability that the source is a galaxy. The encoder is trained in the
//! "sleep phase" against catalogs drawn from an image simulator.
//!
//! ## Features
//!
//! - **Tiling** — padded tiles with a fixed row-major enumeration, and the
//!   inverse stitching back to the full image
//! - **Variational head** — count posterior plus per-count slot parameters,
//!   with variance flooring and galaxy probabilities bounded away from 0 and 1
//! - **Permutation-invariant loss** — true sources are unordered, so every
//!   slot permutation is scored and the best one (by location loss) is used
//! - **Catalogs** — MAP read-out of every tile stitched into one ordered
//!   catalog in absolute pixel coordinates
//!
//! ## Example
//!
//! ```no_run
//! use bliss::{EncoderConfig, ImageEncoder, PixelFeatures, PosteriorHead};
//! use ndarray::Array3;
//!
//! let config = EncoderConfig {
//!     tile_slen: 4,
//!     ptile_pad: 2,
//!     n_bands: 1,
//!     max_detections: 2,
//!     n_galaxy_params: 8,
//!     embedding_dim: 64,
//! };
//! let head = PosteriorHead::zeros(&config).unwrap();
//! let encoder = ImageEncoder::new(
//!     config.clone(),
//!     Box::new(PixelFeatures::for_config(&config)),
//!     head,
//! )
//! .unwrap();
//!
//! let image = Array3::<f32>::zeros((40, 40, 1));
//! let catalog = encoder.catalog(image.view(), None).unwrap();
//! println!("Detected {} sources", catalog.len());
//! ```
//!
//! ## Loss overview
//!
//! 1. **Combinations** — log-density of every true slot under every candidate slot
//! 2. **Permutations** — sum the matched entries for each of the `max_detections!`
//!    bijections, masked by on/off and galaxy/star type
//! 3. **Selection** — keep the permutation with the lowest location loss
//! 4. **Assembly** — add the count cross-entropy and average over tiles

pub mod catalog;
pub mod config;
pub mod encoder;
mod error;
pub mod loss;
pub mod posterior;
pub mod sleep;
pub mod tile;
pub mod train;

pub use catalog::{stitch_catalog, Catalog, CatalogSource, TileEstimate};
pub use config::{EncoderConfig, LossConfig, LossKind, MAX_DETECTIONS_LIMIT};
pub use encoder::{FeatureNetwork, ImageEncoder, PixelFeatures};
pub use error::{BlissError, Result};
pub use loss::{
    is_on_from_n_sources, is_on_from_n_sources_2d, LossEngine, MatchingStrategy,
    PermutationTable, TileLosses, TrueTileSources,
};
pub use posterior::{HeadWeights, PosteriorHead, PosteriorLayout, TilePosterior};
pub use sleep::{DecoderInfo, SleepPhase, TrainingBatch};
pub use tile::TileGrid;
pub use train::{
    BatchSource, EpochSummary, MemoizedBatches, ParameterUpdate, TrainConfig, Trainer,
    TrainingHistory,
};

// Absolute pixel positions in the catalog are (row, col).
pub type Vector2 = nalgebra::Vector2<f64>;
