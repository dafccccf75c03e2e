//! Configuration for the encoder and the sleep-phase loss.
//!
//! Configurations are plain values handed to each constructor. There is no
//! process-wide default context.

use std::str::FromStr;

use crate::error::{BlissError, Result};

/// Largest `max_detections` accepted for exhaustive permutation matching.
/// 8! = 40320 permutations per tile.
pub const MAX_DETECTIONS_LIMIT: usize = 8;

// ── Encoder configuration ───────────────────────────────────────────────────

/// Shape parameters shared by the tile partitioner and the posterior head.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Side length of the (unpadded) square tile in pixels.
    /// Default: 4
    pub tile_slen: usize,
    /// Padding added on every side of a tile. The padded tile has side
    /// `tile_slen + 2 * ptile_pad`.
    /// Default: 3
    pub ptile_pad: usize,
    /// Number of image bands.
    /// Default: 1
    pub n_bands: usize,
    /// Maximum number of sources detected per tile.
    /// Default: 2
    pub max_detections: usize,
    /// Length of the galaxy-shape latent vector.
    /// Default: 8
    pub n_galaxy_params: usize,
    /// Dimension of the per-tile embedding produced by the feature network.
    /// Default: 64
    pub embedding_dim: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            tile_slen: 4,
            ptile_pad: 3,
            n_bands: 1,
            max_detections: 2,
            n_galaxy_params: 8,
            embedding_dim: 64,
        }
    }
}

impl EncoderConfig {
    /// Side length of a padded tile.
    pub fn ptile_slen(&self) -> usize {
        self.tile_slen + 2 * self.ptile_pad
    }

    /// Reject configurations that cannot produce a well-formed posterior.
    pub fn validate(&self) -> Result<()> {
        if self.tile_slen == 0 {
            return Err(BlissError::InvalidConfig("tile_slen must be positive".into()));
        }
        if self.n_bands == 0 {
            return Err(BlissError::InvalidConfig("n_bands must be positive".into()));
        }
        if self.max_detections == 0 {
            return Err(BlissError::InvalidConfig(
                "max_detections must be positive".into(),
            ));
        }
        if self.max_detections > MAX_DETECTIONS_LIMIT {
            return Err(BlissError::PermutationOverflow {
                max_detections: self.max_detections,
                limit: MAX_DETECTIONS_LIMIT,
            });
        }
        if self.embedding_dim == 0 {
            return Err(BlissError::InvalidConfig(
                "embedding_dim must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── Loss configuration ──────────────────────────────────────────────────────

/// Which matching rule the loss engine uses between candidate and true slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LossKind {
    /// Exhaustive search over all `max_detections!` slot permutations.
    #[default]
    PermutationInvariant,
    /// Candidate slot `k` is always matched to true slot `k`.
    FixedOrder,
}

impl FromStr for LossKind {
    type Err = BlissError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permutation_invariant" | "min_perm" | "permutation" => {
                Ok(LossKind::PermutationInvariant)
            }
            "fixed_order" | "identity" => Ok(LossKind::FixedOrder),
            _ => Err(BlissError::UnsupportedLoss(s.to_string())),
        }
    }
}

/// Parameters of the sleep-phase loss.
#[derive(Debug, Clone, PartialEq)]
pub struct LossConfig {
    /// Matching rule. Default: `PermutationInvariant`
    pub kind: LossKind,
    /// Add the galaxy-shape loss to the per-tile total.
    /// Default: true
    pub include_galaxy_params_loss: bool,
    /// Per-tile location losses at or above this value are dropped from the
    /// total (the component itself is still reported).
    /// Default: 1e6
    pub locs_loss_threshold: f64,
    /// Shift applied to the location mean of candidate slots that are off,
    /// so they can never be matched to an on source cheaply.
    /// Default: 1e16
    pub off_slot_loc_shift: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::PermutationInvariant,
            include_galaxy_params_loss: true,
            locs_loss_threshold: 1e6,
            off_slot_loc_shift: 1e16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = EncoderConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ptile_slen(), 10);
    }

    #[test]
    fn test_too_many_detections_rejected() {
        let cfg = EncoderConfig {
            max_detections: 9,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(BlissError::PermutationOverflow {
                max_detections: 9,
                limit: MAX_DETECTIONS_LIMIT
            })
        );
    }

    #[test]
    fn test_zero_tile_rejected() {
        let cfg = EncoderConfig {
            tile_slen: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(BlissError::InvalidConfig(_))));
    }

    #[test]
    fn test_loss_kind_parse() {
        assert_eq!(
            "permutation_invariant".parse::<LossKind>(),
            Ok(LossKind::PermutationInvariant)
        );
        assert_eq!(" Identity ".parse::<LossKind>(), Ok(LossKind::FixedOrder));
        assert_eq!(
            "kl_divergence".parse::<LossKind>(),
            Err(BlissError::UnsupportedLoss("kl_divergence".into()))
        );
    }
}
