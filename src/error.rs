//! Error taxonomy for the encoder, loss engine and catalog stitcher.
//!
//! Every error surfaces synchronously to the caller; nothing in this crate
//! retries. Degenerate variances are not an error: they are prevented by the
//! variance floor in [`crate::posterior`].

use thiserror::Error;

/// Errors produced by the tiling, posterior and loss computations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlissError {
    /// Array shapes disagree (image not divisible by the tile length,
    /// predicted vs. true parameter groups, batch layout, ...).
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },

    /// `max_detections` is too large for exhaustive permutation matching.
    #[error("max_detections = {max_detections} exceeds the permutation limit of {limit}")]
    PermutationOverflow { max_detections: usize, limit: usize },

    /// A loss selector that does not name a known loss.
    #[error("unsupported loss selector: {0:?}")]
    UnsupportedLoss(String),

    /// Inconsistent configuration, rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BlissError {
    pub(crate) fn shape(
        context: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        BlissError::ShapeMismatch {
            context,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, BlissError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_message() {
        let e = BlissError::shape("partition", (20, 20), (21, 20));
        let msg = e.to_string();
        assert!(msg.contains("partition"));
        assert!(msg.contains("(20, 20)"));
        assert!(msg.contains("(21, 20)"));
    }

    #[test]
    fn test_overflow_message() {
        let e = BlissError::PermutationOverflow {
            max_detections: 9,
            limit: 8,
        };
        assert_eq!(
            e.to_string(),
            "max_detections = 9 exceeds the permutation limit of 8"
        );
    }
}
