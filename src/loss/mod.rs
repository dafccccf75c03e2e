//! Assignment-invariant sleep-phase loss.
//!
//! The true sources of a tile come in no particular order, so the loss is
//! evaluated under every bijection between candidate slots and true slots:
//!
//! 1. **Combinations**: Gaussian log-density of every true slot under every
//!    candidate slot, per parameter group (`[n_tiles, max, max]`).
//! 2. **Permutations**: for each permutation σ, sum `combs[σ(k), k]` over the
//!    on true slots `k`. Galaxy-shape terms count only for true galaxies,
//!    flux terms only for true stars; the galaxy-probability term counts for
//!    every on source.
//! 3. **Selection**: per tile, the permutation with the smallest location
//!    loss. Only the location loss decides the matching; the other groups are
//!    read off at the chosen permutation. Ties go to the first permutation in
//!    lexicographic order.
//! 4. **Assembly**: count cross-entropy plus the selected components, with
//!    pathological location losses dropped, averaged over tiles.
//!
//! Everything is computed for all tiles at once; nothing is kept between
//! calls.

pub mod log_prob;
pub mod permutations;

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use tracing::{debug, warn};

use crate::config::{LossConfig, LossKind};
use crate::error::{BlissError, Result};
use crate::posterior::TilePosterior;

use self::log_prob::log_probs_all_combs;
pub use self::permutations::{inverse, permute_slots, LexicographicPermutations, PermutationTable};

// ── On/off masks ────────────────────────────────────────────────────────────

/// `is_on[t, k] = k < n_sources[t]`, shape `[n_tiles, max_detections]`.
pub fn is_on_from_n_sources(n_sources: ArrayView1<usize>, max_detections: usize) -> Array2<bool> {
    Array2::from_shape_fn((n_sources.len(), max_detections), |(t, k)| k < n_sources[t])
}

/// Same as [`is_on_from_n_sources`] for a `[n_samples, n_tiles]` grid of counts.
pub fn is_on_from_n_sources_2d(n_sources: ArrayView2<usize>, max_detections: usize) -> Array3<bool> {
    let (a, b) = n_sources.dim();
    Array3::from_shape_fn((a, b, max_detections), |(i, t, k)| k < n_sources[[i, t]])
}

fn as_float(mask: &Array2<bool>) -> Array2<f64> {
    mask.mapv(|b| if b { 1.0 } else { 0.0 })
}

// ── Ground truth ────────────────────────────────────────────────────────────

/// True sources of each tile, in no particular slot order. Off slots hold
/// zeros.
#[derive(Debug, Clone, PartialEq)]
pub struct TrueTileSources {
    /// `[n_tiles]`
    pub n_sources: Array1<usize>,
    /// Tile-relative (row, col), `[n_tiles, max, 2]`.
    pub locs: Array3<f64>,
    /// `[n_tiles, max, n_galaxy_params]`
    pub galaxy_params: Array3<f64>,
    /// `[n_tiles, max, n_bands]`
    pub log_fluxes: Array3<f64>,
    /// `[n_tiles, max]`
    pub galaxy_bool: Array2<bool>,
}

impl TrueTileSources {
    pub fn n_tiles(&self) -> usize {
        self.n_sources.len()
    }

    pub fn max_detections(&self) -> usize {
        self.galaxy_bool.ncols()
    }

    pub fn is_on(&self) -> Array2<bool> {
        is_on_from_n_sources(self.n_sources.view(), self.max_detections())
    }

    fn check_against(&self, pred: &TilePosterior) -> Result<()> {
        let n = pred.n_tiles();
        let m = pred.max_detections();
        if self.n_tiles() != n || self.galaxy_bool.dim() != (n, m) {
            return Err(BlissError::shape(
                "true sources (n_tiles, max_detections)",
                (n, m),
                self.galaxy_bool.dim(),
            ));
        }
        if self.locs.dim() != pred.loc_mean.dim() {
            return Err(BlissError::shape("true locs", pred.loc_mean.dim(), self.locs.dim()));
        }
        if self.galaxy_params.dim() != pred.galaxy_param_mean.dim() {
            return Err(BlissError::shape(
                "true galaxy params",
                pred.galaxy_param_mean.dim(),
                self.galaxy_params.dim(),
            ));
        }
        if self.log_fluxes.dim() != pred.log_flux_mean.dim() {
            return Err(BlissError::shape(
                "true log fluxes",
                pred.log_flux_mean.dim(),
                self.log_fluxes.dim(),
            ));
        }
        if let Some(&bad) = self.n_sources.iter().find(|&&c| c > m) {
            return Err(BlissError::shape("true source count", format!("<= {m}"), bad));
        }
        Ok(())
    }
}

// ── Intermediate stages ─────────────────────────────────────────────────────

/// Candidate × truth log-densities, `[n_tiles, max, max]` per group.
#[derive(Debug, Clone)]
pub struct CombinationLogProbs {
    pub locs: Array3<f64>,
    pub galaxy_params: Array3<f64>,
    pub star_params: Array3<f64>,
}

/// Log-probabilities under each permutation, `[n_tiles, n_permutations]`.
#[derive(Debug, Clone)]
pub struct PermutationLogProbs {
    pub locs: Array2<f64>,
    pub galaxy_params: Array2<f64>,
    pub star_params: Array2<f64>,
    pub galaxy_bool: Array2<f64>,
}

/// Per-tile loss components at the selected permutation, plus the mean total.
#[derive(Debug, Clone, PartialEq)]
pub struct TileLosses {
    /// Mean over tiles of `per_tile`.
    pub total: f64,
    pub per_tile: Array1<f64>,
    pub counter: Array1<f64>,
    pub locs: Array1<f64>,
    pub galaxy_params: Array1<f64>,
    pub star_params: Array1<f64>,
    pub galaxy_bool: Array1<f64>,
}

// ── Matching strategy ───────────────────────────────────────────────────────

/// Matching rule bound at construction from a [`LossKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchingStrategy {
    /// Search all slot permutations.
    Permutations(PermutationTable),
    /// Only the identity matching.
    FixedOrder(PermutationTable),
}

impl MatchingStrategy {
    pub fn from_kind(kind: LossKind, max_detections: usize) -> Result<Self> {
        match kind {
            LossKind::PermutationInvariant => {
                Ok(MatchingStrategy::Permutations(PermutationTable::new(max_detections)?))
            }
            LossKind::FixedOrder => Ok(MatchingStrategy::FixedOrder(PermutationTable::identity(
                max_detections,
            ))),
        }
    }

    /// Permutations searched by this strategy.
    pub fn table(&self) -> &PermutationTable {
        match self {
            MatchingStrategy::Permutations(t) | MatchingStrategy::FixedOrder(t) => t,
        }
    }
}

// ── Loss engine ─────────────────────────────────────────────────────────────

/// Computes the sleep-phase loss of a posterior against true tile sources.
#[derive(Debug, Clone)]
pub struct LossEngine {
    config: LossConfig,
    max_detections: usize,
    strategy: MatchingStrategy,
}

impl LossEngine {
    pub fn new(config: LossConfig, max_detections: usize) -> Result<Self> {
        let strategy = MatchingStrategy::from_kind(config.kind, max_detections)?;
        debug!(
            "Loss engine: {:?}, max_detections {}, {} permutations",
            config.kind,
            max_detections,
            strategy.table().len()
        );
        Ok(Self {
            config,
            max_detections,
            strategy,
        })
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    pub fn max_detections(&self) -> usize {
        self.max_detections
    }

    pub fn strategy(&self) -> &MatchingStrategy {
        &self.strategy
    }

    /// Step 1: log-densities of every (candidate, truth) pair.
    ///
    /// Candidate slots that are off get their location mean pushed out by
    /// `off_slot_loc_shift`.
    pub fn combination_log_probs(
        &self,
        pred: &TilePosterior,
        truth: &TrueTileSources,
    ) -> Result<CombinationLogProbs> {
        if pred.max_detections() != self.max_detections {
            return Err(BlissError::shape(
                "posterior max_detections",
                self.max_detections,
                pred.max_detections(),
            ));
        }
        truth.check_against(pred)?;

        let off = as_float(&truth.is_on()).mapv(|on| 1.0 - on).insert_axis(Axis(2));
        let loc_mean = &pred.loc_mean + &(off * self.config.off_slot_loc_shift);

        Ok(CombinationLogProbs {
            locs: log_probs_all_combs(truth.locs.view(), loc_mean.view(), pred.loc_logvar.view())?,
            galaxy_params: log_probs_all_combs(
                truth.galaxy_params.view(),
                pred.galaxy_param_mean.view(),
                pred.galaxy_param_logvar.view(),
            )?,
            star_params: log_probs_all_combs(
                truth.log_fluxes.view(),
                pred.log_flux_mean.view(),
                pred.log_flux_logvar.view(),
            )?,
        })
    }

    /// Step 2: sum the matched entries of every permutation, with masks.
    ///
    /// Fails if `prob_galaxy` or the combination tensors do not cover
    /// `[n_tiles, max_detections]`.
    pub fn permutation_log_probs(
        &self,
        combs: &CombinationLogProbs,
        prob_galaxy: ArrayView2<f64>,
        truth: &TrueTileSources,
    ) -> Result<PermutationLogProbs> {
        let table = self.strategy.table();
        let n_tiles = truth.n_tiles();
        let n_perms = table.len();
        let m = self.max_detections;
        if truth.max_detections() != m {
            return Err(BlissError::shape(
                "true sources max_detections",
                m,
                truth.max_detections(),
            ));
        }
        if prob_galaxy.dim() != (n_tiles, m) {
            return Err(BlissError::shape(
                "galaxy probabilities",
                (n_tiles, m),
                prob_galaxy.dim(),
            ));
        }
        for (what, c) in [
            ("location combinations", &combs.locs),
            ("galaxy param combinations", &combs.galaxy_params),
            ("star param combinations", &combs.star_params),
        ] {
            if c.dim() != (n_tiles, m, m) {
                return Err(BlissError::shape(what, (n_tiles, m, m), c.dim()));
            }
        }

        let is_on = as_float(&truth.is_on());
        let gal = as_float(&truth.galaxy_bool);
        let on_gal = &is_on * &gal;
        let on_star = &is_on * &gal.mapv(|g| 1.0 - g);

        // Bernoulli log-likelihood of the true type under candidate i for true
        // slot k, independent of the matching: [n_tiles, cand, truth].
        let log_p = prob_galaxy.mapv(f64::ln);
        let log_1mp = prob_galaxy.mapv(|p| (1.0 - p).ln());

        let mut out = PermutationLogProbs {
            locs: Array2::zeros((n_tiles, n_perms)),
            galaxy_params: Array2::zeros((n_tiles, n_perms)),
            star_params: Array2::zeros((n_tiles, n_perms)),
            galaxy_bool: Array2::zeros((n_tiles, n_perms)),
        };

        for (p, perm) in table.iter().enumerate() {
            let mut locs = out.locs.column_mut(p);
            for (k, &cand) in perm.iter().enumerate() {
                locs += &(&combs.locs.slice(s![.., cand, k]) * &is_on.column(k));
            }
            let mut gp = out.galaxy_params.column_mut(p);
            for (k, &cand) in perm.iter().enumerate() {
                gp += &(&combs.galaxy_params.slice(s![.., cand, k]) * &on_gal.column(k));
            }
            let mut sp = out.star_params.column_mut(p);
            for (k, &cand) in perm.iter().enumerate() {
                sp += &(&combs.star_params.slice(s![.., cand, k]) * &on_star.column(k));
            }
            let mut gb = out.galaxy_bool.column_mut(p);
            for (k, &cand) in perm.iter().enumerate() {
                let ll = &(&gal.column(k) * &log_p.column(cand))
                    + &(&gal.column(k).mapv(|g| 1.0 - g) * &log_1mp.column(cand));
                gb += &(&ll * &is_on.column(k));
            }
        }
        Ok(out)
    }

    /// Step 3: index of the permutation with the smallest location loss,
    /// per tile. The first minimum wins.
    pub fn select_permutations(&self, perm_log_probs: &PermutationLogProbs) -> Array1<usize> {
        perm_log_probs
            .locs
            .rows()
            .into_iter()
            .map(|row| {
                let mut best = 0;
                let mut best_loss = f64::INFINITY;
                for (p, &lp) in row.iter().enumerate() {
                    if -lp < best_loss {
                        best_loss = -lp;
                        best = p;
                    }
                }
                best
            })
            .collect()
    }

    /// Full loss: steps 1 through 4.
    pub fn compute(&self, pred: &TilePosterior, truth: &TrueTileSources) -> Result<TileLosses> {
        let combs = self.combination_log_probs(pred, truth)?;
        let perm_lp = self.permutation_log_probs(&combs, pred.prob_galaxy.view(), truth)?;
        let selected = self.select_permutations(&perm_lp);

        let n_tiles = truth.n_tiles();
        let gather = |m: &Array2<f64>| -> Array1<f64> {
            Array1::from_shape_fn(n_tiles, |t| -m[[t, selected[t]]])
        };
        let locs = gather(&perm_lp.locs);
        let galaxy_params = gather(&perm_lp.galaxy_params);
        let star_params = gather(&perm_lp.star_params);
        let galaxy_bool = gather(&perm_lp.galaxy_bool);

        // Count cross-entropy. The log-probs are already normalized.
        let counter = Array1::from_shape_fn(n_tiles, |t| {
            -pred.n_source_log_probs[[t, truth.n_sources[t]]]
        });

        let threshold = self.config.locs_loss_threshold;
        let n_dropped = locs.iter().filter(|&&l| l >= threshold || l.is_nan()).count();
        if n_dropped > 0 {
            warn!(
                "{} of {} tiles have location loss >= {:e}; excluded from total",
                n_dropped, n_tiles, threshold
            );
        }

        let mut per_tile = &counter + &star_params + &galaxy_bool;
        per_tile += &locs.mapv(|l| if l < threshold { l } else { 0.0 });
        if self.config.include_galaxy_params_loss {
            per_tile += &galaxy_params;
        }

        let total = per_tile.mean().unwrap_or(0.0);
        debug!("Sleep loss over {} tiles: {:.4}", n_tiles, total);

        Ok(TileLosses {
            total,
            per_tile,
            counter,
            locs,
            galaxy_params,
            star_params,
            galaxy_bool,
        })
    }
}
