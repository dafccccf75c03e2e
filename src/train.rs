//! Thin training driver for the sleep phase.
//!
//! Each epoch draws fresh simulated batches, computes the sleep loss and
//! hands it to an external optimizer. Every `print_every` epochs the driver
//! runs a validation pass on fresh data, logs per-tile averages and, when a
//! checkpoint path is configured, writes the posterior head weights.
//!
//! Gradient computation is not done here: [`ParameterUpdate`] implementations
//! own that.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use tracing::info;

use crate::loss::TileLosses;
use crate::sleep::{SleepPhase, TrainingBatch};

// ── Data ────────────────────────────────────────────────────────────────────

/// Indexed access to simulated training batches.
pub trait BatchSource {
    fn n_batches(&self) -> usize;
    fn get(&mut self, index: usize) -> anyhow::Result<&TrainingBatch>;
    /// Discard current batches so the next `get` draws fresh data.
    fn refresh(&mut self);
}

/// Batches produced on first access by a generator and kept until
/// [`refresh`](BatchSource::refresh).
pub struct MemoizedBatches<F>
where
    F: FnMut(usize) -> anyhow::Result<TrainingBatch>,
{
    n_batches: usize,
    generate: F,
    cache: HashMap<usize, TrainingBatch>,
}

impl<F> MemoizedBatches<F>
where
    F: FnMut(usize) -> anyhow::Result<TrainingBatch>,
{
    pub fn new(n_batches: usize, generate: F) -> Self {
        Self {
            n_batches,
            generate,
            cache: HashMap::new(),
        }
    }

    /// Number of batches currently held.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl<F> BatchSource for MemoizedBatches<F>
where
    F: FnMut(usize) -> anyhow::Result<TrainingBatch>,
{
    fn n_batches(&self) -> usize {
        self.n_batches
    }

    fn get(&mut self, index: usize) -> anyhow::Result<&TrainingBatch> {
        anyhow::ensure!(
            index < self.n_batches,
            "batch index {} out of range (n_batches = {})",
            index,
            self.n_batches
        );
        if !self.cache.contains_key(&index) {
            let batch = (self.generate)(index)
                .with_context(|| format!("Failed to generate batch {index}"))?;
            self.cache.insert(index, batch);
        }
        self.cache
            .get(&index)
            .ok_or_else(|| anyhow::anyhow!("batch {} missing from cache", index))
    }

    fn refresh(&mut self) {
        self.cache.clear();
    }
}

// ── Optimizer seam ──────────────────────────────────────────────────────────

/// External optimizer step. Receives the phase so it can update the head
/// parameters, plus the batch and its losses.
pub trait ParameterUpdate {
    fn step(
        &mut self,
        phase: &mut SleepPhase,
        batch: &TrainingBatch,
        losses: &TileLosses,
    ) -> anyhow::Result<()>;
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Training driver parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    /// Number of epochs. Default: 100
    pub n_epochs: usize,
    /// Run validation (and checkpointing) every this many epochs.
    /// Default: 10
    pub print_every: usize,
    /// Where to write head weights after each validation pass.
    /// Default: None
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_epochs: 100,
            print_every: 10,
            checkpoint_path: None,
        }
    }
}

/// Averages over one pass through the batches.
///
/// `loss` is the mean of the batch totals; the components are averaged over
/// every tile seen in the pass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EpochSummary {
    pub epoch: usize,
    pub loss: f64,
    pub counter_loss: f64,
    pub locs_loss: f64,
    pub galaxy_params_loss: f64,
    pub star_params_loss: f64,
    pub galaxy_bool_loss: f64,
    pub n_tiles: usize,
}

#[derive(Default)]
struct SummaryAccumulator {
    loss: f64,
    n_batches: usize,
    counter: f64,
    locs: f64,
    galaxy_params: f64,
    star_params: f64,
    galaxy_bool: f64,
    n_tiles: usize,
}

impl SummaryAccumulator {
    fn add(&mut self, losses: &TileLosses) {
        self.loss += losses.total;
        self.n_batches += 1;
        self.counter += losses.counter.sum();
        self.locs += losses.locs.sum();
        self.galaxy_params += losses.galaxy_params.sum();
        self.star_params += losses.star_params.sum();
        self.galaxy_bool += losses.galaxy_bool.sum();
        self.n_tiles += losses.per_tile.len();
    }

    fn finish(self, epoch: usize) -> EpochSummary {
        let nb = self.n_batches.max(1) as f64;
        let nt = self.n_tiles.max(1) as f64;
        EpochSummary {
            epoch,
            loss: self.loss / nb,
            counter_loss: self.counter / nt,
            locs_loss: self.locs / nt,
            galaxy_params_loss: self.galaxy_params / nt,
            star_params_loss: self.star_params / nt,
            galaxy_bool_loss: self.galaxy_bool / nt,
            n_tiles: self.n_tiles,
        }
    }
}

/// Per-epoch training and validation summaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    pub train: Vec<EpochSummary>,
    pub validation: Vec<EpochSummary>,
}

/// Drives the sleep phase across epochs.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainConfig,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// One pass over all batches with optimizer steps.
    pub fn train_epoch(
        &self,
        phase: &mut SleepPhase,
        source: &mut dyn BatchSource,
        optimizer: &mut dyn ParameterUpdate,
        epoch: usize,
    ) -> anyhow::Result<EpochSummary> {
        let mut acc = SummaryAccumulator::default();
        for i in 0..source.n_batches() {
            let batch = source.get(i)?;
            let losses = phase
                .compute_loss(batch)
                .with_context(|| format!("Loss failed on batch {i} of epoch {epoch}"))?;
            optimizer.step(phase, batch, &losses)?;
            acc.add(&losses);
        }
        Ok(acc.finish(epoch))
    }

    /// One pass over all batches without parameter updates.
    pub fn evaluate(
        &self,
        phase: &SleepPhase,
        source: &mut dyn BatchSource,
        epoch: usize,
    ) -> anyhow::Result<EpochSummary> {
        let mut acc = SummaryAccumulator::default();
        for i in 0..source.n_batches() {
            let batch = source.get(i)?;
            let losses = phase
                .compute_loss(batch)
                .with_context(|| format!("Validation loss failed on batch {i}"))?;
            acc.add(&losses);
        }
        Ok(acc.finish(epoch))
    }

    /// Train for `n_epochs`, drawing fresh data each epoch.
    pub fn fit(
        &self,
        phase: &mut SleepPhase,
        source: &mut dyn BatchSource,
        optimizer: &mut dyn ParameterUpdate,
    ) -> anyhow::Result<TrainingHistory> {
        anyhow::ensure!(self.config.print_every > 0, "print_every must be positive");
        let mut history = TrainingHistory::default();

        for epoch in 0..self.config.n_epochs {
            let t0 = Instant::now();
            source.refresh();
            let s = self.train_epoch(phase, source, optimizer, epoch)?;
            info!(
                "[{}] loss: {:.4}; counter loss: {:.4}; locs loss: {:.4}; star params loss: {:.4}; galaxy bool loss: {:.4} [{:.1} s]",
                epoch,
                s.loss,
                s.counter_loss,
                s.locs_loss,
                s.star_params_loss,
                s.galaxy_bool_loss,
                t0.elapsed().as_secs_f32()
            );
            history.train.push(s);

            if epoch % self.config.print_every == 0 {
                source.refresh();
                let v = self.evaluate(phase, source, epoch)?;
                info!(
                    "**** validation loss: {:.4}; counter loss: {:.4}; locs loss: {:.4}; galaxy params loss: {:.4} ****",
                    v.loss, v.counter_loss, v.locs_loss, v.galaxy_params_loss
                );
                history.validation.push(v);

                if let Some(path) = &self.config.checkpoint_path {
                    phase.encoder().head().weights().save_to_file(path)?;
                }
            }
        }
        Ok(history)
    }
}
