//! Caller and aligner plugin contracts, plus the built-in implementations.
//!
//! Both contracts are deliberately narrow. A [`Caller`] turns raw signal
//! chunks into [`ReadRecord`]s with `seq` (and optionally `barcode`) filled.
//! An [`Aligner`] annotates those records with alignments and a [`Decision`].
//! Both may drop or reorder records freely; the decision engine treats every
//! record independently and never assumes input order survived.
//!
//! Plugins are selected by name in the configuration
//! (`[caller_settings.<name>]` / `[mapper_settings.<name>]`) and built
//! through [`build_caller`] / [`build_aligner`]. Unknown names fail
//! validation with the list of known plugins. Initialisation failures (bad
//! paths, malformed tables) surface before the main loop starts.

pub mod decide;
pub mod lookup;
pub mod no_op;

use std::path::PathBuf;

use core_config::{Conf, ConfigError, PluginConf, SharedConf};
use core_model::{Calibration, RawChunk, ReadRecord, SignalDtype};
use thiserror::Error;

pub use decide::assign_decision;
pub use lookup::{LookupAligner, LookupCaller};
pub use no_op::{NoOpAligner, NoOpCaller};

/// Caller plugin names accepted by the registry.
pub const BUILTIN_CALLERS: &[&str] = &["no_op", "lookup"];
/// Aligner plugin names accepted by the registry.
pub const BUILTIN_ALIGNERS: &[&str] = &["no_op", "lookup"];

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown {kind} plugin {name:?}; known plugins: {known:?}")]
    UnknownPlugin {
        kind: &'static str,
        name: String,
        known: &'static [&'static str],
    },
    #[error("plugin {plugin:?} requires the {key:?} setting")]
    MissingParameter { plugin: String, key: &'static str },
    #[error("plugin {plugin:?} could not read {path}: {source}")]
    Io {
        plugin: String,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("plugin {plugin:?}: bad record in {path} at line {line}: {reason}")]
    BadRecord {
        plugin: String,
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Boxed record stream produced and consumed by the pipeline stages.
pub type RecordStream<'a> = Box<dyn Iterator<Item = ReadRecord> + 'a>;

/// Transforms raw chunks into base-called records.
///
/// Implementations may drop chunks (their own queues full, id unknown to a
/// playback table); dropped chunks simply never appear in the output. An
/// empty `seq` is a legal output and classifies as `no_seq` downstream.
pub trait Caller: Send + std::fmt::Debug {
    fn basecall<'a>(
        &'a mut self,
        chunks: Vec<(u32, RawChunk)>,
        dtype: SignalDtype,
        calibration: &'a [Calibration],
    ) -> RecordStream<'a>;

    /// Startup description for the run log.
    fn describe(&self) -> String;

    /// Called once after the main loop finishes.
    fn disconnect(&mut self) {}
}

/// Annotates base-called records with alignments and a decision.
pub trait Aligner: Send {
    /// False while the aligner has no usable index; the main loop waits on
    /// this and will not feed records until it is true.
    fn initialised(&self) -> bool;

    fn map_reads<'a>(&'a mut self, calls: RecordStream<'a>) -> RecordStream<'a>;

    /// Startup description covering the configured regions and barcodes.
    fn describe(&self, conf: &Conf) -> String;

    /// Called once after the main loop finishes.
    fn disconnect(&mut self) {}
}

/// Build the configured caller plugin.
pub fn build_caller(settings: &PluginConf) -> Result<Box<dyn Caller>, PluginError> {
    match settings.name.as_str() {
        "no_op" => Ok(Box::new(NoOpCaller::new())),
        "lookup" => Ok(Box::new(LookupCaller::from_settings(settings)?)),
        other => Err(PluginError::UnknownPlugin {
            kind: "caller",
            name: other.to_string(),
            known: BUILTIN_CALLERS,
        }),
    }
}

/// Build the configured aligner plugin. The shared configuration handle is
/// how decision assignment sees hot-reloaded targets without re-indexing.
pub fn build_aligner(
    settings: &PluginConf,
    conf: &SharedConf,
) -> Result<Box<dyn Aligner>, PluginError> {
    match settings.name.as_str() {
        "no_op" => Ok(Box::new(NoOpAligner::new())),
        "lookup" => Ok(Box::new(LookupAligner::from_settings(settings, conf.clone())?)),
        other => Err(PluginError::UnknownPlugin {
            kind: "aligner",
            name: other.to_string(),
            known: BUILTIN_ALIGNERS,
        }),
    }
}
