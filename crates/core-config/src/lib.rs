//! Experiment configuration: conditions, channel assignment, plugin settings.
//!
//! A configuration document has four top-level sections:
//!
//! ```toml
//! [caller_settings.<plugin>]   # arbitrary key/value parameters
//! [mapper_settings.<plugin>]   # arbitrary key/value parameters
//! [[regions]]                  # ordered; each is a geometric channel block
//! [barcodes.<label>]           # keyed by barcode label
//! ```
//!
//! Regions and barcodes share one shape ([`Condition`]): a named policy
//! mapping the six alignment decisions to actions, plus chunk bounds and the
//! synthetic-bound action selectors. Loading validates everything up front; a
//! misconfigured run is worse than no run, so nothing here is lenient.
//!
//! The loaded [`Conf`] is immutable. Hot reload goes through [`SharedConf`],
//! which atomically replaces the whole configuration on success and leaves it
//! untouched on failure; readers observe either the old or the new value,
//! never a torn one.

pub mod flowcell;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use core_model::{Action, Decision};
use core_targets::{TargetError, TargetSpec, Targets};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{info, warn};

pub use flowcell::SplitAxis;

/// Barcode label the caller assigns when demultiplexing fails.
pub const UNCLASSIFIED: &str = "unclassified";
/// Fallback table for any barcode label without its own entry.
pub const CLASSIFIED: &str = "classified";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("could not serialise configuration: {0}")]
    Serialise(#[from] toml::ser::Error),
    #[error(transparent)]
    Targets(#[from] TargetError),
    #[error(
        "configuration needs at least one region, or both `{CLASSIFIED}` and \
         `{UNCLASSIFIED}` barcode tables"
    )]
    MissingConditions,
    #[error(
        "barcode tables are configured, so the reserved `{CLASSIFIED}` and \
         `{UNCLASSIFIED}` tables must both be present"
    )]
    MissingReservedBarcodes,
    #[error("condition {name:?}: min_chunks ({min}) must be >= 1 and <= max_chunks ({max})")]
    ChunkBounds { name: String, min: u32, max: u32 },
    #[error("flow-cell size {0} is not recognised (expected 126, 512, or 3000 channels)")]
    UnknownFlowcell(usize),
    #[error("channel {channel} is outside the flow cell (1..={channels})")]
    ChannelOutOfRange { channel: usize, channels: usize },
    #[error(
        "cannot split {axis_len} grid lines into {split} regions; valid region counts: {divisors:?}"
    )]
    UnevenSplit {
        split: usize,
        axis_len: usize,
        divisors: Vec<usize>,
    },
    #[error("no region or barcode condition for channel {channel} (barcode {barcode:?})")]
    NoCondition {
        channel: u32,
        barcode: Option<String>,
    },
}

/// One plugin settings table: the single sub-table name selects the plugin,
/// its contents are passed through as opaque parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginConf {
    pub name: String,
    pub parameters: toml::Table,
}

impl PluginConf {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: toml::Table::new(),
        }
    }

    /// String parameter lookup, `None` when absent or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

impl<'de> Deserialize<'de> for PluginConf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, toml::Table>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(D::Error::custom(format!(
                "expected exactly one plugin table, found {}",
                map.len()
            )));
        }
        let (name, parameters) = map
            .into_iter()
            .next()
            .ok_or_else(|| D::Error::custom("expected exactly one plugin table"))?;
        Ok(Self { name, parameters })
    }
}

impl Serialize for PluginConf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = BTreeMap::new();
        map.insert(&self.name, &self.parameters);
        map.serialize(serializer)
    }
}

fn default_min_chunks() -> u32 {
    1
}

fn default_max_chunks() -> u32 {
    2
}

fn default_below_min_chunks() -> Action {
    Action::Proceed
}

fn default_above_max_chunks() -> Action {
    Action::Unblock
}

/// On-disk shape of a region or barcode table. The six decision fields are
/// required; everything else has the documented default.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConditionFile {
    name: String,
    #[serde(default)]
    control: bool,
    #[serde(default = "default_min_chunks")]
    min_chunks: u32,
    #[serde(default = "default_max_chunks")]
    max_chunks: u32,
    #[serde(default)]
    targets: TargetSpec,
    single_on: Action,
    single_off: Action,
    multi_on: Action,
    multi_off: Action,
    no_map: Action,
    no_seq: Action,
    #[serde(default = "default_below_min_chunks")]
    below_min_chunks: Action,
    #[serde(default = "default_above_max_chunks")]
    above_max_chunks: Action,
}

/// A named policy: the action to take for each decision, chunk bounds, and
/// the target index the aligner classifies against. Used both for regions
/// (blocks of channels) and barcodes (labels from the caller).
#[derive(Debug, Clone)]
pub struct Condition {
    pub name: String,
    pub control: bool,
    pub min_chunks: u32,
    pub max_chunks: u32,
    /// Raw targets value, retained so serialisation round-trips.
    pub target_spec: TargetSpec,
    pub targets: Targets,
    pub single_on: Action,
    pub single_off: Action,
    pub multi_on: Action,
    pub multi_off: Action,
    pub no_map: Action,
    pub no_seq: Action,
    pub below_min_chunks: Action,
    pub above_max_chunks: Action,
}

impl Condition {
    fn from_file(file: ConditionFile) -> Result<Self, ConfigError> {
        if file.min_chunks == 0 || file.min_chunks > file.max_chunks {
            return Err(ConfigError::ChunkBounds {
                name: file.name,
                min: file.min_chunks,
                max: file.max_chunks,
            });
        }
        let targets = Targets::from_spec(&file.targets)?;
        Ok(Self {
            name: file.name,
            control: file.control,
            min_chunks: file.min_chunks,
            max_chunks: file.max_chunks,
            target_spec: file.targets,
            targets,
            single_on: file.single_on,
            single_off: file.single_off,
            multi_on: file.multi_on,
            multi_off: file.multi_off,
            no_map: file.no_map,
            no_seq: file.no_seq,
            below_min_chunks: file.below_min_chunks,
            above_max_chunks: file.above_max_chunks,
        })
    }

    fn to_file(&self) -> ConditionFile {
        ConditionFile {
            name: self.name.clone(),
            control: self.control,
            min_chunks: self.min_chunks,
            max_chunks: self.max_chunks,
            targets: self.target_spec.clone(),
            single_on: self.single_on,
            single_off: self.single_off,
            multi_on: self.multi_on,
            multi_off: self.multi_off,
            no_map: self.no_map,
            no_seq: self.no_seq,
            below_min_chunks: self.below_min_chunks,
            above_max_chunks: self.above_max_chunks,
        }
    }

    /// Table lookup from decision to the configured action.
    pub fn get_action(&self, decision: Decision) -> Action {
        match decision {
            Decision::SingleOn => self.single_on,
            Decision::SingleOff => self.single_off,
            Decision::MultiOn => self.multi_on,
            Decision::MultiOff => self.multi_off,
            Decision::NoMap => self.no_map,
            Decision::NoSeq => self.no_seq,
            Decision::AboveMaxChunks => self.above_max_chunks,
            Decision::BelowMinChunks => self.below_min_chunks,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ConfFile {
    caller_settings: PluginConf,
    mapper_settings: PluginConf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    regions: Vec<ConditionFile>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    barcodes: BTreeMap<String, ConditionFile>,
}

/// The loaded, validated experiment configuration.
#[derive(Debug)]
pub struct Conf {
    /// Flow-cell channel count, supplied by the sequencer, never the file.
    pub channels: usize,
    pub caller_settings: PluginConf,
    pub mapper_settings: PluginConf,
    pub regions: Vec<Condition>,
    pub barcodes: BTreeMap<String, Condition>,
    /// Region index per channel (1-based; index 0 unused). Empty when there
    /// are no regions.
    channel_map: Vec<usize>,
}

impl Conf {
    pub fn from_file(path: &Path, channels: usize) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&text, channels)
    }

    pub fn from_str(text: &str, channels: usize) -> Result<Self, ConfigError> {
        let file: ConfFile = toml::from_str(text)?;
        Self::from_parts(file, channels)
    }

    fn from_parts(file: ConfFile, channels: usize) -> Result<Self, ConfigError> {
        let regions = file
            .regions
            .into_iter()
            .map(Condition::from_file)
            .collect::<Result<Vec<_>, _>>()?;
        let barcodes = file
            .barcodes
            .into_iter()
            .map(|(label, cond)| Ok((label, Condition::from_file(cond)?)))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;

        let has_reserved =
            barcodes.contains_key(CLASSIFIED) && barcodes.contains_key(UNCLASSIFIED);
        if regions.is_empty() && !has_reserved {
            return Err(ConfigError::MissingConditions);
        }
        if !barcodes.is_empty() && !has_reserved {
            return Err(ConfigError::MissingReservedBarcodes);
        }

        let channel_map = if regions.is_empty() {
            Vec::new()
        } else {
            flowcell::channel_regions(channels, regions.len(), SplitAxis::default())?
        };

        Ok(Self {
            channels,
            caller_settings: file.caller_settings,
            mapper_settings: file.mapper_settings,
            regions,
            barcodes,
            channel_map,
        })
    }

    /// Serialise back to the TOML document shape accepted by `from_str`.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        let file = ConfFile {
            caller_settings: self.caller_settings.clone(),
            mapper_settings: self.mapper_settings.clone(),
            regions: self.regions.iter().map(Condition::to_file).collect(),
            barcodes: self
                .barcodes
                .iter()
                .map(|(label, cond)| (label.clone(), cond.to_file()))
                .collect(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Region condition owning `channel`, if regions are configured and the
    /// channel lies on the flow cell.
    pub fn get_region(&self, channel: u32) -> Option<&Condition> {
        if channel == 0 {
            return None;
        }
        let index = *self.channel_map.get(channel as usize)?;
        self.regions.get(index)
    }

    /// Region index per channel, for observability snapshots.
    pub fn region_index(&self, channel: u32) -> Option<usize> {
        self.channel_map.get(channel as usize).copied()
    }

    /// Barcode condition for a label. Unknown labels fall back to the
    /// `classified` table; `unclassified` is reserved for reads the caller
    /// itself failed to demultiplex and resolves to its own table.
    pub fn get_barcode(&self, barcode: Option<&str>) -> Option<&Condition> {
        let label = barcode?;
        self.barcodes
            .get(label)
            .or_else(|| self.barcodes.get(CLASSIFIED))
    }

    /// Resolve the condition governing a read. When both a region and a
    /// barcode apply the barcode supplies the condition and the control flag
    /// is the OR of the two.
    pub fn get_conditions(
        &self,
        channel: u32,
        barcode: Option<&str>,
    ) -> Result<(bool, &Condition), ConfigError> {
        let region = self.get_region(channel);
        let barcode_cond = self.get_barcode(barcode);
        match (region, barcode_cond) {
            (Some(region), Some(bc)) => Ok((region.control || bc.control, bc)),
            (Some(region), None) => Ok((region.control, region)),
            (None, Some(bc)) => Ok((bc.control, bc)),
            (None, None) => Err(ConfigError::NoCondition {
                channel,
                barcode: barcode.map(str::to_string),
            }),
        }
    }

    /// Targets of whichever condition wins for `(channel, barcode)`.
    pub fn get_targets(
        &self,
        channel: u32,
        barcode: Option<&str>,
    ) -> Result<&Targets, ConfigError> {
        self.get_conditions(channel, barcode)
            .map(|(_, condition)| &condition.targets)
    }

    /// Channels assigned to region `index`, ascending.
    pub fn region_channels(&self, index: usize) -> Vec<u32> {
        self.channel_map
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(_, &region)| region == index)
            .map(|(channel, _)| channel as u32)
            .collect()
    }

    /// Write the channel→region assignment snapshot (`channels.toml`).
    pub fn write_channels_snapshot(&self, path: &Path) -> Result<(), ConfigError> {
        let mut conditions = toml::Table::new();
        for (index, region) in self.regions.iter().enumerate() {
            let mut entry = toml::Table::new();
            entry.insert("name".into(), toml::Value::String(region.name.clone()));
            entry.insert(
                "channels".into(),
                toml::Value::Array(
                    self.region_channels(index)
                        .into_iter()
                        .map(|c| toml::Value::Integer(c as i64))
                        .collect(),
                ),
            );
            conditions.insert(index.to_string(), toml::Value::Table(entry));
        }
        let mut doc = toml::Table::new();
        doc.insert("conditions".into(), toml::Value::Table(conditions));
        let body = toml::to_string_pretty(&doc)?;
        let text = format!(
            "# Condition assigned to each channel for this run.\n\
             # Rewritten on restart; do not edit.\n{body}"
        );
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Atomically replaceable handle to the current [`Conf`].
///
/// The decision path reads, the reload path writes; a reload never interrupts
/// an in-flight iteration because readers clone the inner `Arc` once per
/// batch and keep using it.
#[derive(Clone, Debug)]
pub struct SharedConf {
    inner: Arc<RwLock<Arc<Conf>>>,
}

impl SharedConf {
    pub fn new(conf: Conf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(conf))),
        }
    }

    /// Current configuration. Cheap; hold the returned `Arc` for the whole
    /// iteration rather than re-loading per read.
    pub fn load(&self) -> Arc<Conf> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, conf: Conf) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(conf);
    }

    /// Parse `path` and install the result. On failure the current
    /// configuration is left untouched and the error is returned after being
    /// logged; on success the newly installed configuration is returned.
    pub fn reload_from_file(
        &self,
        path: &Path,
        channels: usize,
    ) -> Result<Arc<Conf>, ConfigError> {
        match Conf::from_file(path, channels) {
            Ok(conf) => {
                self.replace(conf);
                let installed = self.load();
                info!(
                    target: "config",
                    path = %path.display(),
                    regions = installed.regions.len(),
                    barcodes = installed.barcodes.len(),
                    "configuration_reloaded"
                );
                Ok(installed)
            }
            Err(err) => {
                warn!(
                    target: "config",
                    path = %path.display(),
                    error = %err,
                    "configuration_reload_failed"
                );
                Err(err)
            }
        }
    }
}
