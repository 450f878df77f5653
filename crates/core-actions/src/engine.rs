//! Per-record decision resolution.

use core_config::{Conf, ConfigError};
use core_model::{Action, Decision, ReadRecord};
use core_state::{ChunkTracker, SentActionTracker};
use tracing::trace;

use crate::dispatch::ActionBatcher;

/// Everything observable about one resolved record, for statistics and the
/// debug TSV. Borrows condition names from the configuration snapshot used
/// for the resolution.
#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    /// Final action after every override.
    pub action: Action,
    /// Chunks seen for this read, including the current one.
    pub seen_count: u32,
    pub is_control: bool,
    pub condition_name: &'a str,
    /// Region owning the channel when the condition came from a barcode.
    pub region_name: Option<&'a str>,
    /// Last action dispatched on this channel before this record.
    pub previous_action: Option<Action>,
    /// True when control, chunk bounds, or dry-run changed the table action.
    pub overridden: bool,
    /// True when dry-run turned an unblock into stop-receiving.
    pub dry_run_substituted: bool,
    /// True when an identical command for this read was already sent; nothing
    /// was enqueued.
    pub suppressed: bool,
}

pub struct DecisionEngine {
    chunks: ChunkTracker,
    sent: SentActionTracker,
    dry_run: bool,
}

impl DecisionEngine {
    pub fn new(channels: usize, dry_run: bool) -> Self {
        Self {
            chunks: ChunkTracker::new(channels),
            sent: SentActionTracker::new(channels),
            dry_run,
        }
    }

    /// Chunks seen for a read so far, without recording. Observability only.
    pub fn chunk_count(&self, channel: u32, read_number: u32) -> u32 {
        self.chunks.count(channel, read_number)
    }

    /// Resolve one record and enqueue its action.
    ///
    /// Order of application: condition table lookup, control override,
    /// chunk-bound overrides (mutually exclusive because `min <= max`),
    /// dry-run substitution, redundant-send suppression. Chunk-bound
    /// overrides also rewrite `record.decision` to the synthetic variant so
    /// downstream observability sees why the action changed.
    pub fn process<'a>(
        &mut self,
        conf: &'a Conf,
        record: &mut ReadRecord,
        batcher: &mut ActionBatcher,
    ) -> Result<Resolution<'a>, ConfigError> {
        let (is_control, condition) =
            conf.get_conditions(record.channel, record.barcode.as_deref())?;
        let region_name = conf
            .get_region(record.channel)
            .map(|region| region.name.as_str());
        let seen_count = self.chunks.seen(record.channel, record.read_number);
        let table_action = condition.get_action(record.decision);
        let mut action = table_action;

        if is_control {
            action = Action::StopReceiving;
        } else {
            let below = seen_count < condition.min_chunks;
            let above = seen_count > condition.max_chunks;
            if above && action == Action::Proceed {
                action = condition.above_max_chunks;
                record.decision = Decision::AboveMaxChunks;
            }
            if below && action != Action::Proceed {
                action = condition.below_min_chunks;
                record.decision = Decision::BelowMinChunks;
            }
        }

        let mut dry_run_substituted = false;
        if self.dry_run && action == Action::Unblock {
            action = Action::StopReceiving;
            dry_run_substituted = true;
        }

        let previous_action = self.sent.get(record.channel).map(|(_, action)| action);
        let suppressed = action != Action::Proceed
            && self
                .sent
                .already_sent(record.channel, record.read_number, action);

        if !suppressed {
            match action {
                Action::Unblock => {
                    batcher.push_unblock(record.channel, record.read_number, &record.read_id);
                    self.sent.record(record.channel, record.read_number, action);
                }
                Action::StopReceiving => {
                    batcher.push_stop(record.channel, record.read_number);
                    self.sent.record(record.channel, record.read_number, action);
                }
                Action::Proceed => {}
            }
        }

        let resolution = Resolution {
            action,
            seen_count,
            is_control,
            condition_name: condition.name.as_str(),
            region_name,
            previous_action,
            overridden: action != table_action,
            dry_run_substituted,
            suppressed,
        };
        trace!(
            target: "actions.engine",
            channel = record.channel,
            read_number = record.read_number,
            decision = record.decision.as_str(),
            action = resolution.action.as_str(),
            seen = resolution.seen_count,
            control = resolution.is_control,
            overridden = resolution.overridden,
            suppressed = resolution.suppressed,
            "record_resolved"
        );
        Ok(resolution)
    }
}
