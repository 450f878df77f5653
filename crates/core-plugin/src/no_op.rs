//! Pass-through plugins.
//!
//! `NoOpCaller` emits one record per chunk with an empty sequence, which is
//! exactly what unblock-all mode needs: every read classifies as `no_seq`
//! and the condition table does the rest. `NoOpAligner` forwards records
//! untouched, for setups where the caller already made the decision.

use core_config::Conf;
use core_model::{Calibration, RawChunk, ReadRecord, SignalDtype};

use crate::{Aligner, Caller, RecordStream};

#[derive(Debug, Default)]
pub struct NoOpCaller;

impl NoOpCaller {
    pub fn new() -> Self {
        Self
    }
}

impl Caller for NoOpCaller {
    fn basecall<'a>(
        &'a mut self,
        chunks: Vec<(u32, RawChunk)>,
        _dtype: SignalDtype,
        _calibration: &'a [Calibration],
    ) -> RecordStream<'a> {
        Box::new(chunks.into_iter().map(|(channel, chunk)| {
            ReadRecord::new(channel, chunk.read_number, chunk.read_id, "")
        }))
    }

    fn describe(&self) -> String {
        "no_op caller: no base-calling performed, minimal records emitted per chunk".into()
    }
}

#[derive(Debug, Default)]
pub struct NoOpAligner;

impl NoOpAligner {
    pub fn new() -> Self {
        Self
    }
}

impl Aligner for NoOpAligner {
    fn initialised(&self) -> bool {
        true
    }

    fn map_reads<'a>(&'a mut self, calls: RecordStream<'a>) -> RecordStream<'a> {
        calls
    }

    fn describe(&self, _conf: &Conf) -> String {
        "no_op aligner: records passed through unmodified".into()
    }
}
