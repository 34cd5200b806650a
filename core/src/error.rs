//! Error taxonomy for the ingestion core (spec §7).
//!
//! Only [`IngestError::Invariant`] is fatal. Everything else is handled by the
//! caller via retry, queueing, or skip-and-log; `main_loop` never unwinds on
//! the non-fatal variants.

use crate::types::Address;
use std::fmt;

/// E1/E2/E3/E5 from the error handling taxonomy. E4 (pipe closed) is not an
/// error at all -- it's the normal shutdown signal handled in `worker`.
#[derive(Debug)]
pub enum IngestError {
    /// E1: a disassembly/extern lookup exhausted its retry budget.
    MissingReference { address: Address, attempts: u32 },
    /// E2: a wire record failed to parse.
    MalformedRecord { record: String, reason: String },
    /// E3: an invariant the protocol guarantees was violated. Fatal.
    Invariant(String),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::MissingReference { address, attempts } => write!(
                f,
                "reference to 0x{address:x} not resolved after {attempts} attempts"
            ),
            IngestError::MalformedRecord { record, reason } => {
                write!(f, "malformed record {record:?}: {reason}")
            }
            IngestError::Invariant(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for IngestError {}

pub type Result<T> = anyhow::Result<T>;
