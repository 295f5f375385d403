//! Market data normalization

pub mod normalizers;

pub use normalizers::OkxNormalizer;

use crate::exchanges::{CanonicalEvent, RawFrame};
use thiserror::Error;

/// Fatal normalization failures. Shape problems in the input are never
/// errors; they only reduce the number of events produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Clock ordering violated: {stage} ({later}ns) precedes its predecessor ({earlier}ns)")]
    ClockOrdering {
        stage: &'static str,
        earlier: u64,
        later: u64,
    },
}

/// Converts decoded exchange frames into canonical events
pub trait MarketDataNormalizer: Send + Sync {
    /// Zero or more events for one frame, in wire order.
    fn normalize(&self, frame: &RawFrame) -> Result<Vec<CanonicalEvent>, NormalizeError>;

    fn exchange_name(&self) -> &str;
}

/// Always-on check that the monotonic stage stamps never run backwards.
pub fn check_clock_ordering(
    recv_mono_ns: u64,
    decoded_mono_ns: u64,
    proc_mono_ns: u64,
) -> Result<(), NormalizeError> {
    if decoded_mono_ns < recv_mono_ns {
        return Err(NormalizeError::ClockOrdering {
            stage: "decoded",
            earlier: recv_mono_ns,
            later: decoded_mono_ns,
        });
    }
    if proc_mono_ns < decoded_mono_ns {
        return Err(NormalizeError::ClockOrdering {
            stage: "processed",
            earlier: decoded_mono_ns,
            later: proc_mono_ns,
        });
    }
    Ok(())
}
