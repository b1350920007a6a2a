//! Error taxonomy for the encoder and its collaborators.

use crate::resource_control::{RcEvent, RcState};
use std::io;

/// Failures reported by register-level collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HwError {
    #[error("hardware rejected {op}")]
    Rejected { op: &'static str },
    #[error("hardware did not settle during {op}")]
    Stuck { op: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncoderError {
    /// Missing or malformed collaborator input. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Wait attempted on a channel that is disabled or torn down.
    #[error("channel is not running; wait would block forever")]
    WouldBlock,

    /// No hardware signal, even after the fallback status read.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("hardware rejected request: {0}")]
    HardwareRejected(#[from] HwError),

    /// Channel-local recoverable fault; resolved by the next prepare_kickoff.
    #[error("channel {0} needs a hardware reset")]
    NeedsHardwareReset(usize),

    #[error("resource control rejected {event:?} in state {state:?}")]
    TransitionRejected { state: RcState, event: RcEvent },

    #[error("encoder is not enabled")]
    NotEnabled,

    #[error("encoder has been torn down")]
    TornDown,

    #[error("channel {index} still has {pending} kickoff(s) in flight")]
    ChannelBusy { index: usize, pending: i32 },

    #[error("too many channels: {0}")]
    TooManyChannels(usize),

    #[error("failed to start the {0} worker")]
    WorkerSpawn(&'static str),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
