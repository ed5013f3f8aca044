use std::time::Duration;

use thiserror::Error;

use crate::{sampler::SamplerState, DeviceProfile};

/// Errors of the energy sampler and of the sensor registry.
///
/// The error is `Clone` because a fault of the sampling loop is reported
/// to every caller that comes after it, not only to the first one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("unsupported device profile '{0}'")]
    UnsupportedDevice(String),

    #[error("mode '{mode}' is not supported on device {profile}")]
    UnsupportedMode { profile: DeviceProfile, mode: String },

    #[error("channel {channel} unavailable at {locator}: {reason}")]
    ChannelUnavailable {
        channel: String,
        locator: String,
        reason: String,
    },

    #[error("the sampling period must be greater than zero")]
    InvalidPeriod,

    #[error("failed to read channel {channel}: {reason}")]
    SampleRead { channel: String, reason: String },

    #[error("the sampling loop did not stop within {0:?}")]
    JoinTimeout(Duration),

    #[error("cannot {operation} while the sampler is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SamplerState,
    },

    #[error("the sampler has been terminated")]
    Terminated,

    #[error("failed to spawn the sampling thread: {0}")]
    Spawn(String),

    #[error("the sampling loop panicked")]
    Panicked,
}
