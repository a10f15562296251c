//! # Error Module
//!
//! One error type for the whole pipeline. Setup failures (`DeviceUnavailable`,
//! `UnsupportedFormat`, `InvalidConfiguration`) are returned from
//! [`crate::pipeline::start_pipeline`]; runtime failures (`DeviceRead`, `Format`,
//! `Callback`) stop a running pipeline and are reported through its status and tick callback.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpectrumError {
    /// No input device could be found or opened.
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device rejected the requested rate, bit depth or channel count.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Short read, disconnect or a closed capture stream.
    #[error("audio device read failed: {0}")]
    DeviceRead(String),

    /// The raw capture buffer does not decode into whole samples.
    #[error("sample decode failed: {0}")]
    Format(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A caller passed a value outside the documented domain.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The registered tick callback panicked.
    #[error("tick callback failed: {0}")]
    Callback(String),

    /// The configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SpectrumError>;

impl From<cpal::DevicesError> for SpectrumError {
    fn from(err: cpal::DevicesError) -> Self {
        SpectrumError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DeviceNameError> for SpectrumError {
    fn from(err: cpal::DeviceNameError) -> Self {
        SpectrumError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for SpectrumError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        SpectrumError::UnsupportedFormat(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for SpectrumError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                SpectrumError::DeviceUnavailable(err.to_string())
            }
            other => SpectrumError::UnsupportedFormat(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for SpectrumError {
    fn from(err: cpal::PlayStreamError) -> Self {
        SpectrumError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::StreamError> for SpectrumError {
    fn from(err: cpal::StreamError) -> Self {
        SpectrumError::DeviceRead(err.to_string())
    }
}
