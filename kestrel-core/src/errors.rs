//! Receiver error types, grouped by failure kind

use thiserror::Error;

/// Top-level error type for all receiver operations
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Errors detected before any thread is started; setup fails
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown device kind {name:?}")]
    UnknownDevice { name: String },

    #[error("Invalid serial number {serial:?}")]
    InvalidSerial { serial: String },

    #[error("Invalid sample rate {rate} Hz")]
    InvalidSampleRate { rate: u32 },

    #[error("Invalid value {value} for {key}: must be within {min}..={max}")]
    OutOfRange {
        key: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Output rate {rate} Hz incompatible with block length {l} at input rate {samprate} Hz")]
    IncompatibleOutputRate { rate: u32, l: usize, samprate: u32 },

    #[error("Invalid filter block parameters: L={l}, M={m}")]
    InvalidBlockParams { l: usize, m: usize },
}

/// Hardware failures during open or streaming
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device open failed: {reason}")]
    OpenFailed { reason: String },

    #[error("Device stopped streaming")]
    NotStreaming,

    #[error("Device rejected tune request to {freq} Hz")]
    TuneFailed { freq: f64 },
}

/// Network and output stream failures
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Multicast socket setup failed: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Cannot resolve destination {dest:?}")]
    BadDestination { dest: String },
}

/// Per-channel lifecycle failures
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("SSRC {ssrc:#010x} already in use")]
    SsrcInUse { ssrc: u32 },

    #[error("SSRC 0 is reserved")]
    ReservedSsrc,

    #[error("No channel with SSRC {ssrc:#010x}")]
    NoSuchChannel { ssrc: u32 },

    #[error("Channel {ssrc:#010x} is terminating")]
    Terminating { ssrc: u32 },
}

/// Result type alias for receiver operations
pub type Result<T> = std::result::Result<T, RadioError>;
