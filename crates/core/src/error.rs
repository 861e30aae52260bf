/// Result alias that carries the custom [`LightsError`] type.
pub type Result<T> = std::result::Result<T, LightsError>;

/// Common error type for the core crate.
///
/// Only configuration problems surface here. Transient transport failures are
/// logged and dropped inside the transports, since the next frame re-sends the
/// full state anyway.
#[derive(Debug, thiserror::Error)]
pub enum LightsError {
    /// Tempo was zero, negative or not a number.
    #[error("invalid tempo {0} bpm, tempo must be positive")]
    InvalidTempo(f64),
    /// Any other malformed configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A single universe was handed more than 512 channel bytes.
    #[error("payload of {len} bytes exceeds the 512 byte universe limit")]
    PayloadTooLarge { len: usize },
    #[error("unknown generator `{0}`")]
    UnknownGenerator(String),
    #[error("unknown effect `{0}`")]
    UnknownEffect(String),
    /// Failure while opening a serial device.
    #[error("serial port: {0}")]
    Serial(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl LightsError {
    /// Creates a configuration error from the provided message.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl From<serialport::Error> for LightsError {
    fn from(value: serialport::Error) -> Self {
        Self::Serial(value.to_string())
    }
}
