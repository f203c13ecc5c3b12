/// Error types shared across the uplink service
use thiserror::Error;

/// Startup configuration failures. Each maps to its own process exit status.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("no serial device found; set SERIAL_PORT or connect the receiver")]
    NoSerialDevice,
}

impl ConfigError {
    pub fn exit_code(&self) -> u8 {
        match self {
            ConfigError::Missing(_) | ConfigError::Invalid { .. } => 2,
            ConfigError::NoSerialDevice => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("SSL error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("timed out after {0} s")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),

    #[error("relay {0} not found")]
    NotFound(String),

    #[error("relay characteristic {0} not exposed by device")]
    MissingCharacteristic(bluer::Uuid),

    #[error("relay not connected")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_differ_per_cause() {
        assert_eq!(ConfigError::Missing("DATABASE_URL").exit_code(), 2);
        let invalid = ConfigError::Invalid {
            name: "SERIAL_BAUD",
            value: "fast".into(),
        };
        assert_eq!(invalid.exit_code(), 2);
        assert_eq!(ConfigError::NoSerialDevice.exit_code(), 3);
    }
}
