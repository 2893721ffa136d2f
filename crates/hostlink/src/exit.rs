use std::fmt;

use hostlink_frame::FrameError;
use hostlink_spi::SpiError;
use hostlink_transport::TransportError;

// Exit code constants aligned with sysexits-style semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const CONFIG_ERROR: i32 = 78;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::InvalidConfig(_) => CliError::new(CONFIG_ERROR, format!("{context}: {err}")),
        TransportError::AllocationFailed { .. } => {
            CliError::new(INTERNAL, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn spi_error(context: &str, err: SpiError) -> CliError {
    match err {
        SpiError::Transport(err) => transport_error(context, err),
        SpiError::Frame(err) => frame_error(context, err),
        SpiError::InvalidConfig(_) | SpiError::Json(_) => {
            CliError::new(CONFIG_ERROR, format!("{context}: {err}"))
        }
        SpiError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SpiError::EmptyPayload => CliError::new(USAGE, format!("{context}: {err}")),
        SpiError::QueueFull { .. } | SpiError::Inactive => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn config_errors_map_to_config_code() {
        let err = spi_error("load", SpiError::InvalidConfig("bad".into()));
        assert_eq!(err.code, CONFIG_ERROR);
        assert_eq!(err.to_string(), "load: invalid config: bad");
    }

    #[test]
    fn nested_errors_keep_their_class() {
        let err = spi_error(
            "exchange",
            SpiError::Transport(TransportError::Timeout(Duration::from_millis(5))),
        );
        assert_eq!(err.code, TIMEOUT);

        let err = spi_error("decode", SpiError::Frame(FrameError::DummyFrame));
        assert_eq!(err.code, DATA_INVALID);
    }
}
