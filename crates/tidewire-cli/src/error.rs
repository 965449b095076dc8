use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] tidewire_core::ValidationError),

    #[error("command error: {0}")]
    Command(String),

    #[error(transparent)]
    Store(#[from] tidewire_core::StoreError),

    #[error(transparent)]
    Capture(#[from] tidewire_core::CaptureError),

    #[error("stream ended with failure: {0}")]
    StreamFailed(tidewire_core::StreamFailure),

    #[error("stream abandoned before its terminal event")]
    Abandoned,

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Command(_) => 2,
            Self::StreamFailed(_) => 3,
            Self::Serialization(_) => 4,
            Self::Abandoned => 5,
            Self::Store(_) => 6,
            Self::Capture(_) => 7,
            Self::Io(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewire_core::{FailureCode, StreamFailure};

    #[test]
    fn failures_map_to_distinct_exit_codes() {
        let failed = CliError::StreamFailed(StreamFailure::new(FailureCode::Producer));
        assert_eq!(failed.exit_code(), 3);
        assert_eq!(CliError::Abandoned.exit_code(), 5);
        assert_eq!(CliError::Command(String::from("bad")).exit_code(), 2);
    }
}
