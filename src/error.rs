use crate::host::HostCommand;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("download host is not connected")]
    HostUnavailable,

    #[error("download host did not answer {command} for download #{id} in time")]
    HostTimeout { command: HostCommand, id: u64 },

    #[error("host rejected {command} for download #{id}: {reason}")]
    HostRejected {
        command: HostCommand,
        id: u64,
        reason: String,
    },

    #[error("storage I/O failed: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("download controller has shut down")]
    ControllerClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
