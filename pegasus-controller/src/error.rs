//! The binary-boundary error type (spec §7): every fallible subsystem's
//! error composes into this one via `#[from]`, the way the teacher composes
//! its top-level error type from each layer's leaf errors.

use thiserror::Error;

use crate::config::ConfigError;
use crate::controller::ControllerError;

#[derive(Debug, Error)]
pub enum PegasusError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("failed to bind udp socket at {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
