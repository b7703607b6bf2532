//! Controller-specific error types.
//!
//! This module defines error types specific to the NetInstall controller
//! that are not covered by the server library's errors.

use netinstall_server::NetInstallError;
use thiserror::Error;

/// Errors that can occur in the NetInstall controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Provisioning server error
    #[error("NetInstall server error: {0}")]
    Server(#[from] NetInstallError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Host interface lookup failed
    #[error("Network interface error: {0}")]
    Interface(String),
}
