//! Network error types

use std::net::IpAddr;

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("dial to {0} timed out")]
    DialTimeout(IpAddr),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("incoming frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
