// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON envelope wire protocol, reused at both boundaries this system frames by hand:
//! the module control socket ([`ModuleRequest`]/[`ModuleResponse`]) and the control-plane
//! RPC surface ([`rpc`]) the master's HTTP handlers and the agent's clients share as DTOs.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod framing;
mod module;
pub mod rpc;

pub use framing::{read_frame, write_frame, MAX_FRAME_LEN};
pub use module::{ModuleRequest, ModuleResponse};

use warden_error::{AsErrorCode, ErrorCode};

/// Errors arising from frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// JSON serialization or deserialization failure.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A declared frame length exceeded the configured maximum.
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),
}

impl AsErrorCode for ProtocolError {
    fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Json(_) | ProtocolError::FrameTooLarge(_) => {
                ErrorCode::InvariantViolation
            }
            ProtocolError::Io(_) => ErrorCode::Transient,
        }
    }
}
