//! B2F error types.
//!
//! Errors fall in three groups:
//!
//! - **Local validation**: malformed headers, dates, proposals or answer lines,
//!   bad section lengths. Mid-exchange these are echoed to the remote as a
//!   `*** <message>` line before the stream is closed.
//! - **Remote signalled**: lines starting with `*` from the remote, checksum
//!   failures and protocol violations.
//! - **Collaborator / operator**: mailbox refusals, credential lookups, prompt
//!   timeouts and cancellations.

use thiserror::Error;

/// B2F protocol errors.
#[derive(Error, Debug)]
pub enum B2FError {
    /// A header (or message) has no MID value.
    #[error("Missing MID in header")]
    MissingMid,

    /// Generic wire format parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Date header did not parse under any accepted layout.
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// Malformed proposal announcement line.
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    /// Malformed proposal answer line.
    #[error("Invalid proposal answer: {0}")]
    InvalidAnswer(String),

    /// Fewer bytes were available than a declared section size.
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// The stream ended before the handshake completed.
    #[error("Connection closed by remote")]
    Eof,

    /// Protocol-level error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote sent something other than what the protocol allows here.
    #[error("Unexpected response: '{0}'")]
    UnexpectedResponse(String),

    /// The remote reported an error (a line prefixed with `*`).
    #[error("{0}")]
    RemoteError(String),

    /// The remote's SID does not include B2 forwarding support.
    #[error("Remote does not support B2 Forwarding Protocol")]
    RemoteNotB2F,

    /// Block or proposal checksum mismatch.
    #[error("Bad checksum")]
    BadChecksum,

    /// Compression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression failed (corrupted payload).
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// The mailbox collaborator refused an operation.
    #[error("Mailbox error: {0}")]
    Mailbox(String),

    /// Secure login could not be completed.
    #[error("Secure login failed: {0}")]
    SecureLogin(String),

    /// An operator prompt was not answered in time.
    #[error("Prompt timed out")]
    PromptTimeout,

    /// An operator prompt was cancelled before it was answered.
    #[error("Prompt cancelled")]
    PromptCancelled,

    /// An in-flight dial or exchange was aborted locally.
    #[error("Aborted")]
    Aborted,

    /// No transport is registered for the URL scheme.
    #[error("Unregistered transport scheme: {0}")]
    UnregisteredScheme(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// Network communication error.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for B2F operations
pub type Result<T> = std::result::Result<T, B2FError>;

impl B2FError {
    /// Reports whether this error is a normal end of stream.
    pub fn is_eof(&self) -> bool {
        match self {
            B2FError::Eof => true,
            B2FError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Reports whether the remote rejected our secure login.
    ///
    /// Legacy Winlink passwords must be entered in all uppercase, so callers
    /// typically print a hint when this returns true.
    pub fn is_login_failure(&self) -> bool {
        match self {
            B2FError::RemoteError(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("secure login failed") || msg.contains("password")
            },
            B2FError::SecureLogin(_) => true,
            _ => false,
        }
    }
}

impl From<toml::de::Error> for B2FError {
    fn from(err: toml::de::Error) -> Self {
        B2FError::Config(err.to_string())
    }
}

impl From<url::ParseError> for B2FError {
    fn from(err: url::ParseError) -> Self {
        B2FError::Parse(format!("Invalid URL: {err}"))
    }
}

impl From<std::num::ParseIntError> for B2FError {
    fn from(err: std::num::ParseIntError) -> Self {
        B2FError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_classification() {
        assert!(B2FError::Eof.is_eof());
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(B2FError::from(io).is_eof());
        assert!(!B2FError::BadChecksum.is_eof());
    }

    #[test]
    fn test_login_failure_classification() {
        let err = B2FError::RemoteError("Secure login failed - account password does not match".into());
        assert!(err.is_login_failure());
        assert!(!B2FError::RemoteError("Disk full".into()).is_login_failure());
    }
}
