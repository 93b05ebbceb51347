//! Error types for each stage of an MLLP exchange.
//!
//! Transport problems ([`FrameError`]) end a connection. Everything else is
//! local to the one frame that caused it and ends up attached to an outcome
//! record instead of propagating out of the connection task.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;

/// Boxed error used to carry arbitrary processor failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by [`MllpCodec`](crate::MllpCodec) while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The underlying transport failed.
    #[error("MLLP transport error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended (or went quiet) after a start-of-block but before the trailer.
    #[error("MLLP frame truncated after {} bytes", .partial.len())]
    Truncated {
        /// Payload bytes received before the stream ended.
        partial: BytesMut,
    },

    /// A frame grew past the configured maximum without being terminated.
    #[error("MLLP frame exceeds the maximum length of {max} bytes")]
    FrameTooLarge { max: usize },
}

/// Reasons a payload cannot be interpreted as an HL7 message header.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Hl7Error {
    #[error("message is empty")]
    Empty,

    #[error("message does not start with an MSH segment")]
    MissingMsh,

    #[error("invalid HL7 field separator {0:#04x}")]
    InvalidFieldSeparator(u8),

    #[error("MSH-2 encoding characters are missing")]
    MissingEncodingCharacters,

    #[error("MSH segment ends before field MSH-{0}")]
    MissingField(usize),
}

/// The acknowledgement builder could not produce an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckGenerationError {
    #[error("cannot build acknowledgement from message header: {0}")]
    Header(#[from] Hl7Error),

    #[error("invalid fallback MSH configuration: {0}")]
    InvalidDefaultMsh(String),

    #[error("acknowledgement code {0} cannot be generated")]
    UnsupportedCode(&'static str),
}

/// The acknowledgement could not be delivered to the peer.
#[derive(Debug, Error)]
pub enum AckDeliveryError {
    #[error("failed to write acknowledgement: {0}")]
    Write(#[source] io::Error),

    #[error("timed out writing acknowledgement after {0:?}")]
    Timeout(Duration),

    #[error("manual acknowledgement mode is enabled but no acknowledgement was supplied")]
    MissingAcknowledgement,

    #[error("no acknowledgement could be generated")]
    NotGenerated,
}

impl From<FrameError> for AckDeliveryError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => AckDeliveryError::Write(e),
            other => AckDeliveryError::Write(io::Error::new(io::ErrorKind::Other, other)),
        }
    }
}

/// A failure reported by (or caught around) the application's processing step.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Business logic failed; acknowledged with the configured failure code.
    #[error("application failure: {0}")]
    Application(#[source] BoxError),

    /// The application refused the message outright; always acknowledged with `AR`.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// The processor panicked; the panic is contained to this one frame.
    #[error("processor panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    /// Wraps any error as an application failure.
    pub fn application<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ProcessError::Application(err.into())
    }

    /// Text suitable for MSA-3 in the acknowledgement.
    pub(crate) fn ack_text(&self) -> String {
        match self {
            ProcessError::Application(e) => e.to_string(),
            ProcessError::Rejected(reason) => reason.clone(),
            ProcessError::Panicked(_) => "internal error".to_string(),
        }
    }
}

/// Configuration could not be loaded or failed validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that stop the server listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
