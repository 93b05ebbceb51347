//! The seam between the connection handler and application logic.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::ack::AckCode;
use crate::error::ProcessError;
use crate::outcome::Message;

/// Application logic invoked once per received frame.
///
/// Calls for frames from the same connection never overlap. Implementations may be slow and may
/// fail; a panic is caught by the connection handler and treated as an application failure.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, message: &Message) -> Result<Reply, ProcessError>;
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn process(&self, message: &Message) -> Result<Reply, ProcessError> {
        (**self).process(message).await
    }
}

/// What a successful processor hands back for the acknowledgement step.
///
/// In manual acknowledgement mode `acknowledgement` must be set; it is written to the peer
/// as-is (the MLLP envelope is added by the codec). `ack_code` asks for a generated
/// acknowledgement with a specific code in either mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub acknowledgement: Option<Bytes>,
    pub ack_code: Option<AckCode>,
    pub ack_text: Option<String>,
}

impl Reply {
    /// Accept the message, letting the handler generate the acknowledgement.
    pub fn accept() -> Self {
        Reply::default()
    }

    /// Supply the complete acknowledgement message.
    pub fn acknowledge_with(acknowledgement: impl Into<Bytes>) -> Self {
        Reply {
            acknowledgement: Some(acknowledgement.into()),
            ..Reply::default()
        }
    }

    /// Generate the acknowledgement with this code instead of the one implied by the outcome.
    pub fn with_code(code: AckCode) -> Self {
        Reply {
            ack_code: Some(code),
            ..Reply::default()
        }
    }

    /// Text for MSA-3.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.ack_text = Some(text.into());
        self
    }
}

/// A [`Processor`] built from an async closure, see [`processor_fn`].
#[derive(Clone)]
pub struct ProcessorFn<F> {
    f: F,
}

/// Adapts an async function taking the [`Message`] by value into a [`Processor`].
/// ```
/// use hl7_mllp_server::{processor_fn, ProcessError, Reply};
///
/// let processor = processor_fn(|message| async move {
///     if message.payload().is_empty() {
///         return Err(ProcessError::Rejected("empty message".into()));
///     }
///     Ok(Reply::accept())
/// });
/// # let _ = processor;
/// ```
pub fn processor_fn<F, Fut>(f: F) -> ProcessorFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, ProcessError>> + Send + 'static,
{
    ProcessorFn { f }
}

#[async_trait]
impl<F, Fut> Processor for ProcessorFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, ProcessError>> + Send + 'static,
{
    async fn process(&self, message: &Message) -> Result<Reply, ProcessError> {
        (self.f)(message.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_processor_sees_payload() {
        let processor = processor_fn(|message: Message| async move {
            Ok(Reply::accept().text(message.as_str_lossy().into_owned()))
        });

        let reply = processor
            .process(&Message::new(Bytes::from_static(b"MSH|^~\\&|")))
            .await
            .expect("reply");
        assert_eq!(reply.ack_text.as_deref(), Some("MSH|^~\\&|"));
    }

    #[tokio::test]
    async fn shared_processor_delegates() {
        let processor = Arc::new(processor_fn(|_message: Message| async move {
            Err(ProcessError::Rejected("nope".into()))
        }));

        let err = processor
            .process(&Message::new(Bytes::new()))
            .await
            .expect_err("rejected");
        assert!(matches!(err, ProcessError::Rejected(_)));
    }

    #[test]
    fn manual_acknowledgement_reply() {
        let reply = Reply::acknowledge_with("MSA|AA|1");
        assert_eq!(reply.acknowledgement, Some(Bytes::from_static(b"MSA|AA|1")));
        assert_eq!(reply.ack_code, None);
    }
}
