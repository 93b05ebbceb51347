//! Per-message outcomes and the three sinks they are routed to.
//!
//! Every processed frame produces exactly one record on either the `complete` or the `failure`
//! sink. When the acknowledgement could not be generated from the message itself, an additional
//! record carrying the generation fault goes to the `ack_generation_exception` sink.
//!
//! Routing never waits on a sink. A record for a full sink is dropped with a warning, so a
//! consumer that stops draining one channel can't stall the connections feeding it.

use std::borrow::Cow;
use std::net::SocketAddr;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::ack::{AckCode, Acknowledgement};
use crate::error::{AckDeliveryError, AckGenerationError, FrameError, Hl7Error, ProcessError};
use crate::hl7::Hl7Headers;
use crate::processor::Reply;

/// A decoded MLLP payload plus what we know about where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
    headers: Option<Hl7Headers>,
    peer_addr: Option<SocketAddr>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Message {
            payload: payload.into(),
            headers: None,
            peer_addr: None,
        }
    }

    pub(crate) fn with_headers(mut self, headers: Option<Hl7Headers>) -> Self {
        self.headers = headers;
        self
    }

    pub(crate) fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// MSH routing fields, when the message has a parsable header and extraction is enabled.
    pub fn headers(&self) -> Option<&Hl7Headers> {
        self.headers.as_ref()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// The result of handing one message to the processor.
#[derive(Debug)]
pub enum Outcome {
    Success(Reply),
    ApplicationFailure(ProcessError),
    /// The processor succeeded but the message has no usable MSH to acknowledge against.
    UnparsableMessage(Hl7Error),
}

impl Outcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success(_) => OutcomeKind::Success,
            Outcome::ApplicationFailure(_) => OutcomeKind::ApplicationFailure,
            Outcome::UnparsableMessage(_) => OutcomeKind::UnparsableMessage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    ApplicationFailure,
    UnparsableMessage,
}

/// The acknowledgement as it was (or would have been) written to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMetadata {
    pub code: Option<AckCode>,
    pub bytes: Bytes,
    pub string: String,
}

impl From<&Acknowledgement> for AckMetadata {
    fn from(ack: &Acknowledgement) -> Self {
        AckMetadata {
            code: ack.code(),
            bytes: ack.as_bytes().clone(),
            string: ack.to_string_lossy(),
        }
    }
}

/// A message that was processed and acknowledged.
#[derive(Debug)]
pub struct CompleteRecord {
    pub message: Message,
    pub outcome: OutcomeKind,
    pub acknowledgement: AckMetadata,
}

/// Why a [`FailureRecord`] was produced.
#[derive(Debug)]
pub enum Failure {
    /// The processor failed. `delivery` is set if the acknowledgement then also failed to send.
    Application {
        cause: ProcessError,
        delivery: Option<AckDeliveryError>,
    },
    /// Processing finished (`outcome`) but the acknowledgement didn't reach the peer.
    AcknowledgementDelivery {
        outcome: OutcomeKind,
        cause: AckDeliveryError,
    },
    /// A transport fault forwarded because the bridge error handler is enabled.
    Transport(FrameError),
}

impl Failure {
    /// The fault that put this record on the failure sink.
    pub fn fault(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match self {
            Failure::Application { cause, .. } => cause,
            Failure::AcknowledgementDelivery { cause, .. } => cause,
            Failure::Transport(cause) => cause,
        }
    }

    pub fn delivery_fault(&self) -> Option<&AckDeliveryError> {
        match self {
            Failure::Application { delivery, .. } => delivery.as_ref(),
            Failure::AcknowledgementDelivery { cause, .. } => Some(cause),
            Failure::Transport(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct FailureRecord {
    pub message: Message,
    pub failure: Failure,
    pub acknowledgement: Option<AckMetadata>,
}

/// The acknowledgement couldn't be generated from the message; `fallback` is what was sent instead.
#[derive(Debug)]
pub struct AckGenerationRecord {
    pub message: Message,
    pub fault: AckGenerationError,
    pub fallback: Option<AckMetadata>,
    /// Set when the fallback acknowledgement couldn't be built either.
    pub fallback_fault: Option<AckGenerationError>,
}

/// Everything the connection handler learned about one exchange.
#[derive(Debug)]
pub struct ExchangeReport {
    pub message: Message,
    pub outcome: Outcome,
    /// The acknowledgement handed to the transport, if one was produced.
    pub acknowledgement: Option<Acknowledgement>,
    pub generation_fault: Option<AckGenerationError>,
    pub fallback_fault: Option<AckGenerationError>,
    pub delivery_fault: Option<AckDeliveryError>,
}

#[derive(Debug)]
pub enum Routed {
    Complete(CompleteRecord),
    Failure(FailureRecord),
    AckGenerationException(AckGenerationRecord),
}

/// Senders for the three outcome sinks. Any of them may be absent, in which case records for it
/// are dropped.
#[derive(Debug, Clone, Default)]
pub struct OutcomeSinks {
    pub complete: Option<mpsc::Sender<CompleteRecord>>,
    pub failure: Option<mpsc::Sender<FailureRecord>>,
    pub ack_generation_exception: Option<mpsc::Sender<AckGenerationRecord>>,
}

/// Receiving halves created by [`OutcomeSinks::channel`].
#[derive(Debug)]
pub struct OutcomeReceivers {
    pub complete: mpsc::Receiver<CompleteRecord>,
    pub failure: mpsc::Receiver<FailureRecord>,
    pub ack_generation_exception: mpsc::Receiver<AckGenerationRecord>,
}

impl OutcomeSinks {
    /// Creates all three sinks as bounded channels of `capacity`.
    pub fn channel(capacity: usize) -> (OutcomeSinks, OutcomeReceivers) {
        let (complete_tx, complete_rx) = mpsc::channel(capacity);
        let (failure_tx, failure_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);

        (
            OutcomeSinks {
                complete: Some(complete_tx),
                failure: Some(failure_tx),
                ack_generation_exception: Some(ack_tx),
            },
            OutcomeReceivers {
                complete: complete_rx,
                failure: failure_rx,
                ack_generation_exception: ack_rx,
            },
        )
    }
}

/// Classifies finished exchanges and forwards the resulting records to the sinks.
#[derive(Debug, Clone, Default)]
pub struct OutcomeRouter {
    sinks: OutcomeSinks,
}

impl OutcomeRouter {
    pub fn new(sinks: OutcomeSinks) -> Self {
        OutcomeRouter { sinks }
    }

    /// Maps a report to its records: always one `Complete` or `Failure`, preceded by an
    /// `AckGenerationException` when generation from the message itself failed.
    pub fn classify(report: ExchangeReport) -> Vec<Routed> {
        let ExchangeReport {
            message,
            outcome,
            acknowledgement,
            generation_fault,
            fallback_fault,
            delivery_fault,
        } = report;
        let acknowledgement = acknowledgement.as_ref().map(AckMetadata::from);

        let mut routed = Vec::with_capacity(2);
        if let Some(fault) = generation_fault {
            routed.push(Routed::AckGenerationException(AckGenerationRecord {
                message: message.clone(),
                fault,
                fallback: acknowledgement.clone(),
                fallback_fault,
            }));
        }

        let kind = outcome.kind();
        let primary = match (outcome, delivery_fault, acknowledgement) {
            (Outcome::ApplicationFailure(cause), delivery, acknowledgement) => {
                Routed::Failure(FailureRecord {
                    message,
                    failure: Failure::Application { cause, delivery },
                    acknowledgement,
                })
            }
            (_, Some(cause), acknowledgement) => Routed::Failure(FailureRecord {
                message,
                failure: Failure::AcknowledgementDelivery {
                    outcome: kind,
                    cause,
                },
                acknowledgement,
            }),
            (_, None, Some(acknowledgement)) => Routed::Complete(CompleteRecord {
                message,
                outcome: kind,
                acknowledgement,
            }),
            (_, None, None) => Routed::Failure(FailureRecord {
                message,
                failure: Failure::AcknowledgementDelivery {
                    outcome: kind,
                    cause: AckDeliveryError::NotGenerated,
                },
                acknowledgement: None,
            }),
        };
        routed.push(primary);

        routed
    }

    pub fn route(&self, report: ExchangeReport) {
        for record in OutcomeRouter::classify(report) {
            self.deliver(record);
        }
    }

    /// Forwards a transport fault as a failure record; only used with the bridge error handler.
    pub fn route_transport_fault(&self, message: Message, fault: FrameError) {
        self.deliver(Routed::Failure(FailureRecord {
            message,
            failure: Failure::Transport(fault),
            acknowledgement: None,
        }));
    }

    fn deliver(&self, record: Routed) {
        match record {
            Routed::Complete(record) => send("complete", &self.sinks.complete, record),
            Routed::Failure(record) => send("failure", &self.sinks.failure, record),
            Routed::AckGenerationException(record) => send(
                "ack_generation_exception",
                &self.sinks.ack_generation_exception,
                record,
            ),
        }
    }
}

fn send<T>(name: &str, sink: &Option<mpsc::Sender<T>>, record: T) {
    let tx = match sink {
        Some(tx) => tx,
        None => {
            debug!("No {} sink configured, record dropped", name);
            return;
        }
    };
    match tx.try_send(record) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Outcome sink {} is full, record dropped", name),
        Err(TrySendError::Closed(_)) => debug!("Outcome sink {} is closed, record dropped", name),
    }
}
