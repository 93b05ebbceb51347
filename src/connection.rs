//! Per-connection read / dispatch / acknowledge loop.
//!
//! A handler owns one transport and works through its frames strictly in order:
//!
//! ```text
//! AwaitingFrame -> Dispatching -> AwaitingAckMaterial -> Writing -> AwaitingFrame
//! ```
//!
//! Any state can move to `Closed`. Faults from processing or acknowledgement generation are
//! turned into outcome records; only transport faults end the connection.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{error::Elapsed, timeout, timeout_at, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckBuilder, AckCode, Acknowledgement};
use crate::activity_stream::ActivityStream;
use crate::codec::MllpCodec;
use crate::config::{AckMode, MllpConfig};
use crate::error::{AckDeliveryError, AckGenerationError, ConfigError, FrameError, ProcessError};
use crate::hl7::{Hl7Headers, MshSegment};
use crate::outcome::{ExchangeReport, Message, Outcome, OutcomeRouter, OutcomeSinks};
use crate::processor::{Processor, Reply};

/// Where a [`ConnectionHandler`] is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingFrame,
    Dispatching,
    AwaitingAckMaterial,
    Writing,
    Closed,
}

/// Read-only state shared by every connection of a server.
pub struct ConnectionContext<P> {
    config: MllpConfig,
    processor: P,
    builder: AckBuilder,
    router: OutcomeRouter,
}

impl<P: Processor> ConnectionContext<P> {
    /// Validates `config`, so every handler sharing the context can always fall back to the
    /// default header.
    pub fn new(config: MllpConfig, processor: P, sinks: OutcomeSinks) -> Result<Self, ConfigError> {
        config.validate()?;
        let builder = AckBuilder::new(config.default_msh.clone());
        Ok(ConnectionContext {
            config,
            processor,
            builder,
            router: OutcomeRouter::new(sinks),
        })
    }

    pub fn config(&self) -> &MllpConfig {
        &self.config
    }
}

struct AckMaterial {
    acknowledgement: Option<Acknowledgement>,
    generation_fault: Option<AckGenerationError>,
    fallback_fault: Option<AckGenerationError>,
    // manual mode, but the processor gave us nothing to send
    missing: bool,
}

/// Drives one MLLP connection until the peer leaves, the transport fails or shutdown is signalled.
pub struct ConnectionHandler<T, P> {
    framed: Framed<ActivityStream<T>, MllpCodec>,
    context: Arc<ConnectionContext<P>>,
    peer_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    state: State,
}

impl<T, P> ConnectionHandler<T, P>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    P: Processor,
{
    pub fn new(io: T, context: Arc<ConnectionContext<P>>) -> Self {
        let config = context.config();
        let mut codec = MllpCodec::new().with_require_end_of_data(config.require_end_of_data);
        if let Some(max) = config.max_frame_length {
            codec = codec.with_max_frame_length(max);
        }

        ConnectionHandler {
            framed: Framed::new(ActivityStream::new(io), codec),
            context,
            peer_addr: None,
            shutdown: CancellationToken::new(),
            state: State::AwaitingFrame,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    /// Cancelling `shutdown` closes the connection the next time it waits for a frame.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn run(mut self) {
        debug!("MLLP: Connection opened, peer={:?}", self.peer_addr);

        while let Some(frame) = self.next_frame().await {
            if !self.exchange(frame).await {
                break;
            }
        }

        self.transition(State::Closed);
        debug!("MLLP: Connection closed, peer={:?}", self.peer_addr);
    }

    fn transition(&mut self, next: State) {
        trace!("MLLP: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn next_frame(&mut self) -> Option<BytesMut> {
        self.transition(State::AwaitingFrame);

        let shutdown = self.shutdown.clone();
        let read_timeout = self.context.config.read_timeout;
        let read = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("MLLP: Shutdown requested, closing connection, peer={:?}", self.peer_addr);
                return None;
            }
            read = read_frame(&mut self.framed, read_timeout) => read,
        };

        match read {
            Ok(Some(Ok(frame))) => Some(frame),
            Ok(Some(Err(fault))) => {
                self.transport_fault(fault);
                None
            }
            Ok(None) => {
                debug!("MLLP: Peer closed the connection, peer={:?}", self.peer_addr);
                None
            }
            Err(_) if self.framed.codec().is_mid_frame() => {
                let partial = self.framed.read_buffer_mut().split();
                self.transport_fault(FrameError::Truncated { partial });
                None
            }
            Err(_) => {
                info!("MLLP: Idle read timeout, closing connection, peer={:?}", self.peer_addr);
                None
            }
        }
    }

    fn transport_fault(&self, fault: FrameError) {
        warn!("MLLP: {}, closing connection, peer={:?}", fault, self.peer_addr);

        if self.context.config.bridge_error_handler {
            let payload = match &fault {
                FrameError::Truncated { partial } => partial.clone().freeze(),
                _ => Bytes::new(),
            };
            let message = Message::new(payload).with_peer_addr(self.peer_addr);
            self.context.router.route_transport_fault(message, fault);
        }
    }

    /// Processes and acknowledges one frame. Returns whether the connection should stay open.
    async fn exchange(&mut self, frame: BytesMut) -> bool {
        self.transition(State::Dispatching);
        let payload = frame.freeze();

        let msh = MshSegment::parse(&payload);
        let headers = match (&msh, self.context.config.hl7_headers) {
            (Ok(msh), true) => Some(Hl7Headers::from_msh(msh)),
            _ => None,
        };
        let header_fault = msh.err();
        let message = Message::new(payload.clone())
            .with_headers(headers)
            .with_peer_addr(self.peer_addr);

        let result = match AssertUnwindSafe(self.context.processor.process(&message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let panic_msg = panic_message(&*panic);
                error!("MLLP: Processor panicked: panic={}, peer={:?}", panic_msg, self.peer_addr);
                Err(ProcessError::Panicked(panic_msg))
            }
        };

        let reply = result.as_ref().ok().cloned();
        let outcome = match (result, header_fault) {
            (Err(cause), _) => Outcome::ApplicationFailure(cause),
            (Ok(_), Some(fault)) => Outcome::UnparsableMessage(fault),
            (Ok(reply), None) => Outcome::Success(reply),
        };
        debug!("MLLP: Processed {} byte message: {:?}", payload.len(), outcome.kind());

        self.transition(State::AwaitingAckMaterial);
        let material = self.ack_material(&payload, &outcome, reply.as_ref());

        self.transition(State::Writing);
        let mut delivery_fault = None;
        if let Some(ack) = &material.acknowledgement {
            if let Err(fault) = self.write_ack(ack.as_bytes().clone()).await {
                warn!("MLLP: Acknowledgement delivery failed: {}, peer={:?}", fault, self.peer_addr);
                delivery_fault = Some(fault);
            }
        }
        // the transport is only unusable if the write itself failed
        let keep_open = material.acknowledgement.is_some() && delivery_fault.is_none();
        if delivery_fault.is_none() && material.missing {
            delivery_fault = Some(AckDeliveryError::MissingAcknowledgement);
        }

        self.context.router.route(ExchangeReport {
            message,
            outcome,
            acknowledgement: material.acknowledgement,
            generation_fault: material.generation_fault,
            fallback_fault: material.fallback_fault,
            delivery_fault,
        });

        keep_open
    }

    fn ack_material(&self, payload: &[u8], outcome: &Outcome, reply: Option<&Reply>) -> AckMaterial {
        let config = &self.context.config;
        let manual = config.ack_mode == AckMode::Manual;

        if let Some(supplied) = reply.and_then(|r| r.acknowledgement.clone()) {
            if manual {
                return AckMaterial {
                    acknowledgement: Some(Acknowledgement::from_bytes(supplied)),
                    generation_fault: None,
                    fallback_fault: None,
                    missing: false,
                };
            }
            debug!("MLLP: Ignoring supplied acknowledgement in automatic acknowledgement mode");
        }

        let requested = reply.and_then(|r| r.ack_code);
        let (code, text) = match outcome {
            Outcome::Success(reply) => (
                requested.unwrap_or(AckCode::ApplicationAccept),
                reply.ack_text.clone(),
            ),
            Outcome::UnparsableMessage(fault) => (
                requested.unwrap_or(AckCode::ApplicationError),
                Some(fault.to_string()),
            ),
            Outcome::ApplicationFailure(cause) => {
                if !config.acknowledge_failures {
                    info!("MLLP: Not acknowledging failed message, peer={:?}", self.peer_addr);
                    return AckMaterial {
                        acknowledgement: None,
                        generation_fault: None,
                        fallback_fault: None,
                        missing: false,
                    };
                }
                let code = match cause {
                    ProcessError::Rejected(_) => AckCode::ApplicationReject,
                    _ => config.application_failure_code,
                };
                (code, Some(cause.ack_text()))
            }
        };

        let missing = manual
            && requested.is_none()
            && !matches!(outcome, Outcome::ApplicationFailure(_));
        if missing {
            warn!("MLLP: No acknowledgement supplied in manual mode, generating one, peer={:?}", self.peer_addr);
        }

        match self.context.builder.build(payload, code, text.as_deref()) {
            Ok(ack) => AckMaterial {
                acknowledgement: Some(ack),
                generation_fault: None,
                fallback_fault: None,
                missing,
            },
            Err(fault) => {
                warn!("MLLP: {}, sending fallback acknowledgement, peer={:?}", fault, self.peer_addr);
                let fallback_code = match code {
                    AckCode::ApplicationReject => AckCode::ApplicationReject,
                    _ => AckCode::ApplicationError,
                };
                match self.context.builder.build_fallback(fallback_code, text.as_deref()) {
                    Ok(ack) => AckMaterial {
                        acknowledgement: Some(ack),
                        generation_fault: Some(fault),
                        fallback_fault: None,
                        missing,
                    },
                    Err(fallback_fault) => {
                        error!("MLLP: Fallback acknowledgement failed: {}, peer={:?}", fallback_fault, self.peer_addr);
                        AckMaterial {
                            acknowledgement: None,
                            generation_fault: Some(fault),
                            fallback_fault: Some(fallback_fault),
                            missing,
                        }
                    }
                }
            }
        }
    }

    async fn write_ack(&mut self, payload: Bytes) -> Result<(), AckDeliveryError> {
        match self.context.config.write_timeout {
            Some(limit) => timeout(limit, self.framed.send(payload))
                .await
                .map_err(|_| AckDeliveryError::Timeout(limit))?
                .map_err(AckDeliveryError::from),
            None => self.framed.send(payload).await.map_err(AckDeliveryError::from),
        }
    }
}

/// Waits for the next frame. With a `limit`, gives up once no bytes have arrived for that long;
/// a frame that keeps trickling in is never cut short.
async fn read_frame<T>(
    framed: &mut Framed<ActivityStream<T>, MllpCodec>,
    limit: Option<Duration>,
) -> Result<Option<Result<BytesMut, FrameError>>, Elapsed>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let limit = match limit {
        Some(limit) => limit,
        None => return Ok(framed.next().await),
    };

    framed.get_mut().touch();
    loop {
        let deadline = framed.get_ref().last_read() + limit;
        match timeout_at(deadline, framed.next()).await {
            Ok(read) => return Ok(read),
            Err(elapsed) if framed.get_ref().last_read() + limit <= Instant::now() => {
                return Err(elapsed)
            }
            Err(_) => trace!("MLLP: Data arrived before the read timeout, extending it"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
