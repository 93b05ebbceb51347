//! Shared harness for the end-to-end acknowledgement tests.
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hl7_mllp_server::{
    processor_fn, AckBuilder, AckCode, AckGenerationRecord, AckMode, CompleteRecord, DefaultMsh,
    FailureRecord, Message, MllpCodec, MllpConfig, MllpServer, OutcomeReceivers, OutcomeSinks,
    Processor, Reply,
};

pub const TEST_MESSAGE: &str = concat!(
    "MSH|^~\\&|APP_A|FAC_A|^org^sys||||ADT^A04^ADT_A04|||2.6\r",
    "PID|1||1100832^^^^PI||TEST^FIG||98765432|U||R|435 MAIN STREET^^LAKE COMO^NJ^07719^USA\r",
);

pub const EXPECTED_ACKNOWLEDGEMENT: &str =
    "MSH|^~\\&|^org^sys||APP_A|FAC_A|||ACK^A04^ADT_A04|||2.6\rMSA|AA|\r";

const RECORD_WAIT: Duration = Duration::from_secs(5);

/// The two axes the acknowledgement scenarios are run across.
#[derive(Debug, Clone, Copy)]
pub struct HarnessOptions {
    pub auto_ack: bool,
    pub bridge_error_handler: bool,
}

impl HarnessOptions {
    pub fn config(&self) -> MllpConfig {
        MllpConfig {
            ack_mode: if self.auto_ack {
                AckMode::Auto
            } else {
                AckMode::Manual
            },
            bridge_error_handler: self.bridge_error_handler,
            ..MllpConfig::default()
        }
    }
}

/// Every record the three sinks received over the harness's lifetime.
#[derive(Debug, Default)]
pub struct Collected {
    pub complete: Vec<CompleteRecord>,
    pub failure: Vec<FailureRecord>,
    pub ack_generation_exception: Vec<AckGenerationRecord>,
}

/// A running server on an ephemeral port plus everything needed to observe it.
pub struct Harness {
    addr: SocketAddr,
    result: Arc<Mutex<Vec<Bytes>>>,
    receivers: OutcomeReceivers,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl Harness {
    pub async fn start(options: HarnessOptions) -> Harness {
        let result = Arc::new(Mutex::new(Vec::new()));
        let processor = recording_processor(options.auto_ack, Arc::clone(&result));
        let (sinks, receivers) = OutcomeSinks::channel(16);

        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
        let server = MllpServer::bind(addr, options.config(), processor, sinks)
            .await
            .expect("bind test server");
        let addr = server.local_addr().expect("local addr");

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(server.run(shutdown.clone()));

        Harness {
            addr,
            result,
            receivers,
            shutdown,
            server,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn connect(&self) -> Framed<TcpStream, MllpCodec> {
        let stream = TcpStream::connect(self.addr).await.expect("connect");
        Framed::new(stream, MllpCodec::new())
    }

    /// Sends one message on a fresh connection and returns the acknowledgement text.
    pub async fn send(&self, message: &str) -> String {
        let mut client = self.connect().await;
        send_and_receive(&mut client, message).await
    }

    /// Bodies the processor has seen so far.
    pub fn result(&self) -> Vec<Bytes> {
        self.result.lock().expect("result lock").clone()
    }

    pub async fn next_failure(&mut self) -> FailureRecord {
        tokio::time::timeout(RECORD_WAIT, self.receivers.failure.recv())
            .await
            .expect("timed out waiting for a failure record")
            .expect("failure sink closed")
    }

    /// Stops the server, waits for open connections to finish and collects every routed record.
    pub async fn finish(mut self) -> Collected {
        self.shutdown.cancel();
        tokio::time::timeout(RECORD_WAIT, self.server)
            .await
            .expect("server did not shut down")
            .expect("server task");

        let mut collected = Collected::default();
        while let Some(record) = self.receivers.complete.recv().await {
            collected.complete.push(record);
        }
        while let Some(record) = self.receivers.failure.recv().await {
            collected.failure.push(record);
        }
        while let Some(record) = self.receivers.ack_generation_exception.recv().await {
            collected.ack_generation_exception.push(record);
        }
        collected
    }
}

pub async fn send_and_receive(client: &mut Framed<TcpStream, MllpCodec>, message: &str) -> String {
    client
        .send(Bytes::copy_from_slice(message.as_bytes()))
        .await
        .expect("send");
    let ack = tokio::time::timeout(RECORD_WAIT, client.next())
        .await
        .expect("timed out waiting for acknowledgement")
        .expect("connection closed before acknowledgement")
        .expect("decode acknowledgement");
    String::from_utf8_lossy(&ack).into_owned()
}

/// Records each body it is given. With manual acknowledgement it builds and supplies the
/// acknowledgement itself, asking for a generated `AE` when the message can't be answered.
pub fn recording_processor(auto_ack: bool, result: Arc<Mutex<Vec<Bytes>>>) -> impl Processor {
    let builder = AckBuilder::new(DefaultMsh::default());
    processor_fn(move |message: Message| {
        let result = Arc::clone(&result);
        let builder = builder.clone();
        async move {
            result
                .lock()
                .expect("result lock")
                .push(message.payload().clone());
            if auto_ack {
                return Ok(Reply::accept());
            }
            match builder.build(message.payload(), AckCode::ApplicationAccept, None) {
                Ok(ack) => Ok(Reply::acknowledge_with(ack.as_bytes().clone())),
                Err(_) => Ok(Reply::with_code(AckCode::ApplicationError)),
            }
        }
    })
}

/// A transport that replays `input` and then fails every write, as if the peer reset the
/// connection right after sending.
pub struct BrokenPipe {
    input: std::io::Cursor<Vec<u8>>,
}

impl BrokenPipe {
    pub fn new(input: impl Into<Vec<u8>>) -> Self {
        BrokenPipe {
            input: std::io::Cursor::new(input.into()),
        }
    }
}

impl AsyncRead for BrokenPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.input).poll_read(cx, buf)
    }
}

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
