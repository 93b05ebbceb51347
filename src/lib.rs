/*!
# An HL7 MLLP listener built on tokio.

 HL7's MLLP is a simple, single-byte-text based protocol for framing HL7 messages over a TCP (or similar) transport.
 The full specification is available at [the HL7 site](https://www.hl7.org/documentcenter/private/standards/v3/V3_TRMLLP_R2_R2019.zip) (Note that they place the standards behind a free membership/login form).

 This crate provides the receiving side of that protocol:
 - [`MllpCodec`], a [tokio-util codec](https://docs.rs/tokio-util/latest/tokio_util/codec/index.html) that
   encodes/decodes MLLP frames,
 - [`AckBuilder`], which turns an inbound message into an HL7 acknowledgement (`MSA` with `AA`, `AE` or `AR`),
 - [`ConnectionHandler`], which reads frames from one connection, hands each to your [`Processor`],
   and writes the acknowledgement back before reading the next frame,
 - [`MllpServer`], which accepts TCP connections and runs a handler for each of them,
 - [`OutcomeRouter`], which reports what happened to every message on three channels
   (`complete`, `failure` and `ack_generation_exception`).

 ## Example
 ```no_run
use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use hl7_mllp_server::{processor_fn, MllpConfig, MllpServer, OutcomeSinks, Reply};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = MllpConfig::default();
    let (sinks, mut receivers) = OutcomeSinks::channel(config.sink_capacity);
    // records for a full sink are dropped, so close the sinks you won't read
    drop(receivers.failure);
    drop(receivers.ack_generation_exception);

    let processor = processor_fn(|message| async move {
        println!("Got message: {}", message.as_str_lossy());
        Ok(Reply::accept()) // the acknowledgement is generated (and MLLP wrapped) for us
    });

    let addr: SocketAddr = "127.0.0.1:2575".parse()?;
    let server = MllpServer::bind(addr, config, processor, sinks).await?;
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));

    while let Some(record) = receivers.complete.recv().await {
        println!("  Acknowledged with: {}", record.acknowledgement.string);
    }

    Ok(())
}
```

 # Crate Features
 By default this crate is designed to strictly comply with the MLLP Specification, however there are scenarios where systems in production _do not_ comply with the standard.  In those cases there is a crate feature `noncompliance`
 available which changes the default of [`MllpConfig::require_end_of_data`]:
 - An END_OF_BLOCK byte ends a frame even when the trailing carriage return is missing.

 */

mod ack;
mod activity_stream;
mod codec;
mod config;
mod connection;
pub mod error;
pub mod hl7;
mod outcome;
mod processor;
mod server;

pub use crate::ack::{AckBuilder, AckCode, Acknowledgement};
pub use crate::codec::{frame, MllpCodec, END_OF_BLOCK, END_OF_DATA, START_OF_BLOCK};
pub use crate::config::{AckMode, DefaultMsh, MllpConfig};
pub use crate::connection::{ConnectionContext, ConnectionHandler};
pub use crate::error::{
    AckDeliveryError, AckGenerationError, BoxError, ConfigError, FrameError, Hl7Error,
    ProcessError, ServerError,
};
pub use crate::hl7::{Hl7Headers, MshSegment};
pub use crate::outcome::{
    AckGenerationRecord, AckMetadata, CompleteRecord, ExchangeReport, Failure, FailureRecord,
    Message, Outcome, OutcomeKind, OutcomeReceivers, OutcomeRouter, OutcomeSinks, Routed,
};
pub use crate::processor::{processor_fn, Processor, ProcessorFn, Reply};
pub use crate::server::MllpServer;
