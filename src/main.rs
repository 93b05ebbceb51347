use std::error::Error;
use std::net::SocketAddr;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use hl7_mllp_server::{
    processor_fn, Message, MllpConfig, MllpServer, OutcomeReceivers, OutcomeSinks, Reply,
};

const DEFAULT_ADDR: &str = "127.0.0.1:2575";

/// Usage: `mllp-listener [ADDR] [CONFIG.toml]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let addr = args
        .next()
        .unwrap_or_else(|| DEFAULT_ADDR.to_string())
        .parse::<SocketAddr>()?;
    let config = match args.next() {
        Some(path) => MllpConfig::load(path)?,
        None => MllpConfig::default(),
    };

    let (sinks, receivers) = OutcomeSinks::channel(config.sink_capacity);
    let processor = processor_fn(|message: Message| async move {
        info!(
            "Got message: {} bytes from {:?}, type={:?}",
            message.payload().len(),
            message.peer_addr(),
            message.headers().and_then(|h| h.message_type.clone())
        );
        Ok(Reply::accept())
    });

    let server = MllpServer::bind(addr, config, processor, sinks).await?;
    info!("Listening on {}", server.local_addr()?);

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));
    let drain_task = tokio::spawn(log_outcomes(receivers));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown.cancel();
    server_task.await?;
    // the server held the last senders, so the drain ends once every record is logged
    drain_task.await?;

    Ok(())
}

async fn log_outcomes(mut receivers: OutcomeReceivers) {
    let (mut complete, mut failure, mut ack_generation) = (true, true, true);
    while complete || failure || ack_generation {
        tokio::select! {
            record = receivers.complete.recv(), if complete => match record {
                Some(record) => info!("  ACK sent ({:?}): {:?}", record.outcome, record.acknowledgement.code),
                None => complete = false,
            },
            record = receivers.failure.recv(), if failure => match record {
                Some(record) => error!("  Message failed: {}", record.failure.fault()),
                None => failure = false,
            },
            record = receivers.ack_generation_exception.recv(), if ack_generation => match record {
                Some(record) => match &record.fallback_fault {
                    Some(fallback) => error!("  No acknowledgement built: {}, fallback: {}", record.fault, fallback),
                    None => warn!("  Fallback acknowledgement used: {}", record.fault),
                },
                None => ack_generation = false,
            },
        }
    }
}
