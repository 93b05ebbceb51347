//! TCP listener that hands each accepted socket to its own [`ConnectionHandler`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::MllpConfig;
use crate::connection::{ConnectionContext, ConnectionHandler};
use crate::error::ServerError;
use crate::outcome::OutcomeSinks;
use crate::processor::Processor;

const INITIAL_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// A bound MLLP listener.
///
/// Connections share nothing but the read-only [`ConnectionContext`]; each runs on its own task.
pub struct MllpServer<P> {
    listener: TcpListener,
    context: Arc<ConnectionContext<P>>,
    limiter: Option<Arc<Semaphore>>,
}

impl<P: Processor> MllpServer<P> {
    /// Validates `config` and binds `addr`, retrying every `bind_retry_interval` while the
    /// address is in use until `bind_timeout` has passed.
    pub async fn bind(
        addr: SocketAddr,
        config: MllpConfig,
        processor: P,
        sinks: OutcomeSinks,
    ) -> Result<Self, ServerError> {
        let context = Arc::new(ConnectionContext::new(config, processor, sinks)?);
        let config = context.config();

        let deadline = Instant::now() + config.bind_timeout;
        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e)
                    if e.kind() == io::ErrorKind::AddrInUse
                        && Instant::now() + config.bind_retry_interval < deadline =>
                {
                    warn!(
                        "MLLP: {} in use, retrying bind in {:?}",
                        addr, config.bind_retry_interval
                    );
                    sleep(config.bind_retry_interval).await;
                }
                Err(e) => return Err(ServerError::Bind(e)),
            }
        };

        let limiter = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        Ok(MllpServer {
            listener,
            context,
            limiter,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for open connections to
    /// finish their current exchange and close.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        let mut backoff = INITIAL_ACCEPT_BACKOFF;

        info!("MLLP: Listening on {:?}", self.listener.local_addr().ok());
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    backoff = INITIAL_ACCEPT_BACKOFF;
                    self.spawn_connection(stream, peer_addr, &tracker, &shutdown);
                }
                Err(e) => {
                    warn!("MLLP: Accept failed: {}, retrying in {:?}", e, backoff);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                }
            }
        }

        info!("MLLP: Listener shutting down, waiting for {} connections", tracker.len());
        drop(self.listener);
        tracker.close();
        tracker.wait().await;
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        tracker: &TaskTracker,
        shutdown: &CancellationToken,
    ) {
        let permit = match self.acquire_slot() {
            Ok(permit) => permit,
            Err(max) => {
                warn!(
                    "MLLP: Connection limit of {} reached, closing connection from {}",
                    max, peer_addr
                );
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(self.context.config().tcp_nodelay) {
            debug!("MLLP: Failed to set TCP_NODELAY: {}, peer={}", e, peer_addr);
        }

        let handler = ConnectionHandler::new(stream, Arc::clone(&self.context))
            .with_peer_addr(Some(peer_addr))
            .with_shutdown(shutdown.child_token());

        tracker.spawn(async move {
            info!("MLLP: Connection opened from {}", peer_addr);
            handler.run().await;
            drop(permit);
            info!("MLLP: Connection from {} closed", peer_addr);
        });
    }

    fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>, usize> {
        match &self.limiter {
            Some(limiter) => Arc::clone(limiter)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| self.context.config().max_connections.unwrap_or_default()),
            None => Ok(None),
        }
    }
}
