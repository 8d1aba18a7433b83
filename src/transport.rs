use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::select;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::{ServerConfig, TransportConfig};
use crate::error::{DispatchError, DispatchResult};

/// Sends a single request datagram and waits for a single reply, using a fresh socket that is
///  closed afterwards. There is exactly one attempt, and any failure is terminal for the call.
///
/// The reply is read into a buffer of `config.max_reply_size` bytes, and longer replies are
///  truncated without signalling an error.
pub async fn send_request(endpoint: &str, payload: &[u8], config: &TransportConfig) -> DispatchResult<Bytes> {
    let to = resolve(endpoint).await?;

    let bind_addr = if to.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await
        .inspect_err(|e| debug!("can not open UDP socket for {:?}: {}", to, e))?;
    socket.connect(to).await
        .inspect_err(|e| debug!("can not connect UDP socket to {:?}: {}", to, e))?;

    trace!("sending {} bytes to {:?}", payload.len(), to);
    socket.send(payload).await
        .inspect_err(|e| debug!("can not write to {:?}: {}", to, e))?;

    let mut buf = vec![0u8; config.max_reply_size];
    let num_read = match timeout(config.request_timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("error reading from {:?}: {}", to, e);
            return Err(e.into());
        }
        Err(_) => {
            debug!("no reply from {:?} within {:?}", to, config.request_timeout);
            return Err(io::Error::new(io::ErrorKind::TimedOut, format!("no reply from {} within {:?}", to, config.request_timeout)).into());
        }
    };

    if num_read == buf.len() {
        warn!("reply from {:?} filled the receive buffer of {} bytes - it may be truncated", to, buf.len());
    }
    buf.truncate(num_read);
    trace!("received {} bytes reply from {:?}", num_read, to);
    Ok(buf.into())
}

async fn resolve(endpoint: &str) -> DispatchResult<SocketAddr> {
    let mut addrs = lookup_host(endpoint).await
        .inspect_err(|e| debug!("can not resolve {}: {}", endpoint, e))?;

    addrs.next()
        .ok_or_else(|| DispatchError::Network(io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve to any address", endpoint))))
}

/// Handle to reply to the sender of a received datagram. Replies go through the shared listening
///  socket - each write is a datagram of its own, so concurrent replies need no coordination.
#[derive(Clone)]
pub struct Replier {
    socket: Arc<UdpSocket>,
    to: SocketAddr,
}

impl Replier {
    pub fn peer_addr(&self) -> SocketAddr {
        self.to
    }

    pub async fn reply(&self, buf: &[u8]) {
        trace!("replying {} bytes to {:?}", buf.len(), self.to);
        if let Err(e) = self.socket.send_to(buf, self.to).await {
            error!("failed sending reply to {:?}: {}", self.to, e);
        }
    }
}

/// This trait decouples the receive loop from the handling of a datagram once it is received.
///
/// Every datagram is handled in a task of its own, so handlers may run concurrently and finish
///  in any order.
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn handle_datagram(&self, buf: Bytes, replier: Replier);
}

/// The server side's long-lived listening socket
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
}

impl UdpServer {
    /// Failure to bind is the only fatal error of the server side.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<UdpServer> {
        config.transport.validate()?;

        let socket = UdpSocket::bind(config.bind_addr).await
            .inspect_err(|e| error!("UDP server could not be bound to {:?}: {}", config.bind_addr, e))?;
        info!("UDP server bound to {:?}", socket.local_addr()?);

        Ok(UdpServer {
            socket: Arc::new(socket),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until `shutdown` is cancelled. Errors for individual datagrams are
    ///  logged, and the loop continues.
    pub async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>, shutdown: CancellationToken) {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.config.transport.max_datagram_size];
        loop {
            let (num_read, from) = select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down receive loop");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        if pause_after_error(&shutdown).await {
                            continue;
                        }
                        info!("shutting down receive loop");
                        return;
                    }
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::DEBUG, "datagram_received", ?correlation_id, ?from);

            if num_read == 0 {
                span.in_scope(|| warn!("received empty datagram - dropping"));
                continue;
            }
            span.in_scope(|| trace!("received {} bytes", num_read));

            let datagram = Bytes::copy_from_slice(&buf[..num_read]);
            let replier = Replier {
                socket: self.socket.clone(),
                to: from,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.handle_datagram(datagram, replier).await
            }.instrument(span));
        }
    }
}

const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Pauses the receive loop after a socket error so that a persistent error does not spin it.
///  Returns `false` if `shutdown` was cancelled during the pause.
async fn pause_after_error(shutdown: &CancellationToken) -> bool {
    select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(RECV_ERROR_PAUSE) => true,
    }
}
