//! # Pool Multiplexer
//!
//! The pool fans one public local endpoint out over a fixed number of
//! supervised upstream sessions. Each member task owns one [`Session`],
//! reconnecting it independently when it dies, and advertises itself on a
//! shared channel whenever it is free. The accept loop claims the first
//! advertised member for each client connection; with every member claimed
//! it simply awaits the channel, so excess clients are held rather than
//! rejected. That wait is the backpressure.
//!
//! While claimed, a member relays raw bytes in both directions. The only
//! transformation is at the public boundary: bare line-feeds from the client
//! are rewritten to the protocol's CRLF terminator so plain line-oriented
//! callers need not know the wire framing. The relay performs no protocol
//! parsing, no pipelining across members, and no request-size enforcement.
//!
//! The public endpoint is either a loopback TCP port (numeric operand) or a
//! Unix domain socket path (anything else).

use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keepalive::PROBE_COMMAND;
use crate::session::{LinkState, Session, SessionConfig, Transport};

const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_millis(200);
const RECONNECT_BACKOFF_CEIL: Duration = Duration::from_secs(5);

/// Where the pool listens for clients.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Loopback TCP port
    Tcp(u16),
    /// Unix domain socket path
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    /// Parses the public-endpoint operand: a purely numeric value selects a
    /// loopback TCP port, anything else a local domain-socket path.
    pub fn parse(operand: &str) -> Result<Self> {
        if let Ok(port) = operand.parse::<u16>() {
            return Ok(Endpoint::Tcp(port));
        }
        #[cfg(unix)]
        {
            Ok(Endpoint::Unix(PathBuf::from(operand)))
        }
        #[cfg(not(unix))]
        {
            Err(Error::connect(format!(
                "domain sockets are unsupported on this platform: {}",
                operand
            )))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(port) => write!(f, "127.0.0.1:{}", port),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Anything the relay can shuttle bytes over.
pub(crate) trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

type ClientConn = Box<dyn RelayStream>;

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(port) => {
                let listener = TcpListener::bind(("127.0.0.1", *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                // A socket file left behind by a dead previous run would
                // fail the bind
                let _ = std::fs::remove_file(path);
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
        }
    }

    async fn accept(&self) -> std::io::Result<ClientConn> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                debug!("Accepted client connection from {}", addr);
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("Accepted client connection on domain socket");
                Ok(Box::new(stream))
            }
        }
    }
}

/// An availability advertisement from a free member: sending a client
/// connection through it hands that client to the member's relay.
struct MemberSlot {
    claim: oneshot::Sender<ClientConn>,
}

/// The multiplexer: a bound public endpoint plus the upstream settings its
/// members connect with.
pub struct Pool {
    config: Config,
    listener: Listener,
}

impl Pool {
    /// Binds the public endpoint. Failing here is fatal setup failure and is
    /// surfaced before any member connects upstream.
    pub async fn bind(config: Config, endpoint: &Endpoint) -> Result<Self> {
        let listener = Listener::bind(endpoint).await?;
        info!(
            "Pool of {} listening on {} for upstream {}",
            config.pool_size.max(1),
            endpoint,
            config.addr()
        );
        Ok(Pool { config, listener })
    }

    /// The bound TCP address, when the endpoint is TCP. Binding port 0 gets
    /// an ephemeral port; this is how callers learn which one.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }

    /// Runs the accept loop forever, spawning one supervised member task per
    /// pool slot.
    pub async fn run(self) -> Result<()> {
        let pool_size = self.config.pool_size.max(1);
        let (slots_tx, mut slots_rx) = mpsc::channel::<MemberSlot>(pool_size);
        let session_config = SessionConfig::from(&self.config);

        for id in 0..pool_size {
            tokio::spawn(member_loop(id, session_config.clone(), slots_tx.clone()));
        }
        drop(slots_tx);

        loop {
            let client = match self.listener.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to accept client connection: {}", e);
                    continue;
                }
            };

            // Backpressure: with every member claimed, recv() waits here and
            // the client is held, not refused.
            let mut pending = client;
            loop {
                match slots_rx.recv().await {
                    Some(slot) => match slot.claim.send(pending) {
                        Ok(()) => break,
                        Err(returned) => {
                            warn!("Pool member vanished while being claimed; reassigning client");
                            pending = returned;
                        }
                    },
                    None => {
                        return Err(Error::disconnected("all pool members terminated"));
                    }
                }
            }
        }
    }
}

/// One member: connect the upstream session, advertise availability, relay
/// for one client at a time, health-check between clients, and reconnect
/// with backoff whenever the upstream link dies. Members never affect each
/// other.
async fn member_loop(id: usize, config: SessionConfig, slots: mpsc::Sender<MemberSlot>) {
    let session = Session::new(config);
    let mut backoff = RECONNECT_BACKOFF_FLOOR;

    loop {
        if let Err(e) = session.connect().await {
            warn!(
                "Pool member {}: upstream connect failed: {}; retrying in {:?}",
                id, e, backoff
            );
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CEIL);
            continue;
        }
        backoff = RECONNECT_BACKOFF_FLOOR;
        info!("Pool member {}: upstream session ready", id);

        loop {
            let (claim_tx, claim_rx) = oneshot::channel();
            if slots.send(MemberSlot { claim: claim_tx }).await.is_err() {
                session.disconnect().await;
                return; // the pool is gone
            }
            let Ok(client) = claim_rx.await else {
                session.disconnect().await;
                return; // the accept loop is gone
            };

            match session.relay(client).await {
                Ok(()) => debug!("Pool member {}: client finished", id),
                Err(e) => debug!("Pool member {}: relay ended: {}", id, e),
            }

            // Liveness check between clients. The executor transparently
            // revives a stale link, so only a hard failure falls through to
            // the reconnect loop.
            match session.execute(PROBE_COMMAND).await {
                Ok(_) | Err(Error::LockBusy) => continue,
                Err(e) => {
                    warn!("Pool member {}: liveness check failed: {}", id, e);
                    break;
                }
            }
        }

        session.disconnect().await;
    }
}

impl Session {
    /// Relays raw bytes between a claimed client and this session's upstream
    /// transport until one side closes.
    ///
    /// Holds the session lock for the whole exchange; a keepalive probe that
    /// fires mid-relay fails fast with `LockBusy` instead of injecting a
    /// PING into the byte stream.
    pub(crate) async fn relay(&self, mut client: ClientConn) -> Result<()> {
        let mut link = self.link.lock().await;
        self.busy.store(true, Ordering::Release);
        let result = self.relay_locked(&mut link, &mut client).await;
        self.busy.store(false, Ordering::Release);
        result
    }

    async fn relay_locked(&self, link: &mut LinkState, client: &mut ClientConn) -> Result<()> {
        let mut transport = self.take_live_transport(link).await?;
        transport.drain_stale().await;

        let result = relay_streams(&mut transport, client).await;
        if result.is_ok() {
            *link = LinkState::Ready(transport);
        }
        result
    }
}

/// The byte shuttle. Client → upstream goes through the terminator rewrite;
/// upstream → client is copied verbatim.
async fn relay_streams(transport: &mut Transport, client: &mut ClientConn) -> Result<()> {
    let mut client_buf = [0u8; 4096];
    let mut rewritten = Vec::with_capacity(4096 + 64);
    let mut last_was_cr = false;

    loop {
        tokio::select! {
            read = client.read(&mut client_buf) => {
                let n = read?;
                if n == 0 {
                    // Client hung up; the member is free again
                    return Ok(());
                }
                rewritten.clear();
                rewrite_line_endings(&client_buf[..n], &mut last_was_cr, &mut rewritten);
                transport.writer.write_all(&rewritten).await?;
                transport.writer.flush().await?;
            }
            filled = transport.reader.fill_buf() => {
                let chunk = filled?;
                if chunk.is_empty() {
                    return Err(Error::disconnected("upstream closed during relay"));
                }
                let data = chunk.to_vec();
                transport.reader.consume(data.len());
                client.write_all(&data).await?;
                client.flush().await?;
            }
        }
    }
}

/// Rewrites bare `\n` to `\r\n`, leaving existing `\r\n` pairs untouched.
/// `last_was_cr` carries the one byte of state needed across chunk
/// boundaries, so a `\r\n` split between two reads is not doubled.
fn rewrite_line_endings(input: &[u8], last_was_cr: &mut bool, out: &mut Vec<u8>) {
    for &byte in input {
        if byte == b'\n' && !*last_was_cr {
            out.push(b'\r');
        }
        out.push(byte);
        *last_was_cr = byte == b'\r';
    }
}
