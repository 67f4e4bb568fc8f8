//! # Session Lifecycle
//!
//! A [`Session`] owns exactly one logical connection to the server: the
//! transport (buffered reader and writer halves of a TCP stream), the
//! connection settings, the advisory lock resource, and the keepalive task
//! handle.
//!
//! ## Lifecycle
//!
//! Connecting walks Disconnected → Connecting → Authenticating → SelectingDB
//! → Ready; a failure at any step tears back down to Disconnected. Connecting
//! again first tears down the previous transport, so at most one live
//! transport exists per session. `disconnect` is idempotent and always safe,
//! including on a session that never connected.
//!
//! ## Sharing
//!
//! Sessions are handed out as `Arc<Session>` because the keepalive monitor
//! holds its own handle. The foreground caller and the monitor coordinate
//! through the lock discipline implemented in the executor; neither ever
//! touches the transport without it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keepalive;
use crate::resp::{self, Response, DEFAULT_READ_TIMEOUT};

/// Rounds of the bounded pre-command drain; each round clears whatever the
/// reader already buffered plus anything arriving within the poll window.
const MAX_DRAIN_ROUNDS: usize = 8;
const DRAIN_POLL: Duration = Duration::from_millis(2);

/// Connection settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hostname or IP of the server
    pub host: String,
    /// Server port
    pub port: u16,
    /// Optional auth token sent via AUTH after connecting
    pub auth_token: Option<String>,
    /// Database index selected via SELECT after connecting; 0 sends nothing
    pub db_index: u32,
    /// Keepalive probe interval; zero disables the monitor
    pub keepalive: Duration,
    /// How long a single response read may block before failing
    pub response_timeout: Duration,
}

impl SessionConfig {
    /// The server address in "host:port" form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            auth_token: config.auth_token.clone(),
            db_index: config.db_index,
            keepalive: Duration::from_secs(config.keepalive_seconds),
            response_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// The two halves of one live connection, with a buffered reader for the
/// decoder. Dropping a transport closes the stream.
pub(crate) struct Transport {
    pub(crate) reader: BufReader<OwnedReadHalf>,
    pub(crate) writer: OwnedWriteHalf,
}

impl Transport {
    pub(crate) async fn open(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::connect(format!("failed to connect to {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::connect(format!("failed to set TCP_NODELAY: {}", e)))?;

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one inline command line and decodes exactly one response.
    ///
    /// The terminator is written even for single-line commands; the server
    /// will not act on an unterminated line.
    pub(crate) async fn send_command(
        &mut self,
        text: &str,
        read_timeout: Duration,
    ) -> Result<Response> {
        self.send_line(text).await?;
        resp::decode(&mut self.reader, read_timeout).await
    }

    /// Writes one terminated command line without reading anything back.
    /// Push mode uses this; its responses arrive open-endedly afterwards.
    pub(crate) async fn send_line(&mut self, text: &str) -> Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Bounded best-effort clear of bytes a prior, already-completed exchange
    /// left unread. Never waits longer than the poll window per round.
    pub(crate) async fn drain_stale(&mut self) {
        for _ in 0..MAX_DRAIN_ROUNDS {
            match timeout(DRAIN_POLL, self.reader.fill_buf()).await {
                Ok(Ok(chunk)) if !chunk.is_empty() => {
                    let n = chunk.len();
                    debug!("Discarding {} stale bytes before sending", n);
                    self.reader.consume(n);
                }
                _ => break,
            }
        }
    }
}

/// Transport state guarded by the session lock.
pub(crate) enum LinkState {
    /// No transport: never connected, or explicitly disconnected
    Down,
    /// Live transport ready for the next command
    Ready(Transport),
    /// The transport died; the next executor invocation reconnects
    Stale,
}

/// One logical connection to the server.
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) link: Mutex<LinkState>,
    /// Advisory busy marker, checked before the authoritative try-lock
    pub(crate) busy: AtomicBool,
    /// Fast-path existence flag: true between a successful connect and the
    /// matching disconnect, including while the transport is stale
    pub(crate) attached: AtomicBool,
    keepalive_task: StdMutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Session>,
}

impl Session {
    /// Creates a disconnected session. Returned as `Arc` because the
    /// keepalive monitor keeps its own handle to the session.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Session {
            config,
            link: Mutex::new(LinkState::Down),
            busy: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            keepalive_task: StdMutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Connects (or reconnects) the session: tears down any prior transport,
    /// opens a new one, authenticates and selects the configured database,
    /// then arms the keepalive monitor.
    ///
    /// # Errors
    /// * [`Error::Connect`] - the transport could not be opened
    /// * [`Error::Auth`] - the server rejected the auth token
    /// * [`Error::Db`] - the server rejected the database index
    pub async fn connect(&self) -> Result<()> {
        self.disarm_keepalive();

        let mut link = self.link.lock().await;
        // An aborted keepalive probe may have died with the marker set;
        // holding the mutex here guarantees no critical section is live, so
        // the marker can be cleared along with the old transport.
        self.busy.store(false, Ordering::Release);
        self.attached.store(false, Ordering::Release);
        *link = LinkState::Down;

        let transport = self.open_link().await?;
        *link = LinkState::Ready(transport);
        self.attached.store(true, Ordering::Release);
        drop(link);

        self.arm_keepalive();
        Ok(())
    }

    /// Opens a fresh transport and runs the connection preamble (AUTH,
    /// SELECT) over it. Shared by `connect` and the executor's transparent
    /// reconnect, which must not re-enter the session lock.
    pub(crate) async fn open_link(&self) -> Result<Transport> {
        let addr = self.config.addr();
        debug!("Connecting to {}", addr);
        let mut transport = Transport::open(&addr).await?;

        if let Some(token) = &self.config.auth_token {
            debug!("Authenticating session");
            let auth = format!("AUTH {}", token);
            match transport
                .send_command(&auth, self.config.response_timeout)
                .await
            {
                Ok(Response::Error(message)) => return Err(Error::auth(message)),
                Ok(_) => {}
                Err(e) => return Err(Error::auth(e.to_string())),
            }
        }

        if self.config.db_index > 0 {
            debug!("Selecting database {}", self.config.db_index);
            let select = format!("SELECT {}", self.config.db_index);
            match transport
                .send_command(&select, self.config.response_timeout)
                .await
            {
                Ok(Response::Error(message)) => return Err(Error::db(message)),
                Ok(_) => {}
                Err(e) => return Err(Error::db(e.to_string())),
            }
        }

        info!("Session ready on {}", addr);
        Ok(transport)
    }

    /// Tears the session down. Idempotent; safe on a session that never
    /// connected. The keepalive timer is cancelled before the transport
    /// closes, so no timer fire can observe a half-closed stream.
    pub async fn disconnect(&self) {
        self.disarm_keepalive();

        let mut link = self.link.lock().await;
        self.attached.store(false, Ordering::Release);
        *link = LinkState::Down;
        self.busy.store(false, Ordering::Release);
        debug!("Session disconnected");
    }

    /// True between a successful connect and the matching disconnect.
    pub fn is_connected(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// The server address this session dials, in "host:port" form.
    pub fn addr(&self) -> String {
        self.config.addr()
    }

    fn arm_keepalive(&self) {
        if self.config.keepalive.is_zero() {
            return;
        }
        let Some(session) = self.weak_self.upgrade() else {
            return;
        };
        let handle = keepalive::spawn(session, self.config.keepalive);
        let mut slot = self.keepalive_task.lock().expect("keepalive slot poisoned");
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn disarm_keepalive(&self) {
        let mut slot = self.keepalive_task.lock().expect("keepalive slot poisoned");
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The keepalive task holds an Arc to the session, so by the time
        // this runs the slot is normally empty; aborting covers the case
        // where the task was already detached by the runtime shutting down.
        self.disarm_keepalive();
    }
}
