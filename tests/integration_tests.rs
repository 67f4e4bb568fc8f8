//! Integration tests for the session, executor and pool.
//!
//! Every test runs against a mock server bound on an ephemeral loopback
//! port. The mock speaks just enough of the wire protocol to exercise the
//! client: it answers line commands with typed responses and can be told to
//! drop its first N connections right after reading a command, which is how
//! transport failures are simulated.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

use kvlink::config::Config;
use kvlink::pool::{Endpoint, Pool};
use kvlink::resp::Response;
use kvlink::session::{Session, SessionConfig};
use kvlink::Error;

struct MockServer {
    addr: SocketAddr,
    /// Connections accepted so far
    connections: Arc<AtomicUsize>,
    /// PING commands answered so far
    pings: Arc<AtomicUsize>,
}

/// Starts a mock server. The first `faulty_connections` accepted connections
/// close right after reading a command, without answering.
async fn spawn_mock(faulty_connections: usize) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let pings = Arc::new(AtomicUsize::new(0));

    let accepted = Arc::clone(&connections);
    let ping_counter = Arc::clone(&pings);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let index = accepted.fetch_add(1, Ordering::SeqCst);
            let pings = Arc::clone(&ping_counter);
            let faulty = index < faulty_connections;
            tokio::spawn(handle_mock_connection(stream, pings, faulty));
        }
    });

    MockServer {
        addr,
        connections,
        pings,
    }
}

async fn handle_mock_connection(stream: TcpStream, pings: Arc<AtomicUsize>, faulty: bool) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if faulty {
            // Simulated transport failure: drop the link without answering
            return;
        }

        let trimmed = line.trim_end();
        let mut parts = trimmed.split_whitespace();
        match parts.next().unwrap_or("").to_ascii_uppercase().as_str() {
            "PING" => {
                pings.fetch_add(1, Ordering::SeqCst);
                if write_half.write_all(b"+PONG\r\n").await.is_err() {
                    return;
                }
            }
            "AUTH" => {
                let reply: &[u8] = if parts.next() == Some("sesame") {
                    b"+OK\r\n"
                } else {
                    b"-ERR invalid password\r\n"
                };
                if write_half.write_all(reply).await.is_err() {
                    return;
                }
            }
            "GET" => {
                if write_half.write_all(b"$5\r\nhello\r\n").await.is_err() {
                    return;
                }
            }
            "NEST" => {
                if write_half
                    .write_all(b"*2\r\n:5\r\n*1\r\n+x\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
            }
            "SLOW" => {
                sleep(Duration::from_millis(300)).await;
                if write_half.write_all(b"+OK\r\n").await.is_err() {
                    return;
                }
            }
            "SUBSCRIBE" => {
                let _ = write_half.write_all(b"+one\r\n").await;
                sleep(Duration::from_millis(50)).await;
                let _ = write_half.write_all(b"+two\r\n").await;
            }
            _ => {
                if write_half.write_all(b"+OK\r\n").await.is_err() {
                    return;
                }
            }
        }
    }
}

fn session_config(addr: SocketAddr) -> SessionConfig {
    SessionConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        auth_token: None,
        db_index: 0,
        keepalive: Duration::ZERO,
        response_timeout: Duration::from_secs(1),
    }
}

fn pool_config(addr: SocketAddr, pool_size: usize) -> Config {
    Config {
        host: addr.ip().to_string(),
        port: addr.port(),
        auth_token: None,
        db_index: 0,
        keepalive_seconds: 0,
        pool_size,
    }
}

mod executor_tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_round_trip() {
        let server = spawn_mock(0).await;
        let session = Session::new(session_config(server.addr));
        session.connect().await.unwrap();

        let pong = session.execute("PING").await.unwrap();
        assert_eq!(pong, Response::Simple("PONG".to_string()));

        let value = session.execute("GET greeting").await.unwrap();
        assert_eq!(value, Response::Bulk(Some("hello".to_string())));

        let nested = session.execute("NEST").await.unwrap();
        assert_eq!(
            nested,
            Response::Array(Some(vec![
                Response::Integer(5),
                Response::Array(Some(vec![Response::Simple("x".to_string())])),
            ]))
        );

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_execute_without_connecting_fails_fast() {
        let server = spawn_mock(0).await;
        let session = Session::new(session_config(server.addr));

        let result = session.execute("PING").await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(server.connections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_preamble_runs_through_the_executor_path() {
        let server = spawn_mock(0).await;
        let mut config = session_config(server.addr);
        config.auth_token = Some("sesame".to_string());
        config.db_index = 2;

        let session = Session::new(config);
        session.connect().await.unwrap();
        assert!(session.is_connected());

        let pong = session.execute("PING").await.unwrap();
        assert_eq!(pong, Response::Simple("PONG".to_string()));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_rejected_auth_token_disconnects() {
        let server = spawn_mock(0).await;
        let mut config = session_config(server.addr);
        config.auth_token = Some("wrong".to_string());

        let session = Session::new(config);
        let result = session.connect().await;
        assert!(matches!(result, Err(Error::Auth { .. })));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_execute_loses_with_lock_busy() {
        let server = spawn_mock(0).await;
        let session = Session::new(session_config(server.addr));
        session.connect().await.unwrap();

        let background = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.execute("SLOW").await })
        };
        sleep(Duration::from_millis(50)).await;

        // The contender fails immediately rather than queuing
        let started = Instant::now();
        let contended = session.execute("PING").await;
        assert!(matches!(contended, Err(Error::LockBusy)));
        assert!(started.elapsed() < Duration::from_millis(200));

        let slow = background.await.unwrap().unwrap();
        assert_eq!(slow, Response::Simple("OK".to_string()));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_transport_failure_reconnects_and_retries_once() {
        let server = spawn_mock(1).await;
        let session = Session::new(session_config(server.addr));
        session.connect().await.unwrap();

        // The first connection dies mid-command; the retry answers
        let pong = session.execute("PING").await.unwrap();
        assert_eq!(pong, Response::Simple("PONG".to_string()));
        assert_eq!(server.connections.load(Ordering::SeqCst), 2);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_second_failure_surfaces_disconnected() {
        let server = spawn_mock(2).await;
        let session = Session::new(session_config(server.addr));
        session.connect().await.unwrap();

        let result = session.execute("PING").await;
        assert!(matches!(result, Err(Error::Disconnected { .. })));
        // Exactly one reconnect was attempted: the original plus one retry
        assert_eq!(server.connections.load(Ordering::SeqCst), 2);

        // Passive recovery: the next invocation finds the session stale,
        // reconnects, and succeeds
        let pong = session.execute("PING").await.unwrap();
        assert_eq!(pong, Response::Simple("PONG".to_string()));
        assert_eq!(server.connections.load(Ordering::SeqCst), 3);

        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_push_mode_streams_until_interrupted() {
        let server = spawn_mock(0).await;
        let session = Session::new(session_config(server.addr));
        session.connect().await.unwrap();

        let mut received = Vec::new();
        session
            .stream_responses(
                "SUBSCRIBE updates",
                sleep(Duration::from_millis(250)),
                |response| received.push(response.clone()),
            )
            .await
            .unwrap();

        assert_eq!(
            received,
            vec![
                Response::Simple("one".to_string()),
                Response::Simple("two".to_string()),
            ]
        );

        // The RESET issued on interrupt left the session usable
        let pong = session.execute("PING").await.unwrap();
        assert_eq!(pong, Response::Simple("PONG".to_string()));
        session.disconnect().await;
    }
}

mod keepalive_tests {
    use super::*;

    #[tokio::test]
    async fn test_keepalive_probes_on_the_shared_lock() {
        let server = spawn_mock(0).await;
        let mut config = session_config(server.addr);
        config.keepalive = Duration::from_millis(50);

        let session = Session::new(config);
        session.connect().await.unwrap();

        sleep(Duration::from_millis(300)).await;
        assert!(server.pings.load(Ordering::SeqCst) >= 2);

        // Foreground commands still work while the monitor is armed. A probe
        // may hold the lock at the instant of the call, in which case the
        // contract is a fast LockBusy and the caller retries.
        let value = loop {
            match session.execute("GET greeting").await {
                Ok(value) => break value,
                Err(Error::LockBusy) => sleep(Duration::from_millis(5)).await,
                Err(e) => panic!("unexpected executor error: {}", e),
            }
        };
        assert_eq!(value, Response::Bulk(Some("hello".to_string())));

        session.disconnect().await;

        // Disconnect cancels the timer; no further probes fire
        let settled = server.pings.load(Ordering::SeqCst);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(server.pings.load(Ordering::SeqCst), settled);
    }
}

mod pool_tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_relays_and_rewrites_bare_newlines() {
        let server = spawn_mock(0).await;
        let pool = Pool::bind(pool_config(server.addr, 1), &Endpoint::Tcp(0))
            .await
            .unwrap();
        let addr = pool.local_addr().unwrap();
        tokio::spawn(pool.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Bare LF from the client; the boundary rewrite supplies CRLF, and
        // the mock only answers properly terminated lines
        client.write_all(b"PING\n").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("relay did not answer in time")
            .unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_pool_holds_excess_clients_until_a_member_frees() {
        let server = spawn_mock(0).await;
        let pool = Pool::bind(pool_config(server.addr, 2), &Endpoint::Tcp(0))
            .await
            .unwrap();
        let addr = pool.local_addr().unwrap();
        tokio::spawn(pool.run());

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"PING\r\n").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"PING\r\n").await.unwrap();
        let n = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");

        // Both members are claimed; a third client is held, not refused
        let mut third = TcpStream::connect(addr).await.unwrap();
        third.write_all(b"PING\r\n").await.unwrap();
        let held = timeout(Duration::from_millis(150), third.read(&mut buf)).await;
        assert!(held.is_err(), "third client should still be waiting");

        // Freeing one member lets the held client proceed
        drop(first);
        let n = timeout(Duration::from_secs(2), third.read(&mut buf))
            .await
            .expect("held client was never served")
            .unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pool_serves_a_unix_socket_endpoint() {
        let server = spawn_mock(0).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvlink.sock");
        let endpoint = Endpoint::parse(path.to_str().unwrap()).unwrap();

        let pool = Pool::bind(pool_config(server.addr, 1), &endpoint)
            .await
            .unwrap();
        tokio::spawn(pool.run());

        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        client.write_all(b"PING\r\n").await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("relay did not answer over the domain socket")
            .unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal_setup_failure() {
        let server = spawn_mock(0).await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = Pool::bind(pool_config(server.addr, 1), &Endpoint::Tcp(port)).await;
        assert!(result.is_err());
    }
}
