//! Host-side vsock endpoint for Firecracker VM communication.
//!
//! Connects to a guest agent via Unix domain socket (Firecracker forwards
//! vsock connections to `{vsock_path}_{port}` UDS files).
//!
//! ## Connection Flow
//!
//! 1. Host creates UDS listener at `{vsock_path}_{port}`
//! 2. Guest boots and its agent connects to CID=2, port 1000
//! 3. Firecracker forwards the connection to the host's UDS listener
//! 4. Host accepts, receives `ready`, sends `ping`, waits for `pong`
//! 5. Connection established — the host can send requests
//!
//! The socket is full-duplex: requests carry fresh UUID ids, a background
//! reader task routes each response to the pending request with the same
//! id. Response ordering is not guaranteed, only correlation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use uuid::Uuid;

use guest_client::{ExecOutput, GuestClient, GuestError, Result};
use vsock_proto::{Decoder, ErrorPayload, ExecPayload, ExecResultPayload, Message};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Extra deadline slack on top of the guest-side command timeout, covering
/// transport latency.
const NETWORK_SLACK: Duration = Duration::from_secs(5);

/// Requests in flight, keyed by correlation id.
///
/// `closed` flips once, after which no new request may register and every
/// drained sender is dropped — its receiver observes `ConnectionClosed`.
#[derive(Default)]
#[derive(Debug)]
struct PendingMap {
    closed: bool,
    senders: HashMap<String, oneshot::Sender<Message>>,
}

/// Host-side vsock RPC client.
///
/// Cheap to share behind `&self`: writes serialize on an async mutex, the
/// pending map on a std mutex (never held across await).
#[derive(Debug)]
pub struct VsockClient {
    write: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: std::sync::Arc<Mutex<PendingMap>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VsockClient {
    /// Wait for a guest to connect on the vsock UDS path.
    ///
    /// Binds a listener at `{vsock_path}_1000` (unlinking any stale socket
    /// file first), accepts the first connection, and performs the
    /// ready/ping/pong handshake, all within `timeout`.
    pub async fn wait_for_connection(vsock_path: &str, timeout: Duration) -> Result<Self> {
        let listener_path = format!("{vsock_path}_{}", vsock_proto::VSOCK_PORT);

        // Clean up stale socket from a previous crashed VM
        let _ = std::fs::remove_file(&listener_path);

        let listener = UnixListener::bind(&listener_path)?;
        let deadline = Instant::now() + timeout;

        let accept_result = time::timeout_at(deadline, listener.accept()).await;

        // Only one connection is ever expected; drop the listener either way.
        drop(listener);
        let _ = std::fs::remove_file(&listener_path);

        let (stream, _) = accept_result.map_err(|_| GuestError::ConnectTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })??;

        Self::from_stream(stream, deadline, timeout).await
    }

    /// Build a client from an already-accepted stream (handshake included).
    async fn from_stream(
        mut stream: UnixStream,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Self> {
        let mut decoder = Decoder::new();
        handshake(&mut stream, &mut decoder, deadline, timeout).await?;

        let (read, write) = stream.into_split();
        let pending = std::sync::Arc::new(Mutex::new(PendingMap::default()));

        let reader = tokio::spawn(read_loop(read, decoder, std::sync::Arc::clone(&pending)));

        Ok(Self {
            write: tokio::sync::Mutex::new(write),
            pending,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Register a pending request. Fails if the connection is closed.
    fn register(&self, id: String) -> Result<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().map_err(poisoned)?;
        if pending.closed {
            return Err(GuestError::ConnectionClosed);
        }
        pending.senders.insert(id, tx);
        Ok(rx)
    }

    /// Remove a pending request (after a timeout).
    fn unregister(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.senders.remove(id);
        }
    }

    /// Send a request and wait for the response with the same id.
    async fn request(&self, msg: &Message, timeout: Duration) -> Result<Message> {
        let id = msg.id().to_string();
        let rx = self.register(id.clone())?;

        let frame = vsock_proto::encode(msg).map_err(|e| GuestError::Protocol(e.to_string()))?;
        {
            let mut write = self.write.lock().await;
            if let Err(e) = write.write_all(&frame).await {
                self.unregister(&id);
                return Err(GuestError::Io(e));
            }
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // Sender dropped: the reader drained the map on disconnect.
            Ok(Err(_)) => Err(GuestError::ConnectionClosed),
            Err(_) => {
                self.unregister(&id);
                Err(GuestError::RequestTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Execute a command on the guest, failing on transport errors.
    ///
    /// The [`GuestClient`] impl wraps this into the never-failing `exec`.
    async fn exec_inner(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let msg = Message::Exec {
            id: Uuid::new_v4().to_string(),
            payload: ExecPayload {
                command: command.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
        };

        let resp = self.request(&msg, timeout + NETWORK_SLACK).await?;
        match resp {
            Message::ExecResult {
                payload:
                    ExecResultPayload {
                        exit_code,
                        stdout,
                        stderr,
                    },
                ..
            } => Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            }),
            Message::Error {
                payload: ErrorPayload { message },
                ..
            } => Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: message,
            }),
            other => Err(GuestError::Protocol(format!(
                "unexpected response to exec: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl GuestClient for VsockClient {
    async fn exec(&self, command: &str, timeout: Duration) -> ExecOutput {
        match self.exec_inner(command, timeout).await {
            Ok(output) => output,
            Err(e) => ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        }
    }

    async fn close(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.closed = true;
            pending.senders.clear();
        }
        if let Ok(mut reader) = self.reader.lock()
            && let Some(handle) = reader.take()
        {
            handle.abort();
        }
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> GuestError {
    GuestError::ConnectionClosed
}

/// Perform the connection handshake: ready → ping → pong.
async fn handshake(
    stream: &mut UnixStream,
    decoder: &mut Decoder,
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut queue: Vec<Message> = Vec::new();

    // Wait for ready
    read_until(stream, decoder, &mut buf, &mut queue, deadline, timeout, |m| {
        matches!(m, Message::Ready { .. })
    })
    .await?;

    // Send ping, wait for pong with matching id
    let ping_id = Uuid::new_v4().to_string();
    let ping = vsock_proto::encode(&Message::Ping {
        id: ping_id.clone(),
    })
    .map_err(|e| GuestError::Protocol(e.to_string()))?;
    stream.write_all(&ping).await?;

    read_until(stream, decoder, &mut buf, &mut queue, deadline, timeout, |m| {
        matches!(m, Message::Pong { id } if *id == ping_id)
    })
    .await?;

    Ok(())
}

/// Read frames until one matches `predicate` or the deadline passes.
#[allow(clippy::too_many_arguments)]
async fn read_until(
    stream: &mut UnixStream,
    decoder: &mut Decoder,
    buf: &mut [u8],
    queue: &mut Vec<Message>,
    deadline: Instant,
    timeout: Duration,
    predicate: impl Fn(&Message) -> bool,
) -> Result<Message> {
    loop {
        if let Some(pos) = queue.iter().position(&predicate) {
            return Ok(queue.remove(pos));
        }

        let n = time::timeout_at(deadline, stream.read(buf))
            .await
            .map_err(|_| GuestError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;
        if n == 0 {
            return Err(GuestError::ConnectionClosed);
        }

        let messages = decoder
            .decode(buf.get(..n).unwrap_or_default())
            .map_err(|e| GuestError::Protocol(e.to_string()))?;
        queue.extend(messages);
    }
}

/// Background reader: routes responses to pending requests by id.
///
/// On EOF, a read error, or a protocol error, the pending map is drained —
/// every waiting request observes `ConnectionClosed`.
async fn read_loop(
    mut read: tokio::net::unix::OwnedReadHalf,
    mut decoder: Decoder,
    pending: std::sync::Arc<Mutex<PendingMap>>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let messages = match decoder.decode(buf.get(..n).unwrap_or_default()) {
            Ok(messages) => messages,
            // Framing is broken; nothing further can be trusted.
            Err(_) => break,
        };

        let Ok(mut pending) = pending.lock() else {
            break;
        };
        for msg in messages {
            // Unknown ids (timed-out requests, unsolicited messages) are dropped.
            if let Some(tx) = pending.senders.remove(msg.id()) {
                let _ = tx.send(msg);
            }
        }
    }

    if let Ok(mut pending) = pending.lock() {
        pending.closed = true;
        pending.senders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mock guest handshake: send ready, read ping, send pong.
    async fn mock_handshake(stream: &mut UnixStream, decoder: &mut Decoder) {
        let ready = vsock_proto::encode(&Message::Ready {
            id: Uuid::new_v4().to_string(),
        })
        .unwrap();
        stream.write_all(&ready).await.unwrap();

        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let msgs = decoder.decode(&buf[..n]).unwrap();
        let Message::Ping { id } = &msgs[0] else {
            panic!("expected ping, got {:?}", msgs[0]);
        };

        let pong = vsock_proto::encode(&Message::Pong { id: id.clone() }).unwrap();
        stream.write_all(&pong).await.unwrap();
    }

    /// Read one request frame from the host side. `queue` buffers extra
    /// frames that arrive in the same read.
    async fn read_request(
        stream: &mut UnixStream,
        decoder: &mut Decoder,
        queue: &mut std::collections::VecDeque<Message>,
    ) -> Message {
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "host closed unexpectedly");
            queue.extend(decoder.decode(&buf[..n]).unwrap());
        }
    }

    fn exec_result(id: &str, exit_code: i32, stdout: &str, stderr: &str) -> Vec<u8> {
        vsock_proto::encode(&Message::ExecResult {
            id: id.into(),
            payload: ExecResultPayload {
                exit_code,
                stdout: stdout.into(),
                stderr: stderr.into(),
            },
        })
        .unwrap()
    }

    async fn connected_pair() -> (VsockClient, UnixStream, Decoder) {
        let (host_stream, mut guest) = UnixStream::pair().unwrap();
        let mut decoder = Decoder::new();

        let client = tokio::join!(
            VsockClient::from_stream(
                host_stream,
                Instant::now() + Duration::from_secs(5),
                Duration::from_secs(5),
            ),
            mock_handshake(&mut guest, &mut decoder),
        )
        .0
        .unwrap();

        (client, guest, decoder)
    }

    #[tokio::test]
    async fn exec_returns_result() {
        let (client, mut guest, mut decoder) = connected_pair().await;

        tokio::spawn(async move {
            let mut queue = std::collections::VecDeque::new();
            let msg = read_request(&mut guest, &mut decoder, &mut queue).await;
            let Message::Exec { id, payload } = msg else {
                panic!("expected exec");
            };
            assert_eq!(payload.command, "echo hello");
            guest
                .write_all(&exec_result(&id, 0, "hello\n", ""))
                .await
                .unwrap();
            // Keep the connection open until the client is done.
            let mut hold = [0u8; 1];
            let _ = guest.read(&mut hold).await;
        });

        let result = client.exec("echo hello", Duration::from_secs(5)).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn exec_error_response_becomes_exit_code_one() {
        let (client, mut guest, mut decoder) = connected_pair().await;

        tokio::spawn(async move {
            let mut queue = std::collections::VecDeque::new();
            let msg = read_request(&mut guest, &mut decoder, &mut queue).await;
            let resp = vsock_proto::encode(&Message::Error {
                id: msg.id().to_string(),
                payload: ErrorPayload {
                    message: "command not found".into(),
                },
            })
            .unwrap();
            guest.write_all(&resp).await.unwrap();
            let mut hold = [0u8; 1];
            let _ = guest.read(&mut hold).await;
        });

        let result = client.exec("badcmd", Duration::from_secs(5)).await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, "command not found");
    }

    #[tokio::test]
    async fn responses_are_matched_by_id_not_order() {
        let (client, mut guest, mut decoder) = connected_pair().await;

        tokio::spawn(async move {
            let mut queue = std::collections::VecDeque::new();
            let first = read_request(&mut guest, &mut decoder, &mut queue).await;
            let second = read_request(&mut guest, &mut decoder, &mut queue).await;

            // Answer in reverse order.
            guest
                .write_all(&exec_result(second.id(), 0, "second", ""))
                .await
                .unwrap();
            guest
                .write_all(&exec_result(first.id(), 0, "first", ""))
                .await
                .unwrap();
            let mut hold = [0u8; 1];
            let _ = guest.read(&mut hold).await;
        });

        let (a, b) = tokio::join!(
            client.exec("cmd-a", Duration::from_secs(5)),
            client.exec("cmd-b", Duration::from_secs(5)),
        );
        assert_eq!(a.stdout, "first");
        assert_eq!(b.stdout, "second");
    }

    #[tokio::test]
    async fn request_timeout_rejects_and_unregisters() {
        let (client, mut guest, mut decoder) = connected_pair().await;

        let hold = tokio::spawn(async move {
            // Swallow the request, never answer.
            let mut queue = std::collections::VecDeque::new();
            let _ = read_request(&mut guest, &mut decoder, &mut queue).await;
            let mut buf = [0u8; 1];
            let _ = guest.read(&mut buf).await;
        });

        // Drive request() directly so the test doesn't wait out the
        // network slack added by exec.
        let msg = Message::Exec {
            id: Uuid::new_v4().to_string(),
            payload: ExecPayload {
                command: "sleep 60".into(),
                timeout_ms: 50,
            },
        };
        let err = client
            .request(&msg, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestError::RequestTimeout { .. }));
        assert!(client.pending.lock().unwrap().senders.is_empty());
        hold.abort();
    }

    #[tokio::test]
    async fn disconnect_fails_pending_with_connection_closed() {
        let (client, mut guest, mut decoder) = connected_pair().await;

        tokio::spawn(async move {
            let mut queue = std::collections::VecDeque::new();
            let _ = read_request(&mut guest, &mut decoder, &mut queue).await;
            drop(guest);
        });

        let err = client
            .exec_inner("echo never", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestError::ConnectionClosed));
    }

    #[tokio::test]
    async fn close_rejects_new_requests() {
        let (client, _guest, _decoder) = connected_pair().await;
        client.close().await;

        let err = client
            .exec_inner("echo closed", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestError::ConnectionClosed));
    }

    #[tokio::test]
    async fn wait_for_connection_times_out_without_guest() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join("vsock.sock").display().to_string();

        let err = VsockClient::wait_for_connection(&vsock_path, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestError::ConnectTimeout { .. }));
        // Listener socket is cleaned up on failure.
        assert!(!std::path::Path::new(&format!("{vsock_path}_1000")).exists());
    }

    #[tokio::test]
    async fn wait_for_connection_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let vsock_path = dir.path().join("vsock.sock").display().to_string();
        let listener_path = format!("{vsock_path}_1000");
        std::fs::write(&listener_path, b"stale").unwrap();

        let host = tokio::spawn({
            let vsock_path = vsock_path.clone();
            async move {
                VsockClient::wait_for_connection(&vsock_path, Duration::from_secs(5)).await
            }
        });

        // Give the listener a moment to bind, then connect as the guest.
        let mut guest = loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            match UnixStream::connect(&listener_path).await {
                Ok(s) => break s,
                Err(_) => continue,
            }
        };
        let mut decoder = Decoder::new();
        mock_handshake(&mut guest, &mut decoder).await;

        let client = host.await.unwrap().unwrap();
        assert!(client.pending.lock().unwrap().senders.is_empty());
    }
}
