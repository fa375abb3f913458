//! Authenticated, encrypted TCP control session to the storage daemon.
//!
//! Handshake: each side sends `version (1) + X25519 public key (32)`; the client pins the
//! daemon key. Every frame after that is `u32 LE length + ChaCha20-Poly1305 ciphertext` of
//! `query id (16) + TL payload`. Responses echo the id of their query and may arrive in
//! any order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::{
    decrypt_wire, derive_session_key, encrypt_wire, Keypair, PublicKey, CLIENT_TO_DAEMON,
    DAEMON_TO_CLIENT,
};
use crate::transport::{QueryTransport, TransportError};
use crate::wire::{encode_frame, frame_len};

pub const SESSION_VERSION: u8 = 1;
const HANDSHAKE_SIZE: usize = 1 + 32;
const QUERY_ID_LEN: usize = 16;

/// One direction of a session: key and nonce counter.
struct FrameCipher {
    key: [u8; 32],
    counter: u64,
}

impl FrameCipher {
    fn new(shared_secret: &[u8; 32], direction: &[u8]) -> Self {
        Self {
            key: derive_session_key(shared_secret, direction),
            counter: 0,
        }
    }

    fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>, TransportError> {
        let sealed = encrypt_wire(&self.key, self.counter, plain)?;
        self.counter += 1;
        Ok(sealed)
    }

    fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, TransportError> {
        let plain = decrypt_wire(&self.key, self.counter, sealed)?;
        self.counter += 1;
        Ok(plain)
    }
}

async fn write_sealed<W: AsyncWrite + Unpin>(
    w: &mut W,
    cipher: &mut FrameCipher,
    plain: &[u8],
) -> Result<(), TransportError> {
    let sealed = cipher.seal(plain)?;
    let frame = encode_frame(&sealed).map_err(|_| TransportError::FrameTooLarge)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

async fn read_sealed<R: AsyncRead + Unpin>(
    r: &mut R,
    cipher: &mut FrameCipher,
) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let len = frame_len(&header).map_err(|_| TransportError::FrameTooLarge)?;
    let mut sealed = vec![0u8; len];
    r.read_exact(&mut sealed).await?;
    cipher.open(&sealed)
}

fn hello(keypair: &Keypair) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = SESSION_VERSION;
    out[1..].copy_from_slice(keypair.public_key().as_bytes());
    out
}

fn parse_hello(buf: &[u8; HANDSHAKE_SIZE]) -> Result<PublicKey, TransportError> {
    if buf[0] != SESSION_VERSION {
        return Err(TransportError::Handshake(format!(
            "unsupported session version {}",
            buf[0]
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&buf[1..]);
    Ok(PublicKey::from_bytes(key))
}

async fn client_handshake(
    stream: &mut TcpStream,
    keypair: &Keypair,
    daemon_key: &PublicKey,
) -> Result<(FrameCipher, FrameCipher), TransportError> {
    stream.write_all(&hello(keypair)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let remote = parse_hello(&buf)?;
    if &remote != daemon_key {
        return Err(TransportError::Handshake(
            "daemon key does not match the pinned key".into(),
        ));
    }
    let shared = keypair.shared_secret(&remote);
    Ok((
        FrameCipher::new(&shared, CLIENT_TO_DAEMON),
        FrameCipher::new(&shared, DAEMON_TO_CLIENT),
    ))
}

#[derive(Default)]
struct Waiters {
    closed: bool,
    by_id: HashMap<Uuid, oneshot::Sender<Vec<u8>>>,
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client end of a control session. Queries may be issued concurrently.
pub struct ControlSession {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    waiters: Arc<Mutex<Waiters>>,
    timeout: Duration,
    tasks: [AbortHandle; 2],
}

impl ControlSession {
    /// Connect and authenticate. `timeout` bounds the connect, the handshake and every query.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        keypair: &Keypair,
        daemon_key: &PublicKey,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        let (send, recv) =
            tokio::time::timeout(timeout, client_handshake(&mut stream, keypair, daemon_key))
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;
        debug!(
            target: "bagpipe::session",
            peer = ?stream.peer_addr().ok(),
            "control session established"
        );
        Ok(Self::start(stream, send, recv, timeout))
    }

    fn start(stream: TcpStream, mut send: FrameCipher, mut recv: FrameCipher, timeout: Duration) -> Self {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let waiters = Arc::new(Mutex::new(Waiters::default()));

        let writer_task = tokio::spawn(async move {
            while let Some(plain) = rx.recv().await {
                if let Err(e) = write_sealed(&mut writer, &mut send, &plain).await {
                    warn!(target: "bagpipe::session", error = %e, "control session write failed");
                    break;
                }
            }
        });

        let reader_waiters = Arc::clone(&waiters);
        let reader_task = tokio::spawn(async move {
            loop {
                let plain = match read_sealed(&mut reader, &mut recv).await {
                    Ok(plain) => plain,
                    Err(e) => {
                        debug!(target: "bagpipe::session", error = %e, "control session closed");
                        break;
                    }
                };
                if plain.len() < QUERY_ID_LEN {
                    warn!(target: "bagpipe::session", len = plain.len(), "frame without query id");
                    break;
                }
                let (id, payload) = plain.split_at(QUERY_ID_LEN);
                let mut raw_id = [0u8; QUERY_ID_LEN];
                raw_id.copy_from_slice(id);
                let waiter = lock(&reader_waiters).by_id.remove(&Uuid::from_bytes(raw_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(payload.to_vec());
                    }
                    None => debug!(target: "bagpipe::session", "response for unknown or expired query"),
                }
            }
            let mut w = lock(&reader_waiters);
            w.closed = true;
            w.by_id.clear();
        });

        Self {
            outbound,
            waiters,
            timeout,
            tasks: [writer_task.abort_handle(), reader_task.abort_handle()],
        }
    }
}

#[async_trait]
impl QueryTransport for ControlSession {
    async fn query(&self, request: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut w = lock(&self.waiters);
            if w.closed {
                return Err(TransportError::Closed);
            }
            w.by_id.insert(id, tx);
        }

        let mut plain = Vec::with_capacity(QUERY_ID_LEN + request.len());
        plain.extend_from_slice(id.as_bytes());
        plain.extend_from_slice(&request);
        if self.outbound.send(plain).is_err() {
            lock(&self.waiters).by_id.remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                lock(&self.waiters).by_id.remove(&id);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Daemon end of a control session: answer queries one by one with `handler` until the
/// client disconnects. Returns the client's public key.
pub async fn serve_session<H>(
    mut stream: TcpStream,
    keypair: &Keypair,
    handler: H,
) -> Result<PublicKey, TransportError>
where
    H: Fn(&[u8]) -> Vec<u8>,
{
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    let client = parse_hello(&buf)?;
    stream.write_all(&hello(keypair)).await?;
    stream.flush().await?;

    let shared = keypair.shared_secret(&client);
    let mut recv = FrameCipher::new(&shared, CLIENT_TO_DAEMON);
    let mut send = FrameCipher::new(&shared, DAEMON_TO_CLIENT);
    loop {
        let plain = match read_sealed(&mut stream, &mut recv).await {
            Ok(plain) => plain,
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(client);
            }
            Err(e) => return Err(e),
        };
        if plain.len() < QUERY_ID_LEN {
            return Err(TransportError::BadFrame("missing query id"));
        }
        let (id, payload) = plain.split_at(QUERY_ID_LEN);
        let mut reply = id.to_vec();
        reply.extend(handler(payload));
        write_sealed(&mut stream, &mut send, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response, SpeedLimits};
    use tokio::net::TcpListener;

    async fn daemon(keypair: Keypair) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_session(stream, &keypair, |payload| {
                match Request::decode(payload) {
                    Ok(Request::GetSpeedLimits) => Response::SpeedLimits(SpeedLimits {
                        download: -1.0,
                        upload: 4096.0,
                    }),
                    Ok(Request::RemoveBag { id, .. }) => Response::Error(hex::encode(id)),
                    _ => Response::Error("unsupported".into()),
                }
                .encode()
                .unwrap()
            })
            .await;
        });
        addr
    }

    #[tokio::test]
    async fn query_roundtrip_over_tcp() {
        let server = Keypair::generate();
        let pinned = *server.public_key();
        let addr = daemon(server).await;

        let session = ControlSession::connect(
            addr,
            &Keypair::generate(),
            &pinned,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let raw = session.query(Request::GetSpeedLimits.encode().unwrap()).await.unwrap();
        assert_eq!(
            Response::decode(&raw).unwrap(),
            Response::SpeedLimits(SpeedLimits {
                download: -1.0,
                upload: 4096.0
            })
        );
    }

    #[tokio::test]
    async fn concurrent_queries_are_matched_by_id() {
        let server = Keypair::generate();
        let pinned = *server.public_key();
        let addr = daemon(server).await;
        let session = Arc::new(
            ControlSession::connect(addr, &Keypair::generate(), &pinned, Duration::from_secs(5))
                .await
                .unwrap(),
        );

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let request = Request::RemoveBag {
                        id: [i; 32],
                        remove_files: false,
                    };
                    let raw = session.query(request.encode().unwrap()).await.unwrap();
                    (i, Response::decode(&raw).unwrap())
                })
            })
            .collect();
        for handle in handles {
            let (i, response) = handle.await.unwrap();
            assert_eq!(response, Response::Error(hex::encode([i; 32])));
        }
    }

    #[tokio::test]
    async fn wrong_daemon_key_is_rejected() {
        let addr = daemon(Keypair::generate()).await;
        let res = ControlSession::connect(
            addr,
            &Keypair::generate(),
            Keypair::generate().public_key(),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(res, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn silent_daemon_times_out() {
        let server = Keypair::generate();
        let pinned = *server.public_key();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_SIZE];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&hello(&server)).await.unwrap();
            let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
        });

        let session = ControlSession::connect(
            addr,
            &Keypair::generate(),
            &pinned,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let err = session.query(Request::GetBags.encode().unwrap()).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_daemon_fails_queries() {
        let server = Keypair::generate();
        let pinned = *server.public_key();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_SIZE];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&hello(&server)).await.unwrap();
        });

        let session = ControlSession::connect(
            addr,
            &Keypair::generate(),
            &pinned,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = session.query(Request::GetBags.encode().unwrap()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
