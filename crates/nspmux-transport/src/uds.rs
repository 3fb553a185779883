use std::collections::HashMap;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{
    ensure_open, Connection, Frame, ReadyState, SharedState, Transport, TransportEvent,
    TransportRequest, WriteOptions,
};
use crate::wire::{WireCodec, WireConfig};

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Unix domain socket listener producing framed [`Connection`]s.
///
/// Each accepted stream gets a reader task (wire frames to [`TransportEvent`]s)
/// and a writer task draining the outbound queue. Filesystem paths are
/// cleaned up via `Drop` when the inode still matches the one created here.
pub struct UdsListener {
    listener: UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    cleanup_on_drop: bool,
    config: WireConfig,
}

impl UdsListener {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on a filesystem-path Unix domain socket.
    ///
    /// If the file already exists and is a socket, it is removed first
    /// (stale socket cleanup). Must be called within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    path: path.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    path: path.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            TransportError::Bind {
                path: path.clone(),
                source: e,
            }
        })?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode: Some((created.dev(), created.ino())),
            cleanup_on_drop: true,
            config: WireConfig::default(),
        })
    }

    /// Override the wire configuration applied to accepted connections.
    pub fn with_config(mut self, config: WireConfig) -> Self {
        self.config = config;
        self
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<Connection> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::Accept)?;
        let request = TransportRequest {
            url: "/".to_string(),
            headers: HashMap::new(),
            address: describe_peer(&stream, &self.path),
            secure: false,
        };
        let conn = spawn_connection(stream, request, &self.config);
        debug!(id = conn.id(), "accepted connection");
        Ok(conn)
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UdsListener {
    fn drop(&mut self) {
        if !self.cleanup_on_drop {
            return;
        }
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

/// Connect to a listening Unix domain socket.
pub async fn connect(path: impl AsRef<Path>) -> Result<Connection> {
    connect_with_config(path, &WireConfig::default()).await
}

/// Connect with an explicit wire configuration.
pub async fn connect_with_config(path: impl AsRef<Path>, config: &WireConfig) -> Result<Connection> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
    debug!(?path, "connected to unix domain socket");
    let request = TransportRequest {
        url: "/".to_string(),
        headers: HashMap::new(),
        address: format!("unix:{}", path.display()),
        secure: false,
    };
    Ok(spawn_connection(stream, request, config))
}

fn describe_peer(stream: &UnixStream, path: &Path) -> String {
    match stream.peer_cred() {
        Ok(cred) => match cred.pid() {
            Some(pid) => format!("unix:{} uid={} pid={}", path.display(), cred.uid(), pid),
            None => format!("unix:{} uid={}", path.display(), cred.uid()),
        },
        Err(_) => format!("unix:{}", path.display()),
    }
}

struct UdsTransport {
    id: String,
    request: TransportRequest,
    state: SharedState,
    pending: Arc<AtomicUsize>,
    high_water: usize,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
}

impl Transport for UdsTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn request(&self) -> &TransportRequest {
        &self.request
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn writable(&self) -> bool {
        self.pending.load(Ordering::Acquire) < self.high_water
    }

    fn write(&self, frame: Frame, _opts: WriteOptions) -> Result<()> {
        // The stream wire has no per-frame compression; the option is accepted and ignored.
        ensure_open(&self.state)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.outbound.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    fn close(&self) {
        if self.state.close() {
            debug!(id = %self.id, "closing unix domain socket transport");
            self.shutdown.cancel();
        }
    }

    fn name(&self) -> &'static str {
        "unix-domain-socket"
    }
}

fn spawn_connection(stream: UnixStream, request: TransportRequest, config: &WireConfig) -> Connection {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, WireCodec::new(config.max_frame_size));
    let mut writer = FramedWrite::new(write_half, WireCodec::new(config.max_frame_size));

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let shutdown = CancellationToken::new();
    let state = SharedState::new(ReadyState::Open);
    let pending = Arc::new(AtomicUsize::new(0));

    {
        let shutdown = shutdown.clone();
        let state = state.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break "forced close".to_string(),
                    next = reader.next() => match next {
                        Some(Ok(frame)) => {
                            if event_tx.send(TransportEvent::Data(frame)).await.is_err() {
                                break "event receiver dropped".to_string();
                            }
                        }
                        Some(Err(err)) => {
                            warn!(%id, error = %err, "wire decode failed");
                            let _ = event_tx.send(TransportEvent::Error(err)).await;
                            break "transport error".to_string();
                        }
                        None => break "transport close".to_string(),
                    },
                }
            };
            state.close();
            shutdown.cancel();
            debug!(%id, %reason, "reader finished");
            let _ = event_tx.send(TransportEvent::Close(reason)).await;
        });
    }

    {
        let shutdown = shutdown.clone();
        let pending = Arc::clone(&pending);
        let id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = out_rx.recv() => match next {
                        Some(frame) => {
                            pending.fetch_sub(1, Ordering::AcqRel);
                            if let Err(err) = writer.send(frame).await {
                                warn!(%id, error = %err, "wire write failed");
                                shutdown.cancel();
                                return;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Frames queued before close (e.g. a final ERROR packet) still go out.
            while let Ok(frame) = out_rx.try_recv() {
                pending.fetch_sub(1, Ordering::AcqRel);
                if writer.feed(frame).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });
    }

    let transport = UdsTransport {
        id,
        request,
        state,
        pending,
        high_water: config.outbound_high_water,
        outbound: out_tx,
        shutdown,
    };
    Connection::new(Arc::new(transport), event_rx)
}
