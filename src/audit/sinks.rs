//! Audit event destinations.
//!
//! Every sink receives its own copy of an event as a flat JSON object and
//! must be safe to share between tasks.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// Event payload as handed to sinks.
pub type EventMap = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("sink is closed")]
    Closed,

    #[error("multiple sink errors: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<SinkError>),
}

impl SinkError {
    /// `Ok` for no errors, the error itself for one, `Multiple` otherwise.
    pub fn aggregate(mut errors: Vec<SinkError>) -> Result<(), SinkError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SinkError::Multiple(errors)),
        }
    }
}

/// A destination for audit events.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, event: EventMap) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError>;

    async fn close(&self) -> Result<(), SinkError>;
}

/// Writes one JSON object per line to stdout.
#[derive(Debug)]
pub struct StdoutSink {
    out: Mutex<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn write(&self, event: EventMap) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.out.lock().await.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

struct OpenFile {
    file: File,
    written: u64,
}

/// Appends JSON lines to a file, moving it to `<path>.1` once it reaches a size limit.
pub struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    state: Mutex<Option<OpenFile>>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl FileSink {
    /// Open (or create) `path`. A `max_size_mb` of zero disables rotation.
    pub async fn new(path: impl Into<PathBuf>, max_size_mb: u64) -> Result<Self, SinkError> {
        Self::with_max_bytes(path, max_size_mb.saturating_mul(1024 * 1024)).await
    }

    /// Like [`new`](Self::new) with the limit given in bytes.
    pub async fn with_max_bytes(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, SinkError> {
        let path = path.into();
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            max_bytes,
            state: Mutex::new(Some(OpenFile { file, written })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn rotate(&self, open: &mut OpenFile) -> Result<(), SinkError> {
        open.file.sync_all().await?;
        let mut rotated = self.path.as_os_str().to_owned();
        rotated.push(".1");
        tokio::fs::rename(&self.path, PathBuf::from(rotated)).await?;
        open.file = open_append(&self.path).await?;
        open.written = 0;
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&self, event: EventMap) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut state = self.state.lock().await;
        let open = state.as_mut().ok_or(SinkError::Closed)?;
        if self.max_bytes > 0 && open.written >= self.max_bytes {
            self.rotate(open).await?;
        }
        open.file.write_all(&line).await?;
        open.file.flush().await?;
        open.written += line.len() as u64;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if let Some(open) = state.as_mut() {
            open.file.flush().await?;
            open.file.sync_data().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if let Some(mut open) = state.take() {
            open.file.flush().await?;
            open.file.sync_all().await?;
        }
        Ok(())
    }
}

/// Sends each event as one JSON datagram over UDP.
#[derive(Debug)]
pub struct SyslogSink {
    socket: Mutex<Option<UdpSocket>>,
}

impl SyslogSink {
    /// Connect to the `host:port` syslog collector.
    pub async fn connect(host_port: &str) -> Result<Self, SinkError> {
        let target = tokio::net::lookup_host(host_port)
            .await?
            .next()
            .ok_or_else(|| SinkError::Delivery(format!("syslog address {host_port:?} did not resolve")))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self {
            socket: Mutex::new(Some(socket)),
        })
    }
}

#[async_trait]
impl Sink for SyslogSink {
    async fn write(&self, event: EventMap) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(&event)?;
        let socket = self.socket.lock().await;
        socket.as_ref().ok_or(SinkError::Closed)?.send(&payload).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.socket.lock().await.take();
        Ok(())
    }
}

type Callback = Arc<dyn Fn(EventMap) + Send + Sync>;

/// Hands each event to a user function.
#[derive(Clone)]
pub struct CallbackSink {
    callback: Callback,
}

impl CallbackSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(EventMap) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }
}

impl std::fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl Sink for CallbackSink {
    async fn write(&self, event: EventMap) -> Result<(), SinkError> {
        (self.callback)(event);
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Emits events as `tracing` records under the `penguin_aaa::audit` target.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl Sink for TracingSink {
    async fn write(&self, event: EventMap) -> Result<(), SinkError> {
        let field = |name: &str| event.get(name).and_then(Value::as_str).unwrap_or_default();
        tracing::info!(
            target: "penguin_aaa::audit",
            id = field("id"),
            event_type = field("type"),
            subject = field("subject"),
            action = field("action"),
            resource = field("resource"),
            outcome = field("outcome"),
            timestamp = field("timestamp"),
            "audit event"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
