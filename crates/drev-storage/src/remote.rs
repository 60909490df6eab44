//! Remote file-store transport: the session contract, an FTP implementation
//! and an in-memory tree used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{BackoffPolicy, RetryDisposition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl RemoteEntry {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Directory,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory && self.name != "." && self.name != ".."
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connecting to {addr}: {message}")]
    Connect { addr: String, message: String },
    #[error("listing {path}: {message}")]
    List { path: String, message: String },
    #[error("downloading {path}: {message}")]
    Download { path: String, message: String },
    #[error("{path} not found on remote store")]
    NotFound { path: String },
    #[error("remote session already closed")]
    SessionClosed,
    #[error("connection lost during {path}: {message}")]
    Io { path: String, message: String },
    #[error("remote worker failed: {0}")]
    Worker(String),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound { .. })
    }

    /// True when the session itself is unusable, as opposed to one path failing.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::Io { .. }
                | TransportError::SessionClosed
                | TransportError::Worker(_)
        )
    }
}

/// One open connection to the remote store.
#[async_trait]
pub trait RemoteSession: Send {
    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    async fn download(&mut self, path: &str) -> Result<Vec<u8>, TransportError>;

    /// Releases the connection. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, TransportError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            user: "anonymous".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }
}

pub fn classify_io_error(err: &std::io::Error) -> RetryDisposition {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_ftp_error(err: &FtpError) -> RetryDisposition {
    match err {
        FtpError::ConnectionError(io) => classify_io_error(io),
        _ => RetryDisposition::NonRetryable,
    }
}

/// Connects over plain FTP, IPv4 only, with retries on transient socket errors.
#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteConnector for FtpConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        let span = info_span!("ftp_session", host = %self.config.host, port = self.config.port);
        let backoff = self.config.backoff;
        async move {
            let mut attempt = 0usize;
            loop {
                let config = self.config.clone();
                let result = tokio::task::spawn_blocking(move || open_stream(&config))
                    .await
                    .map_err(|e| TransportError::Worker(e.to_string()))?;
                match result {
                    Ok(stream) => {
                        info!(attempt, "ftp session opened");
                        return Ok(Box::new(FtpSession {
                            stream: Some(stream),
                        }) as Box<dyn RemoteSession>);
                    }
                    Err((RetryDisposition::Retryable, err)) if attempt < backoff.max_retries => {
                        let delay = backoff.delay_for_attempt(attempt);
                        warn!(attempt, ?delay, error = %err, "ftp connect failed; retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err((_, err)) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    fn describe(&self) -> String {
        format!("ftp://{}@{}:{}", self.config.user, self.config.host, self.config.port)
    }
}

fn open_stream(config: &FtpConfig) -> Result<FtpStream, (RetryDisposition, TransportError)> {
    let addr_label = format!("{}:{}", config.host, config.port);
    let connect_err = |message: String| TransportError::Connect {
        addr: addr_label.clone(),
        message,
    };

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| (classify_io_error(&e), connect_err(e.to_string())))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            (
                RetryDisposition::NonRetryable,
                connect_err("host has no IPv4 address".to_string()),
            )
        })?;

    let mut stream = FtpStream::connect_timeout(addr, config.timeout)
        .map_err(|e| (classify_ftp_error(&e), connect_err(e.to_string())))?;
    stream
        .get_ref()
        .set_read_timeout(Some(config.timeout))
        .map_err(|e| (RetryDisposition::NonRetryable, connect_err(e.to_string())))?;
    stream
        .get_ref()
        .set_write_timeout(Some(config.timeout))
        .map_err(|e| (RetryDisposition::NonRetryable, connect_err(e.to_string())))?;
    stream
        .login(config.user.as_str(), config.password.as_str())
        .map_err(|e| (RetryDisposition::NonRetryable, connect_err(format!("login: {e}"))))?;
    stream
        .transfer_type(FileType::Binary)
        .map_err(|e| (classify_ftp_error(&e), connect_err(e.to_string())))?;
    Ok(stream)
}

/// The blocking FTP stream is moved onto the blocking pool for each command.
pub struct FtpSession {
    stream: Option<FtpStream>,
}

impl FtpSession {
    async fn with_stream<T, F>(&mut self, op: F) -> Result<T, TransportError>
    where
        F: FnOnce(&mut FtpStream) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let mut stream = self.stream.take().ok_or(TransportError::SessionClosed)?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|e| TransportError::Worker(e.to_string()))?;
        self.stream = Some(stream);
        result
    }
}

#[async_trait]
impl RemoteSession for FtpSession {
    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        let path = path.to_string();
        self.with_stream(move |stream| {
            let lines = stream.list(Some(&path)).map_err(|e| match e {
                FtpError::ConnectionError(io) => TransportError::Io {
                    path: path.clone(),
                    message: io.to_string(),
                },
                other => TransportError::List {
                    path: path.clone(),
                    message: other.to_string(),
                },
            })?;
            Ok(parse_list_lines(&lines))
        })
        .await
    }

    async fn download(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let path = path.to_string();
        self.with_stream(move |stream| match stream.retr_as_buffer(&path) {
            Ok(cursor) => Ok(cursor.into_inner()),
            Err(FtpError::UnexpectedResponse(response))
                if response.status == Status::FileUnavailable =>
            {
                Err(TransportError::NotFound { path })
            }
            Err(FtpError::ConnectionError(io)) => Err(TransportError::Io {
                path,
                message: io.to_string(),
            }),
            Err(err) => Err(TransportError::Download {
                path,
                message: err.to_string(),
            }),
        })
        .await
    }

    async fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        let quit = tokio::task::spawn_blocking(move || stream.quit()).await;
        match quit {
            Ok(Ok(())) => debug!("ftp session closed"),
            Ok(Err(err)) => debug!(error = %err, "ftp quit failed; dropping connection"),
            Err(err) => debug!(error = %err, "ftp quit worker failed"),
        }
    }
}

/// Parses raw LIST output; lines in an unknown format are skipped.
pub fn parse_list_lines(lines: &[String]) -> Vec<RemoteEntry> {
    lines
        .iter()
        .filter_map(|line| match ListEntry::from_str(line) {
            Ok(entry) => Some(entry),
            Err(_) => {
                debug!(line = %line, "skipping unparseable LIST line");
                None
            }
        })
        .map(|entry| {
            let kind = if entry.is_directory() {
                EntryKind::Directory
            } else if entry.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            RemoteEntry {
                name: entry.name().to_string(),
                kind,
            }
        })
        .collect()
}

fn normalize_path(path: &str) -> String {
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>();
    format!("/{}", segments.join("/"))
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    Some(if idx == 0 {
        "/".to_string()
    } else {
        path[..idx].to_string()
    })
}

#[derive(Debug, Default)]
struct MemoryTree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    failing_lists: HashSet<String>,
    failing_downloads: HashSet<String>,
    refuse_connect: bool,
    drop_sessions: bool,
    connects: usize,
    lists: usize,
    downloads: usize,
    closes: usize,
}

impl MemoryTree {
    fn add_dir(&mut self, path: &str) {
        let mut current = Some(normalize_path(path));
        while let Some(dir) = current {
            current = parent_of(&dir);
            self.dirs.insert(dir);
        }
    }
}

/// In-memory remote store with failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    tree: Arc<Mutex<MemoryTree>>,
    gate: Option<Arc<Semaphore>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every listing waits for a permit from `gate` before answering.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn tree(&self) -> std::sync::MutexGuard<'_, MemoryTree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_dir(&self, path: &str) {
        self.tree().add_dir(path);
    }

    pub fn add_file(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let path = normalize_path(path);
        let mut tree = self.tree();
        if let Some(parent) = parent_of(&path) {
            tree.add_dir(&parent);
        }
        tree.files.insert(path, bytes.into());
    }

    pub fn remove_file(&self, path: &str) {
        self.tree().files.remove(&normalize_path(path));
    }

    pub fn fail_listing(&self, path: &str) {
        self.tree().failing_lists.insert(normalize_path(path));
    }

    pub fn fail_download(&self, path: &str) {
        self.tree().failing_downloads.insert(normalize_path(path));
    }

    /// Every later call on any session fails as a dropped connection.
    pub fn drop_sessions(&self, dropped: bool) {
        self.tree().drop_sessions = dropped;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.tree().refuse_connect = refuse;
    }

    pub fn connect_count(&self) -> usize {
        self.tree().connects
    }

    pub fn list_count(&self) -> usize {
        self.tree().lists
    }

    pub fn download_count(&self) -> usize {
        self.tree().downloads
    }

    pub fn close_count(&self) -> usize {
        self.tree().closes
    }
}

#[async_trait]
impl RemoteConnector for MemoryRemote {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        let mut tree = self.tree();
        if tree.refuse_connect {
            return Err(TransportError::Connect {
                addr: self.describe(),
                message: "connection refused".to_string(),
            });
        }
        tree.connects += 1;
        Ok(Box::new(MemoryRemoteSession {
            remote: self.clone(),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

pub struct MemoryRemoteSession {
    remote: MemoryRemote,
    closed: bool,
}

#[async_trait]
impl RemoteSession for MemoryRemoteSession {
    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }
        if let Some(gate) = &self.remote.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| TransportError::Worker(e.to_string()))?;
        }
        let path = normalize_path(path);
        let mut tree = self.remote.tree();
        tree.lists += 1;
        if tree.drop_sessions {
            return Err(TransportError::Io {
                path,
                message: "connection reset".to_string(),
            });
        }
        if tree.failing_lists.contains(&path) || !tree.dirs.contains(&path) {
            return Err(TransportError::List {
                path,
                message: "550 directory unavailable".to_string(),
            });
        }
        let is_child = |candidate: &String| parent_of(candidate).as_deref() == Some(path.as_str());
        let name_of = |p: &String| p.rsplit('/').next().unwrap_or_default().to_string();
        let mut entries = tree
            .dirs
            .iter()
            .filter(|d| is_child(d))
            .map(|d| RemoteEntry::dir(name_of(d)))
            .collect::<Vec<_>>();
        entries.extend(
            tree.files
                .keys()
                .filter(|f| is_child(f))
                .map(|f| RemoteEntry::file(name_of(f))),
        );
        Ok(entries)
    }

    async fn download(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }
        let path = normalize_path(path);
        let mut tree = self.remote.tree();
        tree.downloads += 1;
        if tree.drop_sessions {
            return Err(TransportError::Io {
                path,
                message: "connection reset".to_string(),
            });
        }
        if tree.failing_downloads.contains(&path) {
            return Err(TransportError::Download {
                path,
                message: "426 transfer aborted".to_string(),
            });
        }
        tree.files
            .get(&path)
            .cloned()
            .ok_or(TransportError::NotFound { path })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.remote.tree().closes += 1;
        }
    }
}
