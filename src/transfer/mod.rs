//! DCC file transfer sessions
//!
//! A transfer couples one socket session with one local file. The send and
//! receive roles implement the block/acknowledgement protocol; the
//! [`TransferRegistry`] tracks live transfers so later CTCP exchanges
//! (RESUME, ACCEPT, reverse SEND responses) can be matched back to the
//! session they concern.
//!
//! Direction and socket role are independent: a normal send listens and a
//! normal receive connects, while reverse DCC flips both, so all four
//! combinations occur.

mod receive;
mod registry;
mod send;

pub use registry::TransferRegistry;
pub(crate) use registry::RegistryGuard;

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::event::{EventSender, SessionId};
use crate::net::{self, Endpoint, Lifecycle, NetError};

use receive::ReceiveIo;
use send::SendIo;

/// Direction of a file transfer, independent of listen/connect role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Local file streamed to the peer
    Send,
    /// Peer data written to a local file
    Receive,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Receive => write!(f, "receive"),
        }
    }
}

/// Live state of one file transfer
///
/// Shared by `Arc` between the owner's [`DccTransfer`] handle, the
/// [`TransferRegistry`] and the session task. Progress counters are atomic
/// so observers read them without locks while the session streams.
pub struct TransferSession {
    id: SessionId,
    kind: TransferKind,
    filename: String,
    path: PathBuf,
    size: Option<u64>,
    block_size: usize,
    turbo: bool,
    reverse: bool,
    token: Mutex<Option<String>>,
    remote: Mutex<Option<SocketAddr>>,
    local_port: AtomicU16,
    start_position: AtomicU64,
    bytes_transferred: AtomicU64,
    lifecycle: Arc<Lifecycle>,
    close_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl TransferSession {
    /// This session's identifier, as carried by its events
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Name advertised on the wire
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Local file backing the transfer
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared size; `None` when the peer never advertised one
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn turbo(&self) -> bool {
        self.turbo
    }

    /// Whether the usual listen/connect roles are swapped
    pub fn reverse(&self) -> bool {
        self.reverse
    }

    /// Correlation token, once assigned
    pub fn token(&self) -> Option<String> {
        self.token.lock().expect("token lock poisoned").clone()
    }

    pub(crate) fn set_token(&self, token: String) {
        *self.token.lock().expect("token lock poisoned") = Some(token);
    }

    /// Peer endpoint, once known
    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock().expect("remote lock poisoned")
    }

    pub(crate) fn set_remote(&self, addr: SocketAddr) {
        *self.remote.lock().expect("remote lock poisoned") = Some(addr);
    }

    /// Port this transfer listens on; 0 until bound
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Relaxed)
    }

    fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Relaxed);
    }

    /// Byte offset the transfer starts from; nonzero only after a resume
    pub fn start_position(&self) -> u64 {
        self.start_position.load(Ordering::Acquire)
    }

    /// Bytes moved since the start of the file, resume offset included
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes(&self, bytes: u64) -> u64 {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    /// Whether the declared size has been fully moved
    ///
    /// External layers classify a closed session by this comparison; the
    /// engine itself never labels an outcome.
    pub fn is_complete(&self) -> bool {
        self.size
            .is_some_and(|size| self.bytes_transferred() >= size)
    }

    /// Record the byte offset at which the transfer will begin
    ///
    /// For a send the offset is clamped to the source length and the value
    /// actually granted is returned; the file itself is positioned when the
    /// socket opens. A receive with a nonzero start appends to its existing
    /// output file.
    pub async fn set_file_start(&self, offset: u64) -> io::Result<u64> {
        let granted = match self.kind {
            TransferKind::Send => {
                let len = tokio::fs::metadata(&self.path).await?.len();
                offset.min(len)
            }
            TransferKind::Receive => offset,
        };
        self.start_position.store(granted, Ordering::Release);
        self.bytes_transferred.store(granted, Ordering::Release);
        Ok(granted)
    }

    /// Signal the session to shut down; idempotent, safe from any task
    pub fn request_close(&self) {
        self.lifecycle.request_close();
    }

    /// Whether the session has reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub(crate) fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    fn take_close_rx(&self) -> Option<oneshot::Receiver<()>> {
        self.close_rx.lock().expect("close receiver lock poisoned").take()
    }
}

/// Owner's handle to a registered file transfer
#[derive(Clone)]
pub struct DccTransfer {
    session: Arc<TransferSession>,
}

impl DccTransfer {
    /// Register a new transfer with the live registry
    ///
    /// The session exists but owns no socket until one of
    /// [`connect`](Self::connect), [`listen`](Self::listen) or
    /// [`listen_in_range`](Self::listen_in_range) starts it.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        registry: &TransferRegistry,
        kind: TransferKind,
        filename: String,
        path: PathBuf,
        size: Option<u64>,
        block_size: usize,
        turbo: bool,
        reverse: bool,
    ) -> DccTransfer {
        let (lifecycle, close_rx) = Lifecycle::new();
        let session = Arc::new(TransferSession {
            id: SessionId::next(),
            kind,
            filename,
            path,
            size,
            block_size,
            turbo,
            reverse,
            token: Mutex::new(None),
            remote: Mutex::new(None),
            local_port: AtomicU16::new(0),
            start_position: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            lifecycle,
            close_rx: Mutex::new(Some(close_rx)),
        });
        registry.insert(Arc::clone(&session));
        DccTransfer { session }
    }

    pub(crate) fn from_session(session: Arc<TransferSession>) -> DccTransfer {
        DccTransfer { session }
    }

    /// The shared session state
    pub fn session(&self) -> &Arc<TransferSession> {
        &self.session
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Dial the peer and start the session task
    pub fn connect(
        &self,
        addr: SocketAddr,
        registry: &Arc<TransferRegistry>,
        events: EventSender,
    ) {
        self.session.set_remote(addr);
        self.spawn(Endpoint::Connect(addr), registry, events);
    }

    /// Bind an ephemeral port, start the session task, return the port
    pub fn listen(
        &self,
        registry: &Arc<TransferRegistry>,
        events: EventSender,
    ) -> io::Result<u16> {
        let listener = net::bind_listener(0)?;
        let port = listener.local_addr()?.port();
        self.session.set_local_port(port);
        self.spawn(Endpoint::Listen(listener), registry, events);
        Ok(port)
    }

    /// Like [`listen`](Self::listen), trying each port in `[first, last]`
    pub fn listen_in_range(
        &self,
        first: u16,
        last: u16,
        registry: &Arc<TransferRegistry>,
        events: EventSender,
    ) -> Result<u16, NetError> {
        let listener = net::listen_in_range(first, last)?;
        let port = listener.local_addr().map_err(NetError::Io)?.port();
        self.session.set_local_port(port);
        self.spawn(Endpoint::Listen(listener), registry, events);
        Ok(port)
    }

    /// Close the session; idempotent, safe from any task
    pub fn close(&self) {
        self.session.request_close();
    }

    fn spawn(
        &self,
        endpoint: Endpoint,
        registry: &Arc<TransferRegistry>,
        events: EventSender,
    ) {
        // A session runs at most once; a second start request is a no-op
        let Some(close_rx) = self.session.take_close_rx() else {
            return;
        };
        let session = Arc::clone(&self.session);
        let registry = Arc::clone(registry);
        tokio::spawn(async move {
            let _guard = RegistryGuard::new(registry, session.id());
            let id = session.id();
            let lifecycle = session.lifecycle();
            match session.kind() {
                TransferKind::Send => {
                    let io = SendIo::new(Arc::clone(&session), events.clone());
                    net::run(id, endpoint, close_rx, lifecycle, events, io).await;
                }
                TransferKind::Receive => {
                    let io = ReceiveIo::new(Arc::clone(&session), events.clone());
                    net::run(id, endpoint, close_rx, lifecycle, events, io).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_transfer(registry: &TransferRegistry, kind: TransferKind, path: PathBuf) -> DccTransfer {
        DccTransfer::register(
            registry,
            kind,
            "file.bin".to_string(),
            path,
            Some(1000),
            1024,
            false,
            false,
        )
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(TransferKind::Send.to_string(), "send");
        assert_eq!(TransferKind::Receive.to_string(), "receive");
    }

    #[test]
    fn test_session_accessors() {
        let registry = TransferRegistry::new();
        let transfer = make_transfer(&registry, TransferKind::Send, PathBuf::from("/tmp/file.bin"));
        let session = transfer.session();

        assert_eq!(session.kind(), TransferKind::Send);
        assert_eq!(session.filename(), "file.bin");
        assert_eq!(session.size(), Some(1000));
        assert_eq!(session.local_port(), 0);
        assert_eq!(session.bytes_transferred(), 0);
        assert!(session.token().is_none());
        assert!(session.remote().is_none());
        assert!(!session.is_complete());
        assert!(!session.is_closed());

        assert_eq!(session.add_bytes(600), 600);
        assert_eq!(session.add_bytes(400), 1000);
        assert!(session.is_complete());
    }

    #[tokio::test]
    async fn test_set_file_start_clamps_to_source_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        tokio::fs::write(&path, vec![7u8; 100]).await.unwrap();

        let registry = TransferRegistry::new();
        let transfer = make_transfer(&registry, TransferKind::Send, path);
        let session = transfer.session();

        assert_eq!(session.set_file_start(40).await.unwrap(), 40);
        assert_eq!(session.start_position(), 40);
        assert_eq!(session.bytes_transferred(), 40);

        // Past the end of the source: granted offset stops at the length
        assert_eq!(session.set_file_start(500).await.unwrap(), 100);
        assert_eq!(session.start_position(), 100);
    }

    #[tokio::test]
    async fn test_set_file_start_receive_takes_offset_verbatim() {
        let registry = TransferRegistry::new();
        let transfer = make_transfer(
            &registry,
            TransferKind::Receive,
            PathBuf::from("/nonexistent/out.bin"),
        );
        assert_eq!(transfer.session().set_file_start(321).await.unwrap(), 321);
    }

    #[tokio::test]
    async fn test_set_file_start_missing_source_errors() {
        let registry = TransferRegistry::new();
        let transfer = make_transfer(
            &registry,
            TransferKind::Send,
            PathBuf::from("/nonexistent/source.bin"),
        );
        assert!(transfer.session().set_file_start(10).await.is_err());
    }
}
