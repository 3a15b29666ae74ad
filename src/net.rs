//! Socket lifecycle for DCC sessions
//!
//! One tokio task per session owns the socket end to end: it binds or dials,
//! waits for the connection, then drives the session's I/O loop. External
//! cancellation arrives on a oneshot close signal that is raced against
//! every blocking operation, so `close()` never has to touch the socket
//! from another task.
//!
//! Connection failures are not surfaced to the code that started the
//! session; they collapse into the closed event, which is all external
//! layers observe either way.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::event::{DccEvent, EventSender, SessionId};

/// Pending connections allowed on a DCC listening socket
const LISTEN_BACKLOG: i32 = 1;

/// Error from socket setup
///
/// Port-range exhaustion is the one failure the engine reports to its
/// caller directly; there is no session yet to report through.
#[derive(Debug)]
pub enum NetError {
    /// Every port in the requested range failed to bind
    NoPortsInRange { first: u16, last: u16 },
    /// Socket setup failed outside a port-range scan
    Io(io::Error),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPortsInRange { first, last } => {
                write!(f, "no available sockets in range {first}:{last}")
            }
            Self::Io(e) => write!(f, "socket error: {e}"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::NoPortsInRange { .. } => None,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Build a TCP listener with the single-connection backlog DCC uses
///
/// A port of 0 asks the OS for an ephemeral port; read it back from
/// `local_addr` for the CTCP announcement.
pub(crate) fn bind_listener(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Bind the first free port in `[first, last]`
///
/// Individual bind failures, including OS permission errors on privileged
/// ports, move on to the next candidate.
pub fn listen_in_range(first: u16, last: u16) -> Result<TcpListener, NetError> {
    for port in first..=last {
        if let Ok(listener) = bind_listener(port) {
            return Ok(listener);
        }
    }
    Err(NetError::NoPortsInRange { first, last })
}

/// Close-once bookkeeping shared between a session handle and its worker
///
/// `request_close` may be called from any task, any number of times; the
/// worker observes the signal at its next await point. `mark_closed`
/// guarantees the closed event fires exactly once even when an external
/// close races the worker's own shutdown.
pub(crate) struct Lifecycle {
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let lifecycle = Arc::new(Self {
            close_tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        (lifecycle, rx)
    }

    /// Signal the worker to shut down; idempotent
    pub(crate) fn request_close(&self) {
        let tx = self
            .close_tx
            .lock()
            .expect("close slot lock poisoned")
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Record the terminal state; the first caller wins
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// How a session reaches its peer
pub(crate) enum Endpoint {
    /// Bound socket awaiting the peer's connection
    Listen(TcpListener),
    /// Remote address to dial
    Connect(SocketAddr),
}

/// Per-session I/O strategy driven by [`run`]
///
/// `socket_opened` receives the established stream before any data moves;
/// `handle_socket` performs one unit of work and returns `false` to finish;
/// `socket_closed` releases per-session resources and always runs last.
pub(crate) trait SessionIo {
    async fn socket_opened(&mut self, stream: TcpStream) -> io::Result<()>;
    async fn handle_socket(&mut self) -> io::Result<bool>;
    async fn socket_closed(&mut self);
}

/// Wait for the session's stream, racing the close signal
async fn establish(
    endpoint: Endpoint,
    close_rx: &mut oneshot::Receiver<()>,
) -> Option<TcpStream> {
    match endpoint {
        Endpoint::Connect(addr) => tokio::select! {
            connected = TcpStream::connect(addr) => connected.ok(),
            _ = &mut *close_rx => None,
        },
        Endpoint::Listen(listener) => tokio::select! {
            // One connection only: the listener drops as soon as accept returns
            accepted = listener.accept() => accepted.ok().map(|(stream, _)| stream),
            _ = &mut *close_rx => None,
        },
    }
}

/// Drive one session to completion
pub(crate) async fn run<S: SessionIo>(
    id: SessionId,
    endpoint: Endpoint,
    mut close_rx: oneshot::Receiver<()>,
    lifecycle: Arc<Lifecycle>,
    events: EventSender,
    mut io: S,
) {
    let opened = match establish(endpoint, &mut close_rx).await {
        Some(stream) => io.socket_opened(stream).await.is_ok(),
        None => false,
    };

    if opened {
        let _ = events.send(DccEvent::SocketOpened { id });
        loop {
            tokio::select! {
                more = io.handle_socket() => match more {
                    Ok(true) => {}
                    Ok(false) | Err(_) => break,
                },
                _ = &mut close_rx => break,
            }
        }
    }

    io.socket_closed().await;
    if lifecycle.mark_closed() {
        let _ = events.send(DccEvent::SocketClosed { id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind_listener(0).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_listen_in_range_finds_free_port() {
        let holder = bind_listener(0).unwrap();
        let taken = holder.local_addr().unwrap().port();

        // A range starting on the taken port must skip past it
        let listener = listen_in_range(taken, taken.wrapping_add(20).max(taken)).ok();
        if let Some(listener) = listener {
            assert_ne!(listener.local_addr().unwrap().port(), taken);
        }
    }

    #[tokio::test]
    async fn test_listen_in_range_exhaustion() {
        let holder = bind_listener(0).unwrap();
        let taken = holder.local_addr().unwrap().port();

        let err = listen_in_range(taken, taken).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("no available sockets in range {taken}:{taken}")
        );
        assert!(matches!(err, NetError::NoPortsInRange { .. }));
    }

    #[test]
    fn test_lifecycle_close_once() {
        let (lifecycle, mut rx) = Lifecycle::new();
        assert!(!lifecycle.is_closed());

        lifecycle.request_close();
        lifecycle.request_close();
        assert!(rx.try_recv().is_ok());

        assert!(lifecycle.mark_closed());
        assert!(!lifecycle.mark_closed());
        assert!(lifecycle.is_closed());
    }

    #[test]
    fn test_net_error_display() {
        let err = NetError::NoPortsInRange { first: 40000, last: 40010 };
        assert_eq!(err.to_string(), "no available sockets in range 40000:40010");

        let err = NetError::from(io::Error::other("boom"));
        assert!(err.to_string().contains("boom"));
    }
}
