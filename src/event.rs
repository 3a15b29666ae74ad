//! Observer events for DCC sessions
//!
//! The engine reports lifecycle and progress through an unbounded channel
//! rather than direct callbacks, so observers (typically the UI) consume
//! events from any task without holding engine locks.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Unique identifier for a DCC session (chat or file transfer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next session identifier
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event reported to the session observer
///
/// `DataTransferred` carries the incremental count for one block; observers
/// accumulate. Failure is not a distinct event: a session that closes short
/// of its declared size failed, and only the observer can tell cancellation
/// from a network error.
#[derive(Debug, Clone)]
pub enum DccEvent {
    /// The session's socket completed its handshake
    SocketOpened { id: SessionId },

    /// The session's socket closed (completion, error or cancellation)
    SocketClosed { id: SessionId },

    /// One block of file data moved
    DataTransferred { id: SessionId, bytes: usize },

    /// One line of chat arrived from the peer
    ChatLine { id: SessionId, line: String },
}

/// Sending side of the observer channel
pub type EventSender = mpsc::UnboundedSender<DccEvent>;

/// Receiving side of the observer channel
pub type EventReceiver = mpsc::UnboundedReceiver<DccEvent>;

/// Create the observer channel for a [`DccManager`](crate::DccManager)
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
