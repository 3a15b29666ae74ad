//! DCC engine for IRC clients
//!
//! Implements the Direct Client-to-Client protocol: peer-to-peer chat and
//! file transfer negotiated over CTCP and carried on a direct TCP socket,
//! including turbo sends, resume by byte offset, and token-matched reverse
//! (firewall-traversing) offers.
//!
//! The IRC connection, user interface and preference storage are external.
//! They feed inbound CTCP payloads to [`DccManager::handle_ctcp`], relay
//! the [`DccMessage`] replies it returns, and watch session progress on the
//! [`DccEvent`] channel.

pub mod chat;
pub mod config;
pub mod ctcp;
pub mod event;
pub mod net;
pub mod offers;
pub mod transfer;

pub use chat::DccChat;
pub use config::DccConfig;
pub use ctcp::DccMessage;
pub use event::{DccEvent, EventReceiver, EventSender, SessionId, event_channel};
pub use net::NetError;
pub use offers::{DccManager, DccReaction, SendOffer};
pub use transfer::{DccTransfer, TransferKind, TransferRegistry, TransferSession};

/// Default chunk size for file transfer I/O
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_block_size() {
        assert_eq!(DEFAULT_BLOCK_SIZE, 1024);
        assert_eq!(DccConfig::default().block_size, DEFAULT_BLOCK_SIZE);
    }
}
