//! Session and offer orchestration
//!
//! [`DccManager`] owns the transfer registry and turns inbound CTCP `DCC`
//! payloads into sessions, matched resumes, or replies for the IRC layer to
//! relay. Malformed payloads are dropped without surfacing an error: peers
//! and hostile servers routinely produce garbage, and a dropped offer is
//! the correct outcome, not a failure to report.
//!
//! The manager performs no IRC I/O. Replies come back as [`DccMessage`]
//! values; the caller wraps them in CTCP and sends them to the peer.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::chat::DccChat;
use crate::config::DccConfig;
use crate::ctcp::{self, DccMessage};
use crate::event::{EventSender, SessionId};
use crate::net::NetError;
use crate::transfer::{DccTransfer, TransferKind, TransferRegistry, TransferSession};

/// Wire name used when a local path has no usable file name
const FALLBACK_FILENAME: &str = "file";

/// Inbound file offer awaiting the user's decision
///
/// Surfaced by [`DccManager::handle_ctcp`]; the UI asks the user for a
/// destination and feeds the offer back through
/// [`DccManager::accept_offer`].
#[derive(Debug, Clone)]
pub struct SendOffer {
    /// Name advertised by the peer
    pub filename: String,
    /// Peer endpoint; `None` for a reverse offer (the peer will connect)
    pub remote: Option<SocketAddr>,
    /// Advertised size, when the peer sent one
    pub size: Option<u64>,
    /// Correlation token carried by reverse offers
    pub token: Option<String>,
    /// Peer requested turbo mode
    pub turbo: bool,
}

/// Outcome of one inbound CTCP `DCC` payload
pub enum DccReaction {
    /// A chat session was started; adopt the handle
    Chat(DccChat),
    /// A file offer awaiting [`DccManager::accept_offer`]
    Offer(SendOffer),
    /// Reply to relay to the peer over IRC
    Reply(DccMessage),
    /// The payload completed or updated an existing session
    Handled,
    /// Malformed or unmatched; dropped
    Ignored,
}

/// Coordinates DCC sessions for one IRC connection
pub struct DccManager {
    config: DccConfig,
    registry: Arc<TransferRegistry>,
    events: EventSender,
}

impl DccManager {
    pub fn new(config: DccConfig, events: EventSender) -> Self {
        Self {
            config,
            registry: Arc::new(TransferRegistry::new()),
            events,
        }
    }

    /// The live-transfer registry
    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DccConfig {
        &self.config
    }

    /// React to one inbound CTCP `DCC` payload
    pub async fn handle_ctcp(&self, payload: &str) -> DccReaction {
        let message = match ctcp::parse(payload) {
            Ok(message) => message,
            Err(err) => {
                if self.config.debug {
                    eprintln!("DCC: dropping malformed payload ({err}): {payload}");
                }
                return DccReaction::Ignored;
            }
        };

        match message {
            DccMessage::Chat { addr, port, .. } => self.handle_chat(addr, port),
            DccMessage::Send {
                filename,
                addr,
                port,
                size,
                token,
                turbo,
            } => self.handle_send(filename, addr, port, size, token, turbo),
            DccMessage::Resume {
                filename,
                port,
                offset,
                token,
            } => self.handle_resume(filename, port, offset, token).await,
            DccMessage::Accept {
                filename,
                port,
                offset,
                token,
            } => self.handle_accept(filename, port, offset, token).await,
        }
    }

    fn handle_chat(&self, addr: Ipv4Addr, port: u16) -> DccReaction {
        if port == 0 {
            return DccReaction::Ignored;
        }
        let chat = DccChat::connect(SocketAddr::from((addr, port)), self.events.clone());
        DccReaction::Chat(chat)
    }

    fn handle_send(
        &self,
        filename: String,
        addr: Ipv4Addr,
        port: u16,
        size: Option<u64>,
        token: Option<String>,
        turbo: bool,
    ) -> DccReaction {
        // A token we recognize means this SEND answers a reverse offer we
        // announced earlier: the peer is telling us where to connect
        if let Some(token) = token.as_deref() {
            if let Some(session) = self.registry.find_by_token(token) {
                if port == 0 {
                    return DccReaction::Ignored;
                }
                let transfer = DccTransfer::from_session(session);
                transfer.connect(
                    SocketAddr::from((addr, port)),
                    &self.registry,
                    self.events.clone(),
                );
                return DccReaction::Handled;
            }
        }

        let remote = (port != 0).then(|| SocketAddr::from((addr, port)));
        if remote.is_none() && token.is_none() {
            // A reverse offer without a token leaves no way to answer it
            return DccReaction::Ignored;
        }
        DccReaction::Offer(SendOffer {
            filename,
            remote,
            size,
            token,
            turbo,
        })
    }

    async fn handle_resume(
        &self,
        filename: String,
        port: u16,
        offset: u64,
        token: Option<String>,
    ) -> DccReaction {
        let Some(session) = self.registry.find_resume_target(
            TransferKind::Send,
            port,
            &filename,
            token.as_deref(),
        ) else {
            return DccReaction::Ignored;
        };

        match session.set_file_start(offset).await {
            Ok(granted) => DccReaction::Reply(DccMessage::Accept {
                filename,
                port,
                offset: granted,
                token,
            }),
            Err(err) => {
                if self.config.debug {
                    eprintln!("DCC: resume of {filename} failed: {err}");
                }
                DccReaction::Ignored
            }
        }
    }

    async fn handle_accept(
        &self,
        filename: String,
        port: u16,
        offset: u64,
        token: Option<String>,
    ) -> DccReaction {
        let Some(session) = self.registry.find_resume_target(
            TransferKind::Receive,
            port,
            &filename,
            token.as_deref(),
        ) else {
            return DccReaction::Ignored;
        };

        if session.set_file_start(offset).await.is_err() {
            return DccReaction::Ignored;
        }

        let transfer = DccTransfer::from_session(Arc::clone(&session));
        if session.reverse() {
            // Reverse resume: now that the offset is agreed, listen and
            // tell the peer where to connect
            match self.listen_per_config(&transfer) {
                Ok(local_port) => {
                    DccReaction::Reply(self.send_announcement(&session, local_port))
                }
                Err(err) => {
                    if self.config.debug {
                        eprintln!("DCC: listen for {filename} failed: {err}");
                    }
                    DccReaction::Ignored
                }
            }
        } else {
            match session.remote() {
                Some(addr) => {
                    transfer.connect(addr, &self.registry, self.events.clone());
                    DccReaction::Handled
                }
                None => DccReaction::Ignored,
            }
        }
    }

    /// Accept a previously surfaced file offer
    ///
    /// `resume` asks to continue an existing local file. When a reply is
    /// returned it must be relayed to the peer before data will flow; the
    /// transfer handle is returned either way for progress tracking and
    /// cancellation.
    pub async fn accept_offer(
        &self,
        offer: &SendOffer,
        save_to: PathBuf,
        resume: bool,
    ) -> Result<(DccTransfer, Option<DccMessage>), NetError> {
        let transfer = DccTransfer::register(
            &self.registry,
            TransferKind::Receive,
            offer.filename.clone(),
            save_to,
            offer.size,
            self.config.block_size,
            offer.turbo,
            offer.remote.is_none(),
        );
        let session = Arc::clone(transfer.session());
        if let Some(token) = &offer.token {
            session.set_token(token.clone());
        }

        let offset = if resume {
            existing_length(session.path()).await
        } else {
            0
        };

        match offer.remote {
            None => {
                if offset > 0 {
                    // Agree on the offset before announcing where to connect
                    let granted = session.set_file_start(offset).await.map_err(NetError::Io)?;
                    let reply = DccMessage::Resume {
                        filename: offer.filename.clone(),
                        port: 0,
                        offset: granted,
                        token: offer.token.clone(),
                    };
                    Ok((transfer, Some(reply)))
                } else {
                    let port = self.listen_per_config(&transfer)?;
                    let reply = self.send_announcement(&session, port);
                    Ok((transfer, Some(reply)))
                }
            }
            Some(addr) => {
                session.set_remote(addr);
                if offset > 0 {
                    let granted = session.set_file_start(offset).await.map_err(NetError::Io)?;
                    let reply = DccMessage::Resume {
                        filename: offer.filename.clone(),
                        port: addr.port(),
                        offset: granted,
                        token: offer.token.clone(),
                    };
                    Ok((transfer, Some(reply)))
                } else {
                    transfer.connect(addr, &self.registry, self.events.clone());
                    Ok((transfer, None))
                }
            }
        }
    }

    /// Offer a file to a peer; returns the handle and the announcement to
    /// relay
    ///
    /// Active mode listens and advertises the bound port. Passive (reverse)
    /// mode advertises port 0 with a correlation token and waits for the
    /// peer's answering SEND.
    pub async fn offer_send(&self, path: &Path) -> Result<(DccTransfer, DccMessage), NetError> {
        let size = tokio::fs::metadata(path).await.map_err(NetError::Io)?.len();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(FALLBACK_FILENAME)
            .to_string();

        let transfer = DccTransfer::register(
            &self.registry,
            TransferKind::Send,
            filename.clone(),
            path.to_path_buf(),
            Some(size),
            self.config.block_size,
            self.config.turbo,
            self.config.passive,
        );

        if self.config.passive {
            let token = self.registry.make_token(transfer.session());
            let announce = DccMessage::Send {
                filename,
                addr: self.config.local_address,
                port: 0,
                size: Some(size),
                token: Some(token),
                turbo: self.config.turbo,
            };
            Ok((transfer, announce))
        } else {
            let port = self.listen_per_config(&transfer)?;
            let announce = DccMessage::Send {
                filename,
                addr: self.config.local_address,
                port,
                size: Some(size),
                token: None,
                turbo: self.config.turbo,
            };
            Ok((transfer, announce))
        }
    }

    /// Offer a chat to a peer; returns the handle and the announcement to
    /// relay
    pub fn offer_chat(&self) -> Result<(DccChat, DccMessage), NetError> {
        let (chat, port) = if self.config.first_port == 0 {
            DccChat::listen(self.events.clone()).map_err(NetError::Io)?
        } else {
            DccChat::listen_in_range(
                self.config.first_port,
                self.config.last_port.max(self.config.first_port),
                self.events.clone(),
            )?
        };
        let announce = DccMessage::Chat {
            label: "chat".to_string(),
            addr: self.config.local_address,
            port,
        };
        Ok((chat, announce))
    }

    /// Close and unregister a transfer, whether or not it ever connected
    pub fn cancel(&self, id: SessionId) {
        if let Some(session) = self.registry.get(id) {
            session.request_close();
            self.registry.unregister(id);
        }
    }

    fn listen_per_config(&self, transfer: &DccTransfer) -> Result<u16, NetError> {
        if self.config.first_port == 0 {
            transfer
                .listen(&self.registry, self.events.clone())
                .map_err(NetError::Io)
        } else {
            transfer.listen_in_range(
                self.config.first_port,
                self.config.last_port.max(self.config.first_port),
                &self.registry,
                self.events.clone(),
            )
        }
    }

    fn send_announcement(&self, session: &TransferSession, port: u16) -> DccMessage {
        DccMessage::Send {
            filename: session.filename().to_string(),
            addr: self.config.local_address,
            port,
            size: session.size(),
            token: session.token(),
            turbo: session.turbo(),
        }
    }
}

async fn existing_length(path: &Path) -> u64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;

    fn make_manager() -> DccManager {
        let (tx, _rx) = event_channel();
        DccManager::new(DccConfig::default(), tx)
    }

    #[tokio::test]
    async fn test_malformed_send_is_ignored() {
        let manager = make_manager();
        let reaction = manager.handle_ctcp("DCC SEND foo abc 1000").await;
        assert!(matches!(reaction, DccReaction::Ignored));
        assert_eq!(manager.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let manager = make_manager();
        assert!(matches!(
            manager.handle_ctcp("DCC XMIT foo 123 456").await,
            DccReaction::Ignored
        ));
        assert!(matches!(
            manager.handle_ctcp("VERSION").await,
            DccReaction::Ignored
        ));
    }

    #[tokio::test]
    async fn test_chat_with_zero_port_is_ignored() {
        let manager = make_manager();
        let reaction = manager.handle_ctcp("DCC CHAT chat 2130706433 0").await;
        assert!(matches!(reaction, DccReaction::Ignored));
    }

    #[tokio::test]
    async fn test_fresh_send_offer_is_surfaced() {
        let manager = make_manager();
        let reaction = manager
            .handle_ctcp("DCC SEND file.bin 2130706433 4000 5000")
            .await;
        match reaction {
            DccReaction::Offer(offer) => {
                assert_eq!(offer.filename, "file.bin");
                assert_eq!(
                    offer.remote,
                    Some(SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 4000)))
                );
                assert_eq!(offer.size, Some(5000));
                assert!(!offer.turbo);
            }
            _ => panic!("expected an offer"),
        }
        // Nothing registered until the user accepts
        assert_eq!(manager.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_reverse_offer_without_token_is_ignored() {
        let manager = make_manager();
        let reaction = manager
            .handle_ctcp("DCC SEND file.bin 2130706433 0 5000")
            .await;
        assert!(matches!(reaction, DccReaction::Ignored));
    }

    #[tokio::test]
    async fn test_resume_without_matching_transfer_is_ignored() {
        let manager = make_manager();
        let reaction = manager.handle_ctcp("DCC RESUME file.bin 4000 100").await;
        assert!(matches!(reaction, DccReaction::Ignored));
    }

    #[tokio::test]
    async fn test_accept_without_matching_transfer_is_ignored() {
        let manager = make_manager();
        let reaction = manager.handle_ctcp("DCC ACCEPT file.bin 4000 100").await;
        assert!(matches!(reaction, DccReaction::Ignored));
    }
}
