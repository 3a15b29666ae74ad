//! Live-transfer registry
//!
//! Tracks every registered transfer so asynchronous CTCP exchanges can be
//! matched back to the session they concern: reverse SEND responses by
//! token, RESUME and ACCEPT by token or by `(port, filename)`. Owned by the
//! orchestration layer and shared with session tasks by `Arc` — lookups and
//! snapshots are safe from any task while transfers stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::event::SessionId;

use super::{TransferKind, TransferSession};

/// Registry of live file transfers
pub struct TransferRegistry {
    transfers: Mutex<HashMap<SessionId, Arc<TransferSession>>>,
}

impl TransferRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, session: Arc<TransferSession>) {
        self.transfers
            .lock()
            .expect("transfer registry lock poisoned")
            .insert(session.id(), session);
    }

    /// Remove a transfer; called by the session task when its socket
    /// closes, or by the owner when cancelling a session that never ran
    pub fn unregister(&self, id: SessionId) {
        self.transfers
            .lock()
            .expect("transfer registry lock poisoned")
            .remove(&id);
    }

    /// Look up a transfer by its session ID
    pub fn get(&self, id: SessionId) -> Option<Arc<TransferSession>> {
        self.transfers
            .lock()
            .expect("transfer registry lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Look up a transfer by correlation token
    ///
    /// An empty token never matches: absence of a token is not a key.
    pub fn find_by_token(&self, token: &str) -> Option<Arc<TransferSession>> {
        if token.is_empty() {
            return None;
        }
        self.transfers
            .lock()
            .expect("transfer registry lock poisoned")
            .values()
            .find(|t| t.token().as_deref() == Some(token))
            .cloned()
    }

    /// Find the transfer a RESUME or ACCEPT message refers to
    ///
    /// The token is authoritative when both the message and a transfer
    /// carry one; otherwise the advertised port and filename must both
    /// match. The port compared is the one the peer saw: the local
    /// listening port of a send, the peer's endpoint port of a receive.
    pub fn find_resume_target(
        &self,
        kind: TransferKind,
        port: u16,
        filename: &str,
        token: Option<&str>,
    ) -> Option<Arc<TransferSession>> {
        let transfers = self
            .transfers
            .lock()
            .expect("transfer registry lock poisoned");

        let token = token.filter(|t| !t.is_empty());
        if let Some(token) = token {
            if let Some(found) = transfers
                .values()
                .find(|t| t.kind() == kind && t.token().as_deref() == Some(token))
            {
                return Some(Arc::clone(found));
            }
        }

        transfers
            .values()
            .find(|t| {
                if t.kind() != kind || t.filename() != filename {
                    return false;
                }
                let port_matches = match kind {
                    TransferKind::Send => t.local_port() == port,
                    TransferKind::Receive => {
                        t.remote().is_some_and(|addr| addr.port() == port)
                    }
                };
                // A transfer that carries its own token only matches a
                // message carrying the same one
                port_matches
                    && match (token, t.token()) {
                        (Some(msg), Some(own)) => msg == own,
                        _ => true,
                    }
            })
            .cloned()
    }

    /// Derive a correlation token for `session` and assign it
    ///
    /// The candidate is the SHA-256 of the wire filename, as lowercase hex.
    /// On a collision with any registered token the input is re-salted by
    /// self-concatenation until the digest is unique.
    pub fn make_token(&self, session: &TransferSession) -> String {
        let transfers = self
            .transfers
            .lock()
            .expect("transfer registry lock poisoned");

        let mut input = session.filename().to_string();
        loop {
            let candidate = hex::encode(Sha256::digest(input.as_bytes()));
            let taken = transfers
                .values()
                .any(|t| t.token().as_deref() == Some(candidate.as_str()));
            if !taken {
                session.set_token(candidate.clone());
                return candidate;
            }
            let salt = input.clone();
            input.push_str(&salt);
        }
    }

    /// Snapshot of all live transfers
    ///
    /// Safe to call while transfers are streaming.
    pub fn snapshot(&self) -> Vec<Arc<TransferSession>> {
        self.transfers
            .lock()
            .expect("transfer registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Number of live transfers
    pub fn active_count(&self) -> usize {
        self.transfers
            .lock()
            .expect("transfer registry lock poisoned")
            .len()
    }
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters a transfer when its session task finishes
pub(crate) struct RegistryGuard {
    registry: Arc<TransferRegistry>,
    id: SessionId,
}

impl RegistryGuard {
    pub(crate) fn new(registry: Arc<TransferRegistry>, id: SessionId) -> Self {
        Self { registry, id }
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::DccTransfer;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::path::PathBuf;

    fn register(registry: &TransferRegistry, kind: TransferKind, filename: &str) -> DccTransfer {
        DccTransfer::register(
            registry,
            kind,
            filename.to_string(),
            PathBuf::from(format!("/tmp/{filename}")),
            Some(1000),
            1024,
            false,
            false,
        )
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = TransferRegistry::new();
        let transfer = register(&registry, TransferKind::Send, "a.bin");
        assert_eq!(registry.active_count(), 1);
        assert!(registry.get(transfer.id()).is_some());

        registry.unregister(transfer.id());
        assert_eq!(registry.active_count(), 0);
        assert!(registry.get(transfer.id()).is_none());
    }

    #[test]
    fn test_registry_guard_unregisters_on_drop() {
        let registry = Arc::new(TransferRegistry::new());
        let transfer = register(&registry, TransferKind::Send, "a.bin");
        {
            let _guard = RegistryGuard::new(Arc::clone(&registry), transfer.id());
            assert_eq!(registry.active_count(), 1);
        }
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_make_token_distinct_filenames() {
        let registry = TransferRegistry::new();
        let a = register(&registry, TransferKind::Send, "a.bin");
        let b = register(&registry, TransferKind::Send, "b.bin");
        let c = register(&registry, TransferKind::Send, "c.bin");

        let token_a = registry.make_token(a.session());
        let token_b = registry.make_token(b.session());
        let token_c = registry.make_token(c.session());

        assert_ne!(token_a, token_b);
        assert_ne!(token_b, token_c);
        assert_ne!(token_a, token_c);
        assert_eq!(a.session().token(), Some(token_a));
    }

    #[test]
    fn test_make_token_resalts_on_collision() {
        let registry = TransferRegistry::new();
        let first = register(&registry, TransferKind::Send, "same.bin");
        let second = register(&registry, TransferKind::Send, "same.bin");

        let token_first = registry.make_token(first.session());
        let token_second = registry.make_token(second.session());

        // Same filename would hash identically; the second derivation must
        // have re-salted its way past the collision
        assert_ne!(token_first, token_second);
    }

    #[test]
    fn test_find_by_token() {
        let registry = TransferRegistry::new();
        let transfer = register(&registry, TransferKind::Send, "a.bin");
        let token = registry.make_token(transfer.session());

        let found = registry.find_by_token(&token).unwrap();
        assert_eq!(found.id(), transfer.id());

        assert!(registry.find_by_token("missing").is_none());
        assert!(registry.find_by_token("").is_none());
    }

    #[test]
    fn test_find_resume_target_by_port_and_filename() {
        let registry = TransferRegistry::new();
        let send = register(&registry, TransferKind::Send, "a.bin");
        let receive = register(&registry, TransferKind::Receive, "a.bin");
        receive
            .session()
            .set_remote(SocketAddr::from((Ipv4Addr::LOCALHOST, 4000)));

        // No local port bound yet: the send is not matchable by port
        assert!(
            registry
                .find_resume_target(TransferKind::Send, 4000, "a.bin", None)
                .is_none()
        );

        let found = registry
            .find_resume_target(TransferKind::Receive, 4000, "a.bin", None)
            .unwrap();
        assert_eq!(found.id(), receive.id());

        // Filename mismatch never matches
        assert!(
            registry
                .find_resume_target(TransferKind::Receive, 4000, "b.bin", None)
                .is_none()
        );

        let _keep_alive = send;
    }

    #[test]
    fn test_find_resume_target_token_is_authoritative() {
        let registry = TransferRegistry::new();
        let transfer = register(&registry, TransferKind::Receive, "a.bin");
        transfer
            .session()
            .set_remote(SocketAddr::from((Ipv4Addr::LOCALHOST, 4000)));
        transfer.session().set_token("tok".to_string());

        // Matching token wins even with a useless port
        let found = registry
            .find_resume_target(TransferKind::Receive, 0, "a.bin", Some("tok"))
            .unwrap();
        assert_eq!(found.id(), transfer.id());

        // A message carrying a different token must not fall back onto a
        // tokened transfer that happens to match by port and filename
        assert!(
            registry
                .find_resume_target(TransferKind::Receive, 4000, "a.bin", Some("other"))
                .is_none()
        );
    }

    #[test]
    fn test_snapshot() {
        let registry = TransferRegistry::new();
        let _a = register(&registry, TransferKind::Send, "a.bin");
        let _b = register(&registry, TransferKind::Receive, "b.bin");
        assert_eq!(registry.snapshot().len(), 2);
    }
}
