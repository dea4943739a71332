//! Local mailing lists and the list-server boundary.
//!
//! A [`List`] is the locally owned membership set for one mailing list; the
//! remote server behind [`MailingListServer`] holds its own copy, and the
//! reconciliation engine keeps the two converged. The local set is
//! authoritative for pushes; the server is authoritative for pulls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{AddressError, RemoteError, Result, StoreError};
use crate::registry::AddressRegistry;

/// The mailing-list server API used by this core.
///
/// Implementations must treat "already a member" on subscribe and "not
/// subscribed" on unsubscribe as success; the sync loop re-applies state
/// freely and expects convergence, not errors.
#[async_trait]
pub trait MailingListServer: Send + Sync {
    /// Current roster as `(email, name)` pairs.
    async fn members(&self, list: &str) -> Result<Vec<(String, String)>, RemoteError>;

    async fn subscribe(&self, list: &str, email: &str) -> Result<(), RemoteError>;

    async fn unsubscribe(&self, list: &str, email: &str) -> Result<(), RemoteError>;
}

/// A locally owned mailing list.
#[derive(Clone)]
pub struct List {
    name: String,
    registry: AddressRegistry,
    last_sync: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl List {
    pub fn new(name: impl Into<String>, registry: AddressRegistry) -> Self {
        Self {
            name: name.into(),
            registry,
            last_sync: Arc::new(RwLock::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().expect("list lock poisoned")
    }

    pub(crate) fn mark_synced(&self, at: DateTime<Utc>) {
        *self.last_sync.write().expect("list lock poisoned") = Some(at);
    }

    /// Current local membership.
    pub fn members(&self) -> BTreeSet<String> {
        self.registry.members_of(&self.name)
    }

    pub fn is_member(&self, email: &str) -> bool {
        self.registry.is_member(&self.name, email)
    }

    /// Subscribe an address to this list.
    ///
    /// Explicit subscribes of denylisted addresses fail loudly; only the
    /// reconciliation engine may silently skip them during bulk sync.
    pub fn subscribe(&self, email: &str) -> Result<()> {
        AddressRegistry::validate_email(email)?;
        if let Some(bad) = self.registry.bad_address(email) {
            return Err(AddressError::Rejected {
                email: email.to_string(),
                since: bad.registered_at,
            }
            .into());
        }
        self.registry.add_member(&self.name, email);
        info!(list = %self.name, email, "subscribed");
        Ok(())
    }

    /// Unsubscribe an address from this list.
    pub fn unsubscribe(&self, email: &str) -> Result<()> {
        if !self.registry.remove_member(&self.name, email) {
            return Err(StoreError::NotFound {
                entity: "membership".to_string(),
                id: format!("{}:{email}", self.name),
            }
            .into());
        }
        info!(list = %self.name, email, "unsubscribed");
        Ok(())
    }

    /// Pull the server roster into the local set: the server wins, except
    /// that denylisted addresses are never imported.
    pub async fn pull(&self, server: &dyn MailingListServer) -> Result<()> {
        let remote: BTreeSet<String> = server
            .members(&self.name)
            .await?
            .into_iter()
            .map(|(email, _)| email)
            .collect();
        let local = self.members();
        let bad = self.registry.bad_addresses();

        for email in remote.difference(&local) {
            if bad.contains(email) {
                warn!(list = %self.name, email, "skipping denylisted address on pull");
                continue;
            }
            self.registry.add_member(&self.name, email);
        }
        for email in local.difference(&remote) {
            self.registry.remove_member(&self.name, email);
        }
        self.mark_synced(Utc::now());
        Ok(())
    }

    /// Push the local set to the server. With `remove_existing`, server
    /// members absent locally are unsubscribed remotely.
    pub async fn push(&self, server: &dyn MailingListServer, remove_existing: bool) -> Result<()> {
        let remote: BTreeSet<String> = server
            .members(&self.name)
            .await?
            .into_iter()
            .map(|(email, _)| email)
            .collect();
        let local = self.members();
        let bad = self.registry.bad_addresses();

        for email in local.difference(&remote) {
            if bad.contains(email) {
                continue;
            }
            server.subscribe(&self.name, email).await?;
        }
        if remove_existing {
            let stale: BTreeSet<_> = remote
                .difference(&local)
                .chain(remote.intersection(&bad))
                .collect();
            for email in stale {
                server.unsubscribe(&self.name, email).await?;
            }
        }
        self.mark_synced(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeServer {
        roster: Mutex<BTreeSet<String>>,
    }

    impl FakeServer {
        fn with(members: &[&str]) -> Self {
            Self {
                roster: Mutex::new(members.iter().map(|m| m.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl MailingListServer for FakeServer {
        async fn members(&self, _list: &str) -> Result<Vec<(String, String)>, RemoteError> {
            Ok(self
                .roster
                .lock()
                .unwrap()
                .iter()
                .map(|m| (m.clone(), String::new()))
                .collect())
        }

        async fn subscribe(&self, _list: &str, email: &str) -> Result<(), RemoteError> {
            self.roster.lock().unwrap().insert(email.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, _list: &str, email: &str) -> Result<(), RemoteError> {
            self.roster.lock().unwrap().remove(email);
            Ok(())
        }
    }

    fn list() -> List {
        List::new("announce", AddressRegistry::new())
    }

    #[test]
    fn subscribe_rejects_denylisted_address() {
        let list = list();
        list.registry().register_bad("bad@example.org");
        let err = list.subscribe("bad@example.org").unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Address(AddressError::Rejected { .. })
        ));
        assert!(!list.is_member("bad@example.org"));
    }

    #[test]
    fn unsubscribe_unknown_member_is_not_found() {
        let err = list().unsubscribe("ghost@example.org").unwrap_err();
        assert!(matches!(err, crate::error::Error::Store(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn pull_imports_server_roster_but_never_denylisted() {
        let list = list();
        list.subscribe("stale@example.org").unwrap();
        list.registry().register_bad("bad@example.org");
        let server = FakeServer::with(&["new@example.org", "bad@example.org"]);

        list.pull(&server).await.unwrap();

        assert!(list.is_member("new@example.org"));
        assert!(!list.is_member("bad@example.org"));
        assert!(!list.is_member("stale@example.org"));
        assert!(list.last_sync().is_some());
    }

    #[tokio::test]
    async fn push_converges_server_to_local_set() {
        let list = list();
        list.subscribe("keep@example.org").unwrap();
        list.subscribe("add@example.org").unwrap();
        let server = FakeServer::with(&["keep@example.org", "drop@example.org"]);

        list.push(&server, true).await.unwrap();

        let roster = server.roster.lock().unwrap().clone();
        assert!(roster.contains("keep@example.org"));
        assert!(roster.contains("add@example.org"));
        assert!(!roster.contains("drop@example.org"));
    }

    #[tokio::test]
    async fn push_removes_denylisted_even_when_present_on_both_sides() {
        let list = list();
        list.registry().add_member("announce", "bad@example.org");
        list.registry().register_bad("bad@example.org");
        let server = FakeServer::with(&["bad@example.org"]);

        list.push(&server, true).await.unwrap();

        assert!(!server.roster.lock().unwrap().contains("bad@example.org"));
    }
}
