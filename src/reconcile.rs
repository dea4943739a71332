//! Set-difference reconciliation between the local registry, the
//! mailing-list server and the provider.
//!
//! The algebra, with `A` the desired set, `B` the current remote set and
//! `D` the denylist:
//!
//! ```text
//! to_add    = (A − B) − D
//! to_remove = (B − A) ∪ (B ∩ D)
//! ```
//!
//! Denylisted addresses are never added anywhere, and are actively removed
//! from any set they already appear in. Applying a plan twice is a no-op.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::commands::SyncCommand;
use crate::config::SyncConfig;
use crate::error::{RemoteError, Result};
use crate::lists::{List, MailingListServer};
use crate::mapping::Record;
use crate::provider::client::{
    MemberRecord, MemberStatus, ProviderClient, SubscribeOptions, UnsubscribeOptions,
};
use crate::provider::list::ProviderList;
use crate::registry::AddressRegistry;

/// The computed difference between a desired and a current set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
    /// The current set as observed when the plan was computed, kept so
    /// callers can audit the decision without re-querying.
    pub snapshot: BTreeSet<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Aggregated result of one outbound bulk sync.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub added: u64,
    pub updated: u64,
    pub errors: u64,
    pub batches: usize,
    pub failed_batches: usize,
    pub error_messages: Vec<String>,
}

/// Plans and applies set differences across the three systems.
#[derive(Clone)]
pub struct ReconciliationEngine {
    registry: AddressRegistry,
    config: SyncConfig,
}

impl ReconciliationEngine {
    pub fn new(registry: AddressRegistry, config: SyncConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    /// Compute the plan turning `current` into `desired`, with the global
    /// denylist excluded from adds and purged from the current set.
    pub fn plan(&self, desired: &BTreeSet<String>, current: &BTreeSet<String>) -> ReconcilePlan {
        let deny = self.registry.bad_addresses();

        let to_add: BTreeSet<String> = desired
            .difference(current)
            .filter(|email| !deny.contains(*email))
            .cloned()
            .collect();
        let to_remove: BTreeSet<String> = current
            .difference(desired)
            .chain(current.intersection(&deny))
            .cloned()
            .collect();
        ReconcilePlan {
            to_add,
            to_remove,
            snapshot: current.clone(),
        }
    }

    /// Reconcile one local list against its mailing-list server: the
    /// server roster is the desired set. Every applied change is echoed as
    /// commands toward the synchronized downstream provider lists.
    pub async fn reconcile_list(
        &self,
        list: &List,
        server: &dyn MailingListServer,
        downstream: &[Arc<ProviderList>],
    ) -> Result<(ReconcilePlan, Vec<SyncCommand>)> {
        let remote: BTreeSet<String> = server
            .members(list.name())
            .await?
            .into_iter()
            .map(|(email, _)| email)
            .collect();
        let local = list.members();
        let plan = self.plan(&remote, &local);

        let mut commands = Vec::new();
        for email in &plan.to_add {
            self.registry.add_member(list.name(), email);
            for provider in downstream {
                if provider.synchronize() && !provider.is_excluded(email) {
                    commands.push(SyncCommand::SubscribeRemote {
                        list_id: provider.list_id().to_string(),
                        email: email.clone(),
                    });
                }
            }
        }
        for email in &plan.to_remove {
            self.registry.remove_member(list.name(), email);
            for provider in downstream {
                if provider.synchronize() {
                    commands.push(SyncCommand::UnsubscribeRemote {
                        list_id: provider.list_id().to_string(),
                        email: email.clone(),
                    });
                }
            }
        }

        info!(
            list = %list.name(),
            added = plan.to_add.len(),
            removed = plan.to_remove.len(),
            "list reconciled"
        );
        list.mark_synced(chrono::Utc::now());
        Ok((plan, commands))
    }

    /// Plan the outbound changes for one provider list: local reference
    /// set versus the provider's subscribed members.
    pub async fn outgoing_changes(
        &self,
        provider_list: &ProviderList,
        client: &dyn ProviderClient,
    ) -> Result<ReconcilePlan> {
        let remote: BTreeSet<String> = client
            .fetch_members(provider_list.list_id(), MemberStatus::Subscribed)
            .await?
            .into_iter()
            .map(|member| member.email)
            .collect();
        let local = provider_list.local_reference();
        Ok(self.plan(&local, &remote))
    }

    /// Apply a plan to the provider in batches of at most the configured
    /// size. A failed batch is counted and logged; the sync carries on and
    /// only fails outright when every batch failed.
    pub async fn push_outgoing(
        &self,
        provider_list: &ProviderList,
        client: &dyn ProviderClient,
        plan: &ReconcilePlan,
        records: &HashMap<String, Record>,
    ) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        let batch_size = self.config.effective_batch_size();
        let engine = provider_list.mapping_engine();

        let adds: Vec<MemberRecord> = plan
            .to_add
            .iter()
            .map(|email| {
                let merges = match records.get(email) {
                    Some(record) => engine.build(record, None)?,
                    None => Default::default(),
                };
                Ok(MemberRecord {
                    email: email.clone(),
                    merges,
                })
            })
            .collect::<Result<_>>()?;
        let removes: Vec<String> = plan.to_remove.iter().cloned().collect();

        for chunk in adds.chunks(batch_size) {
            summary.batches += 1;
            match client
                .batch_subscribe(provider_list.list_id(), chunk, SubscribeOptions::default())
                .await
            {
                Ok(result) => {
                    summary.added += result.added;
                    summary.updated += result.updated;
                    summary.errors += result.errors;
                    summary.error_messages.extend(result.error_messages);
                }
                Err(err) => {
                    warn!(list_id = %provider_list.list_id(), error = %err, "subscribe batch failed");
                    summary.failed_batches += 1;
                    summary.error_messages.push(err.to_string());
                }
            }
        }
        for chunk in removes.chunks(batch_size) {
            summary.batches += 1;
            match client
                .batch_unsubscribe(provider_list.list_id(), chunk, UnsubscribeOptions::default())
                .await
            {
                Ok(result) => {
                    summary.updated += result.updated;
                    summary.errors += result.errors;
                    summary.error_messages.extend(result.error_messages);
                }
                Err(err) => {
                    warn!(list_id = %provider_list.list_id(), error = %err, "unsubscribe batch failed");
                    summary.failed_batches += 1;
                    summary.error_messages.push(err.to_string());
                }
            }
        }

        if summary.batches > 0 && summary.failed_batches == summary.batches {
            return Err(RemoteError::AllBatchesFailed {
                batches: summary.batches,
                first_error: summary
                    .error_messages
                    .first()
                    .cloned()
                    .unwrap_or_default(),
            }
            .into());
        }
        Ok(summary)
    }

    /// Full outbound sync for one provider list, honoring its
    /// `synchronize` flag.
    pub async fn synchronize(
        &self,
        provider_list: &ProviderList,
        client: &dyn ProviderClient,
        records: &HashMap<String, Record>,
    ) -> Result<SyncSummary> {
        if !provider_list.synchronize() {
            info!(list_id = %provider_list.list_id(), "synchronization disabled, planning only");
            return Ok(SyncSummary::default());
        }
        let plan = self.outgoing_changes(provider_list, client).await?;
        if plan.is_empty() {
            provider_list.mark_synced(chrono::Utc::now());
            return Ok(SyncSummary::default());
        }
        let summary = self.push_outgoing(provider_list, client, &plan, records).await?;
        provider_list.mark_synced(chrono::Utc::now());
        info!(
            list_id = %provider_list.list_id(),
            added = summary.added,
            updated = summary.updated,
            errors = summary.errors,
            failed_batches = summary.failed_batches,
            "outbound sync complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::provider::client::{
        BatchResult, CampaignContent, ListMetadata, ProviderCredentials,
    };
    use crate::provider::list::SourceListBinding;
    use secrecy::SecretString;
    use std::sync::Mutex;

    fn set(emails: &[&str]) -> BTreeSet<String> {
        emails.iter().map(|e| e.to_string()).collect()
    }

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(AddressRegistry::new(), SyncConfig::default())
    }

    #[test]
    fn plan_matches_worked_example() {
        // local {a, b}, denylist {b}, server {a, c}: c joins, b goes.
        let engine = engine();
        engine.registry().register_bad("b@x.com");
        let desired = set(&["a@x.com", "c@x.com"]);
        let current = set(&["a@x.com", "b@x.com"]);

        let plan = engine.plan(&desired, &current);
        assert_eq!(plan.to_add, set(&["c@x.com"]));
        assert_eq!(plan.to_remove, set(&["b@x.com"]));
    }

    #[test]
    fn denylisted_address_never_added_even_when_desired() {
        let engine = engine();
        engine.registry().register_bad("bad@x.com");
        let plan = engine.plan(&set(&["bad@x.com", "ok@x.com"]), &BTreeSet::new());
        assert_eq!(plan.to_add, set(&["ok@x.com"]));
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn plan_is_idempotent_once_applied() {
        let engine = engine();
        engine.registry().register_bad("b@x.com");
        let desired = set(&["a@x.com", "c@x.com"]);
        let mut current = set(&["a@x.com", "b@x.com"]);

        let plan = engine.plan(&desired, &current);
        for email in &plan.to_add {
            current.insert(email.clone());
        }
        for email in &plan.to_remove {
            current.remove(email);
        }
        assert!(engine.plan(&desired, &current).is_empty());
    }

    #[test]
    fn converged_sets_produce_empty_plan() {
        let engine = engine();
        let both = set(&["a@x.com", "b@x.com"]);
        assert!(engine.plan(&both, &both).is_empty());
    }

    struct FlakyClient {
        /// One entry per expected batch call; true means fail.
        failures: Mutex<Vec<bool>>,
    }

    impl FlakyClient {
        fn new(failures: &[bool]) -> Self {
            Self {
                failures: Mutex::new(failures.to_vec()),
            }
        }

        fn next_outcome(&self) -> bool {
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() { false } else { failures.remove(0) }
        }

        fn batch(&self, size: u64) -> Result<BatchResult, RemoteError> {
            if self.next_outcome() {
                Err(RemoteError::Api {
                    operation: "batch".into(),
                    message: "boom".into(),
                })
            } else {
                Ok(BatchResult {
                    added: size,
                    ..Default::default()
                })
            }
        }
    }

    #[async_trait::async_trait]
    impl ProviderClient for FlakyClient {
        async fn subscribe(
            &self,
            _: &str,
            _: &str,
            _: crate::mapping::MergePayload,
            _: SubscribeOptions,
        ) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn unsubscribe(
            &self,
            _: &str,
            _: &str,
            _: UnsubscribeOptions,
        ) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn update_profile(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: crate::mapping::MergePayload,
        ) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn batch_subscribe(
            &self,
            _: &str,
            members: &[MemberRecord],
            _: SubscribeOptions,
        ) -> Result<BatchResult, RemoteError> {
            self.batch(members.len() as u64)
        }

        async fn batch_unsubscribe(
            &self,
            _: &str,
            emails: &[String],
            _: UnsubscribeOptions,
        ) -> Result<BatchResult, RemoteError> {
            self.batch(emails.len() as u64)
        }

        async fn fetch_members(
            &self,
            _: &str,
            _: MemberStatus,
        ) -> Result<Vec<MemberRecord>, RemoteError> {
            Ok(Vec::new())
        }

        async fn fetch_list_metadata(&self, _: &str) -> Result<ListMetadata, RemoteError> {
            Ok(ListMetadata::default())
        }

        async fn upload_campaign(
            &self,
            _: &str,
            _: &CampaignContent,
            _: Option<&str>,
        ) -> Result<String, RemoteError> {
            Ok("c1".into())
        }

        async fn send_campaign(&self, _: &str) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn send_campaign_test(&self, _: &str, _: &[String]) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn provider_list(registry: AddressRegistry) -> ProviderList {
        ProviderList::new(
            "abc123",
            ProviderCredentials {
                endpoint: "https://api.example.test/3.0".into(),
                api_key: SecretString::from("test-key"),
            },
            registry,
        )
        .with_binding(SourceListBinding::new("announce", true))
    }

    fn small_batch_engine(registry: AddressRegistry) -> ReconciliationEngine {
        let config = SyncConfig {
            batch_size: 2,
            ..SyncConfig::default()
        };
        ReconciliationEngine::new(registry, config)
    }

    #[tokio::test]
    async fn push_aggregates_counters_across_batches() {
        let registry = AddressRegistry::new();
        let engine = small_batch_engine(registry.clone());
        let list = provider_list(registry);

        let plan = ReconcilePlan {
            to_add: set(&["a@x.com", "b@x.com", "c@x.com"]),
            to_remove: set(&["d@x.com"]),
            snapshot: set(&["a@x.com", "b@x.com", "c@x.com"]),
        };
        let client = FlakyClient::new(&[false, false, false]);

        let summary = engine
            .push_outgoing(&list, &client, &plan, &HashMap::new())
            .await
            .unwrap();
        // Adds split 2+1, removes in one batch.
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.added, 3);
        assert_eq!(summary.failed_batches, 0);
    }

    #[tokio::test]
    async fn one_failed_batch_does_not_abort_the_sync() {
        let registry = AddressRegistry::new();
        let engine = small_batch_engine(registry.clone());
        let list = provider_list(registry);

        let plan = ReconcilePlan {
            to_add: set(&["a@x.com", "b@x.com", "c@x.com"]),
            to_remove: BTreeSet::new(),
            snapshot: set(&["a@x.com", "b@x.com", "c@x.com"]),
        };
        let client = FlakyClient::new(&[true, false]);

        let summary = engine
            .push_outgoing(&list, &client, &plan, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.error_messages.len(), 1);
    }

    #[tokio::test]
    async fn all_batches_failing_is_an_error() {
        let registry = AddressRegistry::new();
        let engine = small_batch_engine(registry.clone());
        let list = provider_list(registry);

        let plan = ReconcilePlan {
            to_add: set(&["a@x.com", "b@x.com", "c@x.com"]),
            to_remove: BTreeSet::new(),
            snapshot: set(&["a@x.com", "b@x.com", "c@x.com"]),
        };
        let client = FlakyClient::new(&[true, true]);

        let err = engine
            .push_outgoing(&list, &client, &plan, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Remote(RemoteError::AllBatchesFailed { batches: 2, .. })
        ));
    }
}
