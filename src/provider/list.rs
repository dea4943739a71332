//! A provider-side audience list and its local configuration.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::error::{AddressError, ConfigError, RemoteError, Result};
use crate::mapping::{ChangeSet, FieldMapping, FieldMappingEngine, GroupMapping, MergePayload, Record};
use crate::provider::client::{
    ListMetadata, ProviderClient, ProviderCredentials, SubscribeOptions, UnsubscribeOptions,
};
use crate::registry::AddressRegistry;

/// Binding of a local mailing list to a provider list.
#[derive(Debug, Clone)]
pub struct SourceListBinding {
    pub list_name: String,
    /// Default lists receive webhook-driven subscribes.
    pub default: bool,
}

impl SourceListBinding {
    pub fn new(list_name: impl Into<String>, default: bool) -> Self {
        Self {
            list_name: list_name.into(),
            default,
        }
    }
}

#[derive(Default)]
struct ProviderListState {
    connected: bool,
    last_sync: Option<DateTime<Utc>>,
    metadata: ListMetadata,
    /// Per-list exclusions: addresses the provider cleaned for this list.
    /// Independent of the global denylist.
    excludes: BTreeSet<String>,
}

/// One provider list: identity, credentials, source bindings and the
/// field-mapping configuration used when talking to it.
pub struct ProviderList {
    list_id: String,
    credentials: ProviderCredentials,
    /// When false, reconciliation plans diffs but never writes remotely.
    synchronize: bool,
    registry: AddressRegistry,
    bindings: Vec<SourceListBinding>,
    fields: Vec<FieldMapping>,
    groups: Vec<GroupMapping>,
    identity_tag: Option<String>,
    state: RwLock<ProviderListState>,
}

impl ProviderList {
    pub fn new(
        list_id: impl Into<String>,
        credentials: ProviderCredentials,
        registry: AddressRegistry,
    ) -> Self {
        Self {
            list_id: list_id.into(),
            credentials,
            synchronize: true,
            registry,
            bindings: Vec::new(),
            fields: Vec::new(),
            groups: Vec::new(),
            identity_tag: None,
            state: RwLock::new(ProviderListState::default()),
        }
    }

    pub fn with_synchronize(mut self, synchronize: bool) -> Self {
        self.synchronize = synchronize;
        self
    }

    pub fn with_binding(mut self, binding: SourceListBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn with_field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_group(mut self, group: GroupMapping) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_identity_tag(mut self, tag: impl Into<String>) -> Self {
        self.identity_tag = Some(tag.into());
        self
    }

    pub fn list_id(&self) -> &str {
        &self.list_id
    }

    pub fn credentials(&self) -> &ProviderCredentials {
        &self.credentials
    }

    pub fn synchronize(&self) -> bool {
        self.synchronize
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn bindings(&self) -> &[SourceListBinding] {
        &self.bindings
    }

    /// Names of bound lists flagged as default.
    pub fn default_lists(&self) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|b| b.default)
            .map(|b| b.list_name.clone())
            .collect()
    }

    pub fn connected(&self) -> bool {
        self.state.read().expect("provider list lock poisoned").connected
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("provider list lock poisoned").last_sync
    }

    pub(crate) fn mark_synced(&self, at: DateTime<Utc>) {
        self.state.write().expect("provider list lock poisoned").last_sync = Some(at);
    }

    /// Exclude an address from this list only. Used when the provider
    /// reports a hard bounce scoped to one audience.
    pub fn exclude(&self, email: &str) {
        self.state
            .write()
            .expect("provider list lock poisoned")
            .excludes
            .insert(email.to_string());
    }

    pub fn is_excluded(&self, email: &str) -> bool {
        self.state
            .read()
            .expect("provider list lock poisoned")
            .excludes
            .contains(email)
    }

    pub fn excludes(&self) -> BTreeSet<String> {
        self.state
            .read()
            .expect("provider list lock poisoned")
            .excludes
            .clone()
    }

    pub fn metadata(&self) -> ListMetadata {
        self.state
            .read()
            .expect("provider list lock poisoned")
            .metadata
            .clone()
    }

    /// Mapping engine configured with this list's fields and the group
    /// options last seen in the remote catalogue.
    pub fn mapping_engine(&self) -> FieldMappingEngine {
        let mut engine = FieldMappingEngine::new(self.fields.clone(), self.groups.clone());
        if let Some(tag) = &self.identity_tag {
            engine = engine.with_identity_tag(tag.clone());
        }
        let state = self.state.read().expect("provider list lock poisoned");
        for group in &state.metadata.groups {
            engine = engine.with_group_options(group.id.clone(), group.options.iter().cloned());
        }
        engine
    }

    /// The local reference set for reconciliation: the union of all bound
    /// lists' members, minus this list's exclusions.
    pub fn local_reference(&self) -> BTreeSet<String> {
        let excludes = self.excludes();
        let mut reference = BTreeSet::new();
        for binding in &self.bindings {
            reference.extend(self.registry.members_of(&binding.list_name));
        }
        reference.retain(|email| !excludes.contains(email));
        reference
    }

    /// Reject merge values whose tag is outside this list's configured
    /// mappings; the provider errors on unknown tags, this fails earlier
    /// and names the offender.
    pub fn validate_merge_tags(&self, merges: &MergePayload) -> Result<()> {
        let known = self.mapping_engine().known_tags();
        for tag in merges.keys() {
            if !known.contains(tag) {
                return Err(ConfigError::InvalidValue {
                    key: tag.clone(),
                    message: format!("unknown merge tag for list {}", self.list_id),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Single-record remote subscribe with full merge snapshot.
    pub async fn subscribe(
        &self,
        client: &dyn ProviderClient,
        email: &str,
        record: &Record,
    ) -> Result<()> {
        let merges = self.mapping_engine().build(record, None)?;
        self.subscribe_with_merges(client, email, merges).await
    }

    /// Single-record remote subscribe with caller-supplied merge values.
    pub async fn subscribe_with_merges(
        &self,
        client: &dyn ProviderClient,
        email: &str,
        merges: MergePayload,
    ) -> Result<()> {
        AddressRegistry::validate_email(email)?;
        if let Some(bad) = self.registry.bad_address(email) {
            return Err(AddressError::Rejected {
                email: email.to_string(),
                since: bad.registered_at,
            }
            .into());
        }
        if self.is_excluded(email) {
            warn!(list_id = %self.list_id, email, "refusing subscribe of excluded address");
            return Err(AddressError::Invalid(format!(
                "{email} is excluded from list {}",
                self.list_id
            ))
            .into());
        }
        self.validate_merge_tags(&merges)?;
        client
            .subscribe(&self.list_id, email, merges, SubscribeOptions::default())
            .await?;
        info!(list_id = %self.list_id, email, "remote subscribe");
        Ok(())
    }

    pub async fn unsubscribe(&self, client: &dyn ProviderClient, email: &str) -> Result<()> {
        client
            .unsubscribe(&self.list_id, email, UnsubscribeOptions::default())
            .await?;
        info!(list_id = %self.list_id, email, "remote unsubscribe");
        Ok(())
    }

    /// Partial remote update: only the merges touched by `changes` go on
    /// the wire, plus a complete address object if any part of it moved.
    pub async fn update_profile(
        &self,
        client: &dyn ProviderClient,
        email: &str,
        new_email: Option<&str>,
        record: &Record,
        changes: &ChangeSet,
    ) -> Result<()> {
        if changes.is_empty() && new_email.is_none() {
            return Ok(());
        }
        let merges = self.mapping_engine().build(record, Some(changes))?;
        if merges.is_empty() && new_email.is_none() {
            return Ok(());
        }
        client
            .update_profile(&self.list_id, email, new_email.unwrap_or(email), merges)
            .await?;
        info!(list_id = %self.list_id, email, "remote profile update");
        Ok(())
    }

    /// Refresh the cached remote catalogue (name, defaults, stats, merge
    /// fields and group options). A failed fetch marks the list as not
    /// connected but keeps the stale cache.
    pub async fn refresh_metadata(&self, client: &dyn ProviderClient) -> Result<(), RemoteError> {
        match client.fetch_list_metadata(&self.list_id).await {
            Ok(metadata) => {
                let mut state = self.state.write().expect("provider list lock poisoned");
                state.metadata = metadata;
                state.connected = true;
                Ok(())
            }
            Err(err) => {
                warn!(list_id = %self.list_id, error = %err, "metadata refresh failed");
                self.state
                    .write()
                    .expect("provider list lock poisoned")
                    .connected = false;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::client::GroupDef;
    use secrecy::SecretString;

    fn credentials() -> ProviderCredentials {
        ProviderCredentials {
            endpoint: "https://api.example.test/3.0".into(),
            api_key: SecretString::from("test-key"),
        }
    }

    fn provider_list(registry: AddressRegistry) -> ProviderList {
        ProviderList::new("abc123", credentials(), registry)
            .with_binding(SourceListBinding::new("announce", true))
            .with_binding(SourceListBinding::new("press", false))
    }

    #[test]
    fn local_reference_unions_bindings_and_drops_excludes() {
        let registry = AddressRegistry::new();
        registry.add_member("announce", "a@example.org");
        registry.add_member("press", "b@example.org");
        registry.add_member("press", "c@example.org");
        let list = provider_list(registry);
        list.exclude("c@example.org");

        let reference = list.local_reference();
        assert_eq!(
            reference.into_iter().collect::<Vec<_>>(),
            vec!["a@example.org".to_string(), "b@example.org".to_string()]
        );
    }

    #[test]
    fn default_lists_filters_bindings() {
        let list = provider_list(AddressRegistry::new());
        assert_eq!(list.default_lists(), vec!["announce".to_string()]);
    }

    #[test]
    fn unknown_merge_tag_is_rejected_before_the_wire() {
        let list = provider_list(AddressRegistry::new()).with_field(FieldMapping::Plain {
            tag: "FNAME".into(),
            attr: "first_name".into(),
        });

        let mut merges = MergePayload::new();
        merges.insert("FNAME".into(), serde_json::Value::String("Ada".into()));
        assert!(list.validate_merge_tags(&merges).is_ok());

        merges.insert("MYSTERY".into(), serde_json::Value::String("x".into()));
        let err = list.validate_merge_tags(&merges).unwrap_err();
        match err {
            crate::error::Error::Config(ConfigError::InvalidValue { key, .. }) => {
                assert_eq!(key, "MYSTERY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mapping_engine_picks_up_catalogue_group_options() {
        let registry = AddressRegistry::new();
        let list = provider_list(registry).with_group(GroupMapping {
            group_id: "g1".into(),
            attr: "region".into(),
        });
        {
            let mut state = list.state.write().unwrap();
            state.metadata.groups = vec![GroupDef {
                id: "g1".into(),
                name: "Region".into(),
                options: vec!["Europe".into(), "Asia".into()],
            }];
        }

        let mut record = Record::new("contacts.contact:1");
        record.set("region", crate::mapping::AttrValue::text("Europe"));
        let merges = list.mapping_engine().build(&record, None).unwrap();
        assert!(merges.contains_key(crate::mapping::GROUPINGS_TAG));
    }
}
