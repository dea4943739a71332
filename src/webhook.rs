//! Provider webhook intake: token validation and event routing.
//!
//! The provider calls back with list events; each hook URL carries a
//! per-list token. Validation failures and handler errors are logged and
//! answered with the same opaque acknowledgement as success, so the
//! endpoint leaks nothing about which tokens or lists exist.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha224};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::commands::SyncCommand;
use crate::config::SyncConfig;
use crate::error::{Result, WebhookError};
use crate::mapping::MergePayload;
use crate::provider::list::ProviderList;
use crate::registry::AddressRegistry;
use tokio::sync::mpsc;

/// A per-list webhook token.
///
/// Expiry is soft: rotation first expires the old token, and the provider
/// may still deliver queued events against it for a short while, so an
/// expired token stays acceptable for a grace period.
#[derive(Debug, Clone)]
pub struct WebhookToken {
    pub list_id: String,
    pub uuid: Uuid,
    pub token: String,
    pub expired_at: Option<DateTime<Utc>>,
}

impl WebhookToken {
    /// Derive a fresh token for `list_id` from the shared secret.
    pub fn issue(secret: &str, list_id: impl Into<String>) -> Self {
        let list_id = list_id.into();
        let uuid = Uuid::new_v4();
        let mut hasher = Sha224::new();
        hasher.update(secret.as_bytes());
        hasher.update(list_id.as_bytes());
        hasher.update(uuid.as_bytes());
        let token = hex_digest(hasher);
        Self {
            list_id,
            uuid,
            token,
            expired_at: None,
        }
    }

    pub fn expire(&mut self, at: DateTime<Utc>) {
        self.expired_at = Some(at);
    }

    pub fn is_valid(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        match self.expired_at {
            None => true,
            Some(expired_at) => now <= expired_at + grace,
        }
    }
}

fn hex_digest(hasher: Sha224) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Event kinds the provider posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Subscribe,
    Unsubscribe,
    Cleaned,
    Upemail,
    Profile,
    Campaign,
}

/// Event body fields; which are present depends on the event type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub list_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub merges: MergePayload,
    #[serde(default)]
    pub old_email: Option<String>,
    #[serde(default)]
    pub new_email: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One posted webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub fired_at: Option<String>,
    pub data: EventData,
}

/// Routes validated provider events into registry updates and outbound
/// sync commands.
pub struct WebhookEventRouter {
    registry: AddressRegistry,
    config: SyncConfig,
    lists: HashMap<String, Arc<ProviderList>>,
    tokens: RwLock<HashMap<String, WebhookToken>>,
    commands: mpsc::UnboundedSender<SyncCommand>,
}

impl WebhookEventRouter {
    pub fn new(
        registry: AddressRegistry,
        config: SyncConfig,
        lists: HashMap<String, Arc<ProviderList>>,
        commands: mpsc::UnboundedSender<SyncCommand>,
    ) -> Self {
        Self {
            registry,
            config,
            lists,
            tokens: RwLock::new(HashMap::new()),
            commands,
        }
    }

    /// Issue a token for a list and remember it for validation.
    pub fn issue_token(&self, secret: &str, list_id: &str) -> WebhookToken {
        let token = WebhookToken::issue(secret, list_id);
        self.tokens
            .write()
            .expect("token store poisoned")
            .insert(token.token.clone(), token.clone());
        token
    }

    /// Expire a token, leaving it in the store for the grace window.
    pub fn expire_token(&self, token: &str) -> bool {
        match self
            .tokens
            .write()
            .expect("token store poisoned")
            .get_mut(token)
        {
            Some(entry) => {
                entry.expire(Utc::now());
                true
            }
            None => false,
        }
    }

    fn validate(&self, token: &str, list_id: &str) -> Result<(), WebhookError> {
        let tokens = self.tokens.read().expect("token store poisoned");
        let entry = tokens.get(token).ok_or(WebhookError::BadToken)?;
        if !entry.is_valid(Utc::now(), self.config.token_grace) {
            return Err(WebhookError::BadToken);
        }
        if entry.list_id != list_id {
            return Err(WebhookError::ListMismatch {
                list_id: list_id.to_string(),
            });
        }
        Ok(())
    }

    /// Single entry point. Always acknowledges; problems are logged.
    pub fn handle(&self, token: &str, payload: EventPayload) {
        if let Err(err) = self.process(token, payload) {
            warn!(error = %err, "webhook event dropped");
        }
    }

    fn process(&self, token: &str, payload: EventPayload) -> Result<()> {
        let list_id = payload.data.list_id.clone();
        self.validate(token, &list_id)?;
        let provider_list = self
            .lists
            .get(&list_id)
            .ok_or(WebhookError::UnknownList(list_id.clone()))?
            .clone();

        info!(
            list_id = %list_id,
            event = ?payload.event_type,
            email = %payload.data.email,
            "webhook event"
        );
        match payload.event_type {
            EventType::Subscribe => self.on_subscribe(&provider_list, &payload.data),
            EventType::Unsubscribe => self.on_unsubscribe(&provider_list, &payload.data),
            EventType::Cleaned => self.on_cleaned(&provider_list, &payload.data),
            EventType::Upemail => self.on_upemail(&provider_list, &payload.data),
            EventType::Profile => self.on_profile(&provider_list, &payload.data),
            EventType::Campaign => self.on_campaign(&list_id, &payload.data),
        }
    }

    fn send(&self, command: SyncCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| WebhookError::BadPayload("command queue closed".into()).into())
    }

    fn apply_merges(&self, provider_list: &ProviderList, data: &EventData) -> Result<()> {
        if data.merges.is_empty() {
            return Ok(());
        }
        let attrs = provider_list.mapping_engine().parse(&data.merges)?;
        if attrs.is_empty() {
            return Ok(());
        }
        self.send(SyncCommand::ApplyAttributes {
            email: data.email.clone(),
            attrs,
        })
    }

    /// An explicit opt-in at the provider clears any denylist entry: the
    /// owner of the address has asked back in.
    fn on_subscribe(&self, provider_list: &ProviderList, data: &EventData) -> Result<()> {
        AddressRegistry::validate_email(&data.email)?;
        if self.registry.unregister_bad(&data.email) {
            info!(email = %data.email, "denylist entry cleared by re-subscribe");
        }
        for list in provider_list.default_lists() {
            self.registry.add_member(&list, &data.email);
        }
        self.apply_merges(provider_list, data)
    }

    fn on_unsubscribe(&self, provider_list: &ProviderList, data: &EventData) -> Result<()> {
        for list in provider_list.default_lists() {
            self.registry.remove_member(&list, &data.email);
        }
        self.apply_merges(provider_list, data)
    }

    /// A hard bounce. The address goes on the global denylist and is
    /// additionally excluded from this provider list; existing local
    /// memberships are left for the next reconciliation pass to purge.
    fn on_cleaned(&self, provider_list: &ProviderList, data: &EventData) -> Result<()> {
        self.registry.register_bad(&data.email);
        provider_list.exclude(&data.email);
        info!(email = %data.email, reason = ?data.reason, "address denylisted");
        Ok(())
    }

    fn on_upemail(&self, provider_list: &ProviderList, data: &EventData) -> Result<()> {
        let old = data
            .old_email
            .as_deref()
            .ok_or_else(|| WebhookError::BadPayload("upemail without old_email".into()))?;
        let new = data
            .new_email
            .as_deref()
            .ok_or_else(|| WebhookError::BadPayload("upemail without new_email".into()))?;
        AddressRegistry::validate_email(new)?;

        for binding in provider_list.bindings() {
            if self.registry.remove_member(&binding.list_name, old)
                && !self.registry.is_bad(new)
            {
                self.registry.add_member(&binding.list_name, new);
            }
        }
        // Propagate the change to the other synchronized audiences.
        for (other_id, other) in &self.lists {
            if other_id != provider_list.list_id() && other.synchronize() {
                self.send(SyncCommand::UpdateRemoteProfile {
                    list_id: other_id.clone(),
                    email: old.to_string(),
                    new_email: Some(new.to_string()),
                })?;
            }
        }
        Ok(())
    }

    fn on_profile(&self, provider_list: &ProviderList, data: &EventData) -> Result<()> {
        AddressRegistry::validate_email(&data.email)?;
        self.apply_merges(provider_list, data)
    }

    fn on_campaign(&self, list_id: &str, data: &EventData) -> Result<()> {
        self.send(SyncCommand::CampaignEvent {
            list_id: list_id.to_string(),
            data: serde_json::Value::Object(data.extra.clone()),
        })
    }
}
