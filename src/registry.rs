//! Address registry — subscribers, the permanent bad-address denylist,
//! and list memberships.
//!
//! All inserts are idempotent: re-registering a bad address or re-adding an
//! existing membership is a no-op, never an error. Email identity is a
//! case-sensitive exact match throughout.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::error::{AddressError, Error, Result};

static EMAIL_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    // Deliberately loose; the provider performs its own validation.
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex")
});

/// A subscriber — a unique email identity shared across all lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
}

/// A denylist entry for an address that bounced or was cleaned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadAddress {
    pub email: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    subscribers: HashMap<String, Subscriber>,
    bad_addresses: BTreeMap<String, BadAddress>,
    /// list name -> member emails.
    memberships: HashMap<String, BTreeSet<String>>,
}

/// Shared registry handle. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate an email address syntactically.
    pub fn validate_email(email: &str) -> Result<()> {
        if EMAIL_RE.is_match(email) {
            Ok(())
        } else {
            Err(Error::Address(AddressError::Invalid(email.to_string())))
        }
    }

    // ── Denylist ────────────────────────────────────────────────────

    /// Check whether an address is on the denylist.
    pub fn is_bad(&self, email: &str) -> bool {
        self.state
            .read()
            .expect("registry lock poisoned")
            .bad_addresses
            .contains_key(email)
    }

    /// Register a bad address. Idempotent; the original timestamp is kept.
    pub fn register_bad(&self, email: &str) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state
            .bad_addresses
            .entry(email.to_string())
            .or_insert_with(|| BadAddress {
                email: email.to_string(),
                registered_at: Utc::now(),
            });
    }

    /// Remove an address from the denylist, returning whether it was present.
    ///
    /// Only an explicit re-subscribe clears a bad address; reconciliation
    /// never does.
    pub fn unregister_bad(&self, email: &str) -> bool {
        self.state
            .write()
            .expect("registry lock poisoned")
            .bad_addresses
            .remove(email)
            .is_some()
    }

    /// Snapshot of all denylisted addresses.
    pub fn bad_addresses(&self) -> BTreeSet<String> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .bad_addresses
            .keys()
            .cloned()
            .collect()
    }

    /// The denylist entry for an address, if any.
    pub fn bad_address(&self, email: &str) -> Option<BadAddress> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .bad_addresses
            .get(email)
            .cloned()
    }

    // ── Subscribers ─────────────────────────────────────────────────

    /// Look up a subscriber, creating it if absent.
    pub fn get_or_create_subscriber(&self, email: &str) -> Subscriber {
        let mut state = self.state.write().expect("registry lock poisoned");
        state
            .subscribers
            .entry(email.to_string())
            .or_insert_with(|| Subscriber {
                id: Uuid::new_v4(),
                email: email.to_string(),
            })
            .clone()
    }

    pub fn subscriber(&self, email: &str) -> Option<Subscriber> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .subscribers
            .get(email)
            .cloned()
    }

    // ── Memberships ─────────────────────────────────────────────────

    /// Current member emails of a list.
    pub fn members_of(&self, list: &str) -> BTreeSet<String> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .memberships
            .get(list)
            .cloned()
            .unwrap_or_default()
    }

    /// Add a membership, creating the subscriber row as needed. Set
    /// semantics: adding an existing membership is a no-op.
    ///
    /// Does NOT consult the denylist — callers that honor the exclusion
    /// policy go through [`crate::lists::List::subscribe`] or the
    /// reconciliation engine.
    pub fn add_member(&self, list: &str, email: &str) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state
            .subscribers
            .entry(email.to_string())
            .or_insert_with(|| Subscriber {
                id: Uuid::new_v4(),
                email: email.to_string(),
            });
        state
            .memberships
            .entry(list.to_string())
            .or_default()
            .insert(email.to_string());
    }

    /// Remove a membership. Set semantics: removing an absent membership is
    /// a no-op. Returns whether the membership existed.
    pub fn remove_member(&self, list: &str, email: &str) -> bool {
        let mut state = self.state.write().expect("registry lock poisoned");
        state
            .memberships
            .get_mut(list)
            .map(|members| members.remove(email))
            .unwrap_or(false)
    }

    /// Whether an email is a member of a list.
    pub fn is_member(&self, list: &str, email: &str) -> bool {
        self.state
            .read()
            .expect("registry lock poisoned")
            .memberships
            .get(list)
            .is_some_and(|members| members.contains(email))
    }
}
