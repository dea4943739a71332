//! Follow-up commands emitted by the engines.
//!
//! Membership changes used to ripple through implicit side effects; here
//! every operation returns (or enqueues) the explicit commands it wants
//! executed, so ordering and error handling stay visible to the caller.
//! Commands are applied by a worker draining a queue — webhook handling
//! itself never performs remote calls.

use std::collections::HashMap;

use serde_json::Value;

/// One outbound correction or local follow-up.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncCommand {
    /// Subscribe an email on a provider list.
    SubscribeRemote { list_id: String, email: String },
    /// Unsubscribe an email from a provider list.
    UnsubscribeRemote { list_id: String, email: String },
    /// Update the remote profile of a member, optionally moving it to a
    /// new email address.
    UpdateRemoteProfile {
        list_id: String,
        email: String,
        new_email: Option<String>,
    },
    /// Apply parsed attribute values to the linked local record.
    ApplyAttributes {
        email: String,
        attrs: HashMap<String, String>,
    },
    /// A provider campaign event was received; payload is forwarded as-is.
    CampaignEvent { list_id: String, data: Value },
}
