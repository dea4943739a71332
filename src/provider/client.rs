//! Marketing-provider boundary — call shapes only, wire format opaque.
//!
//! Implementations must map the provider's "already subscribed" answer on
//! subscribe, and "not subscribed"/"member missing" on unsubscribe, to
//! `Ok(())`: re-applying an already-correct membership is success, not an
//! error. Everything else surfaces as [`RemoteError`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::mapping::MergePayload;

/// Remote membership status filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Subscribed,
    Unsubscribed,
    Cleaned,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Cleaned => "cleaned",
        }
    }
}

/// One remote member as returned by `fetch_members` or submitted in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub email: String,
    #[serde(default)]
    pub merges: MergePayload,
}

impl MemberRecord {
    pub fn bare(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            merges: MergePayload::new(),
        }
    }
}

/// Options for subscribe-shaped calls.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub double_optin: bool,
    pub update_existing: bool,
    pub send_welcome: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        // Bulk sync default: no opt-in round trip, no welcome mail.
        Self {
            double_optin: false,
            update_existing: true,
            send_welcome: false,
        }
    }
}

/// Options for unsubscribe-shaped calls.
#[derive(Debug, Clone)]
pub struct UnsubscribeOptions {
    pub delete_member: bool,
    pub send_goodbye: bool,
    pub send_notify: bool,
}

impl Default for UnsubscribeOptions {
    fn default() -> Self {
        Self {
            delete_member: false,
            send_goodbye: false,
            send_notify: false,
        }
    }
}

/// Per-batch result counters as reported by the provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub added: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub error_messages: Vec<String>,
}

/// Remote list statistics — a read cache, never authoritative.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListStats {
    pub member_count: Option<u64>,
    pub unsubscribe_count: Option<u64>,
    pub cleaned_count: Option<u64>,
    pub avg_sub_rate: Option<f64>,
    pub avg_unsub_rate: Option<f64>,
    pub open_rate: Option<f64>,
    pub click_rate: Option<f64>,
}

/// A merge field as defined on the provider side.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeFieldDef {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
}

/// A categorical group and its known options.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Remote list metadata snapshot.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default_from_name: String,
    #[serde(default)]
    pub default_from_email: String,
    #[serde(default)]
    pub stats: ListStats,
    #[serde(default)]
    pub merge_fields: Vec<MergeFieldDef>,
    #[serde(default)]
    pub groups: Vec<GroupDef>,
}

/// Campaign content for the campaign mailer. The provider caps subject at
/// 150 bytes and title at 100; [`chop`] enforces both before upload.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignContent {
    pub subject: String,
    pub title: String,
    pub from_name: String,
    pub from_email: String,
    pub html: String,
    pub text: String,
}

/// Chop a string to at most `limit` bytes without splitting a character,
/// appending an ellipsis when something was cut. The provider counts
/// bytes, not characters.
pub fn chop(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }
    if limit <= 3 {
        return "..."[..limit].to_string();
    }
    let mut out = String::with_capacity(limit);
    for c in value.chars() {
        if out.len() + c.len_utf8() > limit.saturating_sub(3) {
            break;
        }
        out.push(c);
    }
    out.push_str("...");
    out
}

/// The provider API surface used by this core.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn subscribe(
        &self,
        list_id: &str,
        email: &str,
        merges: MergePayload,
        opts: SubscribeOptions,
    ) -> Result<(), RemoteError>;

    async fn unsubscribe(
        &self,
        list_id: &str,
        email: &str,
        opts: UnsubscribeOptions,
    ) -> Result<(), RemoteError>;

    async fn update_profile(
        &self,
        list_id: &str,
        email: &str,
        new_email: &str,
        merges: MergePayload,
    ) -> Result<(), RemoteError>;

    async fn batch_subscribe(
        &self,
        list_id: &str,
        members: &[MemberRecord],
        opts: SubscribeOptions,
    ) -> Result<BatchResult, RemoteError>;

    async fn batch_unsubscribe(
        &self,
        list_id: &str,
        emails: &[String],
        opts: UnsubscribeOptions,
    ) -> Result<BatchResult, RemoteError>;

    async fn fetch_members(
        &self,
        list_id: &str,
        status: MemberStatus,
    ) -> Result<Vec<MemberRecord>, RemoteError>;

    async fn fetch_list_metadata(&self, list_id: &str) -> Result<ListMetadata, RemoteError>;

    /// Upload (or replace) campaign content; returns the campaign id.
    async fn upload_campaign(
        &self,
        list_id: &str,
        content: &CampaignContent,
        existing: Option<&str>,
    ) -> Result<String, RemoteError>;

    async fn send_campaign(&self, campaign_id: &str) -> Result<(), RemoteError>;

    async fn send_campaign_test(
        &self,
        campaign_id: &str,
        emails: &[String],
    ) -> Result<(), RemoteError>;
}

// ── REST implementation ─────────────────────────────────────────────

/// Injected provider credentials — never read from process-wide state.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub endpoint: String,
    pub api_key: SecretString,
}

/// Thin REST client for the hosted provider.
pub struct RestProviderClient {
    credentials: ProviderCredentials,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

impl RestProviderClient {
    pub fn new(credentials: ProviderCredentials) -> Self {
        Self {
            credentials,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.credentials.endpoint.trim_end_matches('/'), path)
    }

    async fn post(
        &self,
        operation: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(self.credentials.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let error: ApiError = response.json().await.unwrap_or(ApiError {
            title: "unknown".into(),
            detail: String::new(),
        });
        Err(RemoteError::Api {
            operation: operation.to_string(),
            message: format!("{}: {}", error.title, error.detail),
        })
    }

    /// "Already subscribed"/"not subscribed" answers are success.
    fn absorb_membership_noop(
        result: Result<reqwest::Response, RemoteError>,
    ) -> Result<(), RemoteError> {
        match result {
            Ok(_) => Ok(()),
            Err(RemoteError::Api { ref message, .. })
                if message.contains("Member Exists")
                    || message.contains("already a member")
                    || message.contains("not subscribed") =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ProviderClient for RestProviderClient {
    async fn subscribe(
        &self,
        list_id: &str,
        email: &str,
        merges: MergePayload,
        opts: SubscribeOptions,
    ) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "email": email,
            "merge_fields": merges,
            "double_optin": opts.double_optin,
            "update_existing": opts.update_existing,
            "send_welcome": opts.send_welcome,
        });
        Self::absorb_membership_noop(
            self.post("subscribe", &format!("lists/{list_id}/members"), body)
                .await,
        )
    }

    async fn unsubscribe(
        &self,
        list_id: &str,
        email: &str,
        opts: UnsubscribeOptions,
    ) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "email": email,
            "delete_member": opts.delete_member,
            "send_goodbye": opts.send_goodbye,
            "send_notify": opts.send_notify,
        });
        Self::absorb_membership_noop(
            self.post("unsubscribe", &format!("lists/{list_id}/unsubscribe"), body)
                .await,
        )
    }

    async fn update_profile(
        &self,
        list_id: &str,
        email: &str,
        new_email: &str,
        merges: MergePayload,
    ) -> Result<(), RemoteError> {
        let body = serde_json::json!({
            "email": email,
            "new_email": new_email,
            "merge_fields": merges,
        });
        self.post("update_profile", &format!("lists/{list_id}/members/update"), body)
            .await
            .map(|_| ())
    }

    async fn batch_subscribe(
        &self,
        list_id: &str,
        members: &[MemberRecord],
        opts: SubscribeOptions,
    ) -> Result<BatchResult, RemoteError> {
        let body = serde_json::json!({
            "members": members,
            "double_optin": opts.double_optin,
            "update_existing": opts.update_existing,
        });
        let response = self
            .post("batch_subscribe", &format!("lists/{list_id}/batch"), body)
            .await?;
        Ok(response.json().await?)
    }

    async fn batch_unsubscribe(
        &self,
        list_id: &str,
        emails: &[String],
        opts: UnsubscribeOptions,
    ) -> Result<BatchResult, RemoteError> {
        let body = serde_json::json!({
            "emails": emails,
            "delete_member": opts.delete_member,
            "send_goodbye": opts.send_goodbye,
            "send_notify": opts.send_notify,
        });
        let response = self
            .post(
                "batch_unsubscribe",
                &format!("lists/{list_id}/batch-unsubscribe"),
                body,
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn fetch_members(
        &self,
        list_id: &str,
        status: MemberStatus,
    ) -> Result<Vec<MemberRecord>, RemoteError> {
        // Paginated export; the provider caps pages at 1000 records.
        let mut members = Vec::new();
        let mut offset = 0usize;
        loop {
            let response = self
                .http
                .get(self.url(&format!("lists/{list_id}/members")))
                .bearer_auth(self.credentials.api_key.expose_secret())
                .query(&[
                    ("status", status.as_str()),
                    ("offset", &offset.to_string()),
                    ("count", "1000"),
                ])
                .send()
                .await?
                .error_for_status()
                .map_err(RemoteError::from)?;
            let page: Vec<MemberRecord> = response.json().await?;
            let len = page.len();
            members.extend(page);
            if len < 1000 {
                return Ok(members);
            }
            offset += len;
        }
    }

    async fn fetch_list_metadata(&self, list_id: &str) -> Result<ListMetadata, RemoteError> {
        let response = self
            .http
            .get(self.url(&format!("lists/{list_id}")))
            .bearer_auth(self.credentials.api_key.expose_secret())
            .send()
            .await?
            .error_for_status()
            .map_err(RemoteError::from)?;
        Ok(response.json().await?)
    }

    async fn upload_campaign(
        &self,
        list_id: &str,
        content: &CampaignContent,
        existing: Option<&str>,
    ) -> Result<String, RemoteError> {
        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let body = serde_json::json!({
            "list_id": list_id,
            "campaign": content,
        });
        let path = match existing {
            Some(id) => format!("campaigns/{id}"),
            None => "campaigns".to_string(),
        };
        let response = self.post("upload_campaign", &path, body).await?;
        let created: Created = response.json().await?;
        Ok(created.id)
    }

    async fn send_campaign(&self, campaign_id: &str) -> Result<(), RemoteError> {
        self.post(
            "send_campaign",
            &format!("campaigns/{campaign_id}/send"),
            serde_json::json!({}),
        )
        .await
        .map(|_| ())
    }

    async fn send_campaign_test(
        &self,
        campaign_id: &str,
        emails: &[String],
    ) -> Result<(), RemoteError> {
        self.post(
            "send_campaign_test",
            &format!("campaigns/{campaign_id}/test"),
            serde_json::json!({ "emails": emails }),
        )
        .await
        .map(|_| ())
    }
}
