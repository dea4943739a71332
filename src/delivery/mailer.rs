//! Delivery channels ("mailers") and their compile-time registry.
//!
//! A mailer is a pluggable transport a newsletter goes out through. The
//! registry maps a stable string key to a factory; instances are built
//! from per-instance [`MailerParams`], never from process-wide state.

use async_trait::async_trait;
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use uuid::Uuid;

use crate::delivery::newsletter::{Newsletter, NewsletterContent};
use crate::error::{ConfigError, Error, Result, StateError};
use crate::provider::client::{chop, CampaignContent, ProviderClient};

/// One configuration parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// Per-instance mailer configuration.
#[derive(Debug, Clone, Default)]
pub struct MailerParams {
    owner: String,
    values: HashMap<String, ParamValue>,
}

impl MailerParams {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            values: HashMap::new(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    fn missing(&self, key: &str) -> Error {
        ConfigError::MissingParameter {
            owner: self.owner.clone(),
            key: key.to_string(),
        }
        .into()
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        match self.values.get(key) {
            Some(ParamValue::Str(s)) => Ok(s),
            _ => Err(self.missing(key)),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        match self.values.get(key) {
            Some(ParamValue::Int(i)) => Ok(*i),
            _ => Err(self.missing(key)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.values.get(key) {
            Some(ParamValue::Bool(b)) => Ok(*b),
            _ => Err(self.missing(key)),
        }
    }

    pub fn get_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.values.get(key) {
            Some(ParamValue::Str(s)) => s,
            _ => default,
        }
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(ParamValue::Int(i)) => *i,
            _ => default,
        }
    }
}

/// A delivery channel.
///
/// The lifecycle hooks default to no-ops; transports that pre-stage work
/// remotely (campaign upload) override them.
#[async_trait]
pub trait Mailer: Send + Sync {
    fn name(&self) -> &str;

    /// Called when the newsletter enters the scheduled state. A failure
    /// here rolls the schedule back.
    async fn on_scheduled(&self, _newsletter: &Newsletter) -> Result<()> {
        Ok(())
    }

    /// Called when a scheduled newsletter is cancelled.
    async fn on_unscheduled(&self, _newsletter: &Newsletter) -> Result<()> {
        Ok(())
    }

    async fn send(&self, newsletter: &Newsletter) -> Result<()>;

    /// Test delivery to explicit recipients. Must not touch issue state.
    async fn send_test(&self, newsletter: &Newsletter, recipients: &[String]) -> Result<()>;
}

impl std::fmt::Debug for dyn Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer").field("name", &self.name()).finish()
    }
}

type MailerFactory = Box<dyn Fn(&MailerParams) -> Result<Arc<dyn Mailer>> + Send + Sync>;

/// Compile-time registry of available mailer plugins.
#[derive(Default)]
pub struct MailerRegistry {
    factories: HashMap<&'static str, MailerFactory>,
}

impl MailerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in SMTP transports. Campaign mailers need
    /// an injected provider client; register those with [`Self::register`].
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("email", |params| {
            Ok(Arc::new(EmailMailer::from_params(params)?) as Arc<dyn Mailer>)
        });
        registry.register("list-relay", |params| {
            Ok(Arc::new(ListRelayMailer::from_params(params)?) as Arc<dyn Mailer>)
        });
        registry
    }

    pub fn register<F>(&mut self, key: &'static str, factory: F)
    where
        F: Fn(&MailerParams) -> Result<Arc<dyn Mailer>> + Send + Sync + 'static,
    {
        self.factories.insert(key, Box::new(factory));
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.factories.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Instantiate the plugin behind `key`.
    pub fn build(&self, key: &str, params: &MailerParams) -> Result<Arc<dyn Mailer>> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| ConfigError::UnknownPlugin(key.to_string()))?;
        factory(params)
    }
}

// ── SMTP mailers ────────────────────────────────────────────────────

/// Plain SMTP delivery to a fixed recipient list.
pub struct EmailMailer {
    smtp_host: String,
    smtp_port: u16,
    username: String,
    password: String,
    recipients: Vec<String>,
}

impl EmailMailer {
    pub fn from_params(params: &MailerParams) -> Result<Self> {
        let recipients = params
            .get_str("emails")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Ok(Self {
            smtp_host: params.get_str("smtp_host")?.to_string(),
            smtp_port: params.get_int_or("smtp_port", 587) as u16,
            username: params.get_str_or("username", "").to_string(),
            password: params.get_str_or("password", "").to_string(),
            recipients,
        })
    }

    fn transport(&self) -> Result<SmtpTransport> {
        let relay = SmtpTransport::relay(&self.smtp_host).map_err(|e| {
            StateError::ChannelFailed {
                channel: "email".into(),
                message: format!("SMTP relay error: {e}"),
            }
        })?;
        let mut builder = relay.port(self.smtp_port);
        if !self.username.is_empty() {
            builder = builder
                .credentials(Credentials::new(self.username.clone(), self.password.clone()));
        }
        Ok(builder.build())
    }

    fn deliver(
        &self,
        newsletter_id: Uuid,
        content: &NewsletterContent,
        recipients: &[String],
        test: bool,
    ) -> Result<()> {
        let subject = if test {
            format!("TEST - {}", content.subject)
        } else {
            content.subject.clone()
        };
        let from = format!("{} <{}>", content.from_name, content.from_email);
        let transport = self.transport()?;

        for recipient in recipients {
            let message = Message::builder()
                .from(from.parse().map_err(|e| StateError::ChannelFailed {
                    channel: "email".into(),
                    message: format!("Invalid from address: {e}"),
                })?)
                .to(recipient.parse().map_err(|e| StateError::ChannelFailed {
                    channel: "email".into(),
                    message: format!("Invalid recipient {recipient}: {e}"),
                })?)
                .subject(subject.clone())
                .multipart(MultiPart::alternative_plain_html(
                    content.text.clone(),
                    content.html.clone(),
                ))
                .map_err(|e| StateError::ChannelFailed {
                    channel: "email".into(),
                    message: format!("Failed to build email: {e}"),
                })?;
            transport.send(&message).map_err(|e| StateError::ChannelFailed {
                channel: "email".into(),
                message: format!("SMTP send failed: {e}"),
            })?;
            info!(%newsletter_id, recipient, test, "email delivered");
        }
        Ok(())
    }
}

#[async_trait]
impl Mailer for EmailMailer {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, newsletter: &Newsletter) -> Result<()> {
        self.deliver(newsletter.id(), &newsletter.content(), &self.recipients, false)
    }

    async fn send_test(&self, newsletter: &Newsletter, recipients: &[String]) -> Result<()> {
        self.deliver(newsletter.id(), &newsletter.content(), recipients, true)
    }
}

/// SMTP delivery to a mailing-list posting address, with the list's
/// unsubscribe information appended to both bodies.
pub struct ListRelayMailer {
    inner: EmailMailer,
    listinfo_url: String,
}

impl ListRelayMailer {
    pub fn from_params(params: &MailerParams) -> Result<Self> {
        let list_address = params.get_str("list_address")?.to_string();
        let listinfo_url = params.get_str("listinfo_url")?.to_string();
        let inner = EmailMailer::from_params(
            &MailerParams::new("list-relay")
                .set("emails", ParamValue::Str(list_address))
                .set(
                    "smtp_host",
                    ParamValue::Str(params.get_str("smtp_host")?.to_string()),
                )
                .set(
                    "smtp_port",
                    ParamValue::Int(params.get_int_or("smtp_port", 587)),
                )
                .set(
                    "username",
                    ParamValue::Str(params.get_str_or("username", "").to_string()),
                )
                .set(
                    "password",
                    ParamValue::Str(params.get_str_or("password", "").to_string()),
                ),
        )?;
        Ok(Self {
            inner,
            listinfo_url,
        })
    }

    fn with_footer(&self, newsletter: &Newsletter) -> NewsletterContent {
        let mut content = newsletter.content();
        content.text = format!(
            "{}\n\n--\nUnsubscribe or change your subscription: {}\n",
            content.text, self.listinfo_url
        );
        content.html = format!(
            "{}<hr/><p><a href=\"{}\">Unsubscribe or change your subscription</a></p>",
            content.html, self.listinfo_url
        );
        content
    }
}

#[async_trait]
impl Mailer for ListRelayMailer {
    fn name(&self) -> &str {
        "list-relay"
    }

    async fn send(&self, newsletter: &Newsletter) -> Result<()> {
        let footed = self.with_footer(newsletter);
        self.inner
            .deliver(newsletter.id(), &footed, &self.inner.recipients, false)
    }

    async fn send_test(&self, newsletter: &Newsletter, recipients: &[String]) -> Result<()> {
        let footed = self.with_footer(newsletter);
        self.inner.deliver(newsletter.id(), &footed, recipients, true)
    }
}

// ── Campaign mailer ─────────────────────────────────────────────────

/// Delivery through the marketing provider as a campaign.
///
/// Content is staged remotely at schedule time so the campaign can be
/// inspected in the provider UI before release; the actual send re-uploads
/// first so last-minute edits are never lost.
pub struct CampaignMailer {
    client: Arc<dyn ProviderClient>,
    list_id: String,
}

impl CampaignMailer {
    /// Provider limits on campaign fields, in bytes.
    const SUBJECT_LIMIT: usize = 150;
    const TITLE_LIMIT: usize = 100;

    pub fn new(client: Arc<dyn ProviderClient>, list_id: impl Into<String>) -> Self {
        Self {
            client,
            list_id: list_id.into(),
        }
    }

    pub fn from_params(client: Arc<dyn ProviderClient>, params: &MailerParams) -> Result<Self> {
        Ok(Self::new(client, params.get_str("list_id")?))
    }

    fn campaign_content(&self, newsletter: &Newsletter) -> CampaignContent {
        let content = newsletter.content();
        CampaignContent {
            subject: chop(&content.subject, Self::SUBJECT_LIMIT),
            title: chop(&content.subject, Self::TITLE_LIMIT),
            from_name: content.from_name,
            from_email: content.from_email,
            html: content.html,
            text: content.text,
        }
    }

    async fn upload(&self, newsletter: &Newsletter) -> Result<String> {
        let existing = newsletter.campaign_id();
        let id = self
            .client
            .upload_campaign(
                &self.list_id,
                &self.campaign_content(newsletter),
                existing.as_deref(),
            )
            .await?;
        newsletter.set_campaign_id(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl Mailer for CampaignMailer {
    fn name(&self) -> &str {
        "campaign"
    }

    async fn on_scheduled(&self, newsletter: &Newsletter) -> Result<()> {
        let id = self.upload(newsletter).await?;
        info!(newsletter_id = %newsletter.id(), campaign_id = %id, "campaign staged");
        Ok(())
    }

    async fn send(&self, newsletter: &Newsletter) -> Result<()> {
        let id = self.upload(newsletter).await?;
        self.client.send_campaign(&id).await?;
        info!(newsletter_id = %newsletter.id(), campaign_id = %id, "campaign sent");
        Ok(())
    }

    async fn send_test(&self, newsletter: &Newsletter, recipients: &[String]) -> Result<()> {
        let id = self.upload(newsletter).await?;
        self.client.send_campaign_test(&id, recipients).await?;
        Ok(())
    }
}
