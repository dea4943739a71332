//! End-to-end flows: reconciliation against a mock provider, webhook
//! fallout, and timed delivery.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use listsync::commands::SyncCommand;
use listsync::config::SyncConfig;
use listsync::delivery::machine::{DeliveryStateMachine, TaskScheduler};
use listsync::delivery::mailer::Mailer;
use listsync::delivery::newsletter::{Newsletter, NewsletterContent, ScheduleState};
use listsync::delivery::scheduler::TokioTaskScheduler;
use listsync::error::{Error, RemoteError, Result, StateError};
use listsync::mapping::MergePayload;
use listsync::provider::client::{
    BatchResult, CampaignContent, ListMetadata, MemberRecord, MemberStatus, ProviderClient,
    ProviderCredentials, SubscribeOptions, UnsubscribeOptions,
};
use listsync::provider::list::{ProviderList, SourceListBinding};
use listsync::reconcile::ReconciliationEngine;
use listsync::registry::AddressRegistry;
use listsync::webhook::{EventData, EventPayload, EventType, WebhookEventRouter};

/// In-memory provider keeping a subscribed-roster per list id.
#[derive(Default)]
struct MockProvider {
    rosters: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MockProvider {
    fn seed(&self, list_id: &str, emails: &[&str]) {
        self.rosters.lock().unwrap().insert(
            list_id.to_string(),
            emails.iter().map(|e| e.to_string()).collect(),
        );
    }

    fn roster(&self, list_id: &str) -> BTreeSet<String> {
        self.rosters
            .lock()
            .unwrap()
            .get(list_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn subscribe(
        &self,
        list_id: &str,
        email: &str,
        _merges: MergePayload,
        _opts: SubscribeOptions,
    ) -> Result<(), RemoteError> {
        self.rosters
            .lock()
            .unwrap()
            .entry(list_id.to_string())
            .or_default()
            .insert(email.to_string());
        Ok(())
    }

    async fn unsubscribe(
        &self,
        list_id: &str,
        email: &str,
        _opts: UnsubscribeOptions,
    ) -> Result<(), RemoteError> {
        self.rosters
            .lock()
            .unwrap()
            .entry(list_id.to_string())
            .or_default()
            .remove(email);
        Ok(())
    }

    async fn update_profile(
        &self,
        list_id: &str,
        email: &str,
        new_email: &str,
        _merges: MergePayload,
    ) -> Result<(), RemoteError> {
        let mut rosters = self.rosters.lock().unwrap();
        let roster = rosters.entry(list_id.to_string()).or_default();
        if roster.remove(email) {
            roster.insert(new_email.to_string());
        }
        Ok(())
    }

    async fn batch_subscribe(
        &self,
        list_id: &str,
        members: &[MemberRecord],
        _opts: SubscribeOptions,
    ) -> Result<BatchResult, RemoteError> {
        let mut rosters = self.rosters.lock().unwrap();
        let roster = rosters.entry(list_id.to_string()).or_default();
        let mut result = BatchResult::default();
        for member in members {
            if roster.insert(member.email.clone()) {
                result.added += 1;
            } else {
                result.updated += 1;
            }
        }
        Ok(result)
    }

    async fn batch_unsubscribe(
        &self,
        list_id: &str,
        emails: &[String],
        _opts: UnsubscribeOptions,
    ) -> Result<BatchResult, RemoteError> {
        let mut rosters = self.rosters.lock().unwrap();
        let roster = rosters.entry(list_id.to_string()).or_default();
        let mut result = BatchResult::default();
        for email in emails {
            if roster.remove(email) {
                result.updated += 1;
            } else {
                result.errors += 1;
            }
        }
        Ok(result)
    }

    async fn fetch_members(
        &self,
        list_id: &str,
        _status: MemberStatus,
    ) -> Result<Vec<MemberRecord>, RemoteError> {
        Ok(self
            .roster(list_id)
            .into_iter()
            .map(MemberRecord::bare)
            .collect())
    }

    async fn fetch_list_metadata(&self, _list_id: &str) -> Result<ListMetadata, RemoteError> {
        Ok(ListMetadata::default())
    }

    async fn upload_campaign(
        &self,
        _list_id: &str,
        _content: &CampaignContent,
        existing: Option<&str>,
    ) -> Result<String, RemoteError> {
        Ok(existing.unwrap_or("campaign-1").to_string())
    }

    async fn send_campaign(&self, _campaign_id: &str) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn send_campaign_test(
        &self,
        _campaign_id: &str,
        _emails: &[String],
    ) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn credentials() -> ProviderCredentials {
    ProviderCredentials {
        endpoint: "https://api.example.test/3.0".into(),
        api_key: secrecy::SecretString::from("test-key"),
    }
}

fn provider_list(registry: AddressRegistry) -> Arc<ProviderList> {
    Arc::new(
        ProviderList::new("abc123", credentials(), registry)
            .with_binding(SourceListBinding::new("announce", true)),
    )
}

#[tokio::test]
async fn sync_converges_provider_to_local_reference() {
    let registry = AddressRegistry::new();
    registry.add_member("announce", "a@x.com");
    registry.add_member("announce", "b@x.com");
    registry.register_bad("b@x.com");

    let provider = MockProvider::default();
    provider.seed("abc123", &["a@x.com", "stale@x.com", "b@x.com"]);

    let engine = ReconciliationEngine::new(registry.clone(), SyncConfig::default());
    let list = provider_list(registry);
    let summary = engine
        .synchronize(&list, &provider, &HashMap::new())
        .await
        .unwrap();

    // a stays, the stale address and the denylisted one go.
    assert_eq!(provider.roster("abc123"), BTreeSet::from(["a@x.com".to_string()]));
    assert_eq!(summary.failed_batches, 0);
    assert!(list.last_sync().is_some());

    // A second pass finds nothing to do.
    let summary = engine
        .synchronize(&list, &provider, &HashMap::new())
        .await
        .unwrap();
    assert_eq!(summary.batches, 0);
}

#[tokio::test]
async fn cleaned_webhook_purges_the_address_on_the_next_sync() {
    let registry = AddressRegistry::new();
    registry.add_member("announce", "a@x.com");
    registry.add_member("announce", "dead@x.com");

    let provider = MockProvider::default();
    provider.seed("abc123", &["a@x.com", "dead@x.com"]);

    let list = provider_list(registry.clone());
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let mut lists = HashMap::new();
    lists.insert("abc123".to_string(), Arc::clone(&list));
    let router = WebhookEventRouter::new(registry.clone(), SyncConfig::default(), lists, tx);
    let token = router.issue_token("secret", "abc123");

    router.handle(
        &token.token,
        EventPayload {
            event_type: EventType::Cleaned,
            fired_at: None,
            data: EventData {
                list_id: "abc123".into(),
                email: "dead@x.com".into(),
                ..Default::default()
            },
        },
    );
    assert!(registry.is_bad("dead@x.com"));

    let engine = ReconciliationEngine::new(registry, SyncConfig::default());
    engine
        .synchronize(&list, &provider, &HashMap::new())
        .await
        .unwrap();
    assert_eq!(provider.roster("abc123"), BTreeSet::from(["a@x.com".to_string()]));
}

#[tokio::test]
async fn subscribe_webhook_feeds_the_next_outbound_sync() {
    let registry = AddressRegistry::new();
    let provider = MockProvider::default();
    provider.seed("abc123", &["joined@x.com"]);

    let list = provider_list(registry.clone());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SyncCommand>();
    let mut lists = HashMap::new();
    lists.insert("abc123".to_string(), Arc::clone(&list));
    let router = WebhookEventRouter::new(registry.clone(), SyncConfig::default(), lists, tx);
    let token = router.issue_token("secret", "abc123");

    router.handle(
        &token.token,
        EventPayload {
            event_type: EventType::Subscribe,
            fired_at: None,
            data: EventData {
                list_id: "abc123".into(),
                email: "joined@x.com".into(),
                ..Default::default()
            },
        },
    );
    assert!(registry.is_member("announce", "joined@x.com"));
    assert!(rx.try_recv().is_err()); // no merges, no attribute command

    // The local reference now matches the provider; sync is a no-op.
    let engine = ReconciliationEngine::new(registry, SyncConfig::default());
    let summary = engine
        .synchronize(&list, &provider, &HashMap::new())
        .await
        .unwrap();
    assert_eq!(summary.batches, 0);
}

struct CountingMailer {
    sends: Mutex<Vec<String>>,
}

#[async_trait]
impl Mailer for CountingMailer {
    fn name(&self) -> &str {
        "counting"
    }

    async fn send(&self, newsletter: &Newsletter) -> Result<()> {
        self.sends.lock().unwrap().push(newsletter.content().subject);
        Ok(())
    }

    async fn send_test(&self, _newsletter: &Newsletter, _recipients: &[String]) -> Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn scheduled_newsletter_goes_out_exactly_once() {
    let (scheduler, mut fire_rx) = TokioTaskScheduler::new();
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(scheduler);
    let mailer = Arc::new(CountingMailer {
        sends: Mutex::new(Vec::new()),
    });
    let machine = DeliveryStateMachine::new(
        SyncConfig::default(),
        scheduler,
        vec![Arc::clone(&mailer) as Arc<dyn Mailer>],
        true,
    );

    let newsletter = Newsletter::new(NewsletterContent {
        subject: "April issue".into(),
        ..Default::default()
    });
    machine
        .schedule(&newsletter, Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(newsletter.schedule_state(), ScheduleState::On);

    tokio::time::advance(std::time::Duration::from_secs(11 * 60)).await;
    let fired = fire_rx.recv().await.unwrap();
    assert_eq!(fired, newsletter.id());
    machine.handle_fired(&newsletter).await.unwrap();

    assert!(newsletter.sent_at().is_some());
    assert_eq!(mailer.sends.lock().unwrap().len(), 1);

    // A stray duplicate fire must not send again.
    let err = machine.handle_fired(&newsletter).await.unwrap_err();
    assert!(matches!(err, Error::State(StateError::AlreadySent { .. })));
    assert_eq!(mailer.sends.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unscheduled_newsletter_never_fires() {
    let (scheduler, mut fire_rx) = TokioTaskScheduler::new();
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(scheduler);
    let machine = DeliveryStateMachine::new(SyncConfig::default(), scheduler, Vec::new(), false);

    let newsletter = Newsletter::new(NewsletterContent::default());
    machine
        .schedule(&newsletter, Utc::now() + Duration::minutes(10))
        .await
        .unwrap();
    machine.unschedule(&newsletter).await.unwrap();

    tokio::time::advance(std::time::Duration::from_secs(20 * 60)).await;
    assert!(fire_rx.try_recv().is_err());
    assert!(newsletter.sent_at().is_none());
}
