//! Newsletter state and the append-only delivery log.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Scheduling lifecycle of a newsletter.
///
/// `Ongoing` exists so that a crash between reserving the transition and
/// registering the timer never leaves two live schedules for one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleState {
    #[default]
    Off,
    Ongoing,
    On,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Ongoing => "ongoing",
            Self::On => "on",
        };
        f.write_str(name)
    }
}

/// Opaque handle to a registered send task, needed to cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub String);

/// Rendered content of one issue.
#[derive(Debug, Clone, Default)]
pub struct NewsletterContent {
    pub subject: String,
    pub html: String,
    pub text: String,
    pub from_name: String,
    pub from_email: String,
}

#[derive(Debug, Default)]
struct NewsletterState {
    schedule: ScheduleState,
    frozen: bool,
    published: bool,
    /// Immutable once set. The at-most-once send guard.
    sent_at: Option<DateTime<Utc>>,
    release_date: Option<DateTime<Utc>>,
    task_handle: Option<TaskHandle>,
    /// Provider campaign id, kept across re-uploads.
    campaign_id: Option<String>,
}

/// One newsletter issue.
#[derive(Clone)]
pub struct Newsletter {
    id: Uuid,
    content: Arc<RwLock<NewsletterContent>>,
    state: Arc<RwLock<NewsletterState>>,
}

impl Newsletter {
    pub fn new(content: NewsletterContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: Arc::new(RwLock::new(content)),
            state: Arc::new(RwLock::new(NewsletterState::default())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content(&self) -> NewsletterContent {
        self.content.read().expect("newsletter lock poisoned").clone()
    }

    /// Replace the rendered content. Rejected silently once frozen; the
    /// caller checks [`Self::frozen`] when it needs to know.
    pub fn set_content(&self, content: NewsletterContent) -> bool {
        if self.frozen() {
            return false;
        }
        *self.content.write().expect("newsletter lock poisoned") = content;
        true
    }

    pub fn schedule_state(&self) -> ScheduleState {
        self.state.read().expect("newsletter lock poisoned").schedule
    }

    pub fn frozen(&self) -> bool {
        self.state.read().expect("newsletter lock poisoned").frozen
    }

    pub fn published(&self) -> bool {
        self.state.read().expect("newsletter lock poisoned").published
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("newsletter lock poisoned").sent_at
    }

    pub fn release_date(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("newsletter lock poisoned").release_date
    }

    pub fn task_handle(&self) -> Option<TaskHandle> {
        self.state
            .read()
            .expect("newsletter lock poisoned")
            .task_handle
            .clone()
    }

    pub fn campaign_id(&self) -> Option<String> {
        self.state
            .read()
            .expect("newsletter lock poisoned")
            .campaign_id
            .clone()
    }

    pub(crate) fn set_campaign_id(&self, id: String) {
        self.state.write().expect("newsletter lock poisoned").campaign_id = Some(id);
    }

    /// Compare-and-set on the schedule state. Returns false when the
    /// current state is not `from`, leaving everything untouched.
    pub(crate) fn transition(&self, from: ScheduleState, to: ScheduleState) -> bool {
        let mut state = self.state.write().expect("newsletter lock poisoned");
        if state.schedule != from {
            return false;
        }
        state.schedule = to;
        true
    }

    pub(crate) fn force_state(&self, to: ScheduleState) {
        self.state.write().expect("newsletter lock poisoned").schedule = to;
    }

    pub(crate) fn set_release(&self, at: DateTime<Utc>) {
        self.state.write().expect("newsletter lock poisoned").release_date = Some(at);
    }

    pub(crate) fn set_task_handle(&self, handle: Option<TaskHandle>) {
        self.state.write().expect("newsletter lock poisoned").task_handle = handle;
    }

    /// Record the send timestamp. Returns the already-set timestamp when
    /// one exists; the first writer wins and the value never changes.
    pub(crate) fn mark_sent(&self, at: DateTime<Utc>, publish: bool) -> Option<DateTime<Utc>> {
        let mut state = self.state.write().expect("newsletter lock poisoned");
        if let Some(existing) = state.sent_at {
            return Some(existing);
        }
        state.sent_at = Some(at);
        state.frozen = true;
        if publish {
            state.published = true;
        }
        None
    }
}

/// One delivery attempt, real or test.
#[derive(Debug, Clone)]
pub struct DeliveryLogEntry {
    pub timestamp: DateTime<Utc>,
    pub newsletter_id: Uuid,
    pub channel: String,
    pub is_test: bool,
    pub success: bool,
    pub error: Option<String>,
}

/// Append-only record of delivery attempts.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    entries: Arc<Mutex<Vec<DeliveryLogEntry>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: DeliveryLogEntry) {
        self.entries.lock().expect("delivery log poisoned").push(entry);
    }

    pub fn entries_for(&self, newsletter_id: Uuid) -> Vec<DeliveryLogEntry> {
        self.entries
            .lock()
            .expect("delivery log poisoned")
            .iter()
            .filter(|e| e.newsletter_id == newsletter_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("delivery log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
