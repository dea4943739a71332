//! Scheduling and at-most-once send orchestration.
//!
//! State walk: `Off → Ongoing → On`. `Ongoing` is held only while channel
//! hooks run and the timer is registered; any failure in that window rolls
//! the issue back to `Off` so a retry starts clean. The immutable sent
//! timestamp, not the schedule state, is the authoritative send guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::delivery::mailer::Mailer;
use crate::delivery::newsletter::{
    DeliveryLog, DeliveryLogEntry, Newsletter, ScheduleState, TaskHandle,
};
use crate::error::{Result, StateError};

/// Deferred-execution backend for timed sends.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Register a send for `newsletter_id` at `run_at`; the returned
    /// handle cancels it.
    async fn schedule(
        &self,
        run_at: DateTime<Utc>,
        newsletter_id: Uuid,
    ) -> Result<TaskHandle, StateError>;

    async fn revoke(&self, handle: &TaskHandle) -> Result<(), StateError>;
}

/// Drives newsletters through schedule, cancel and send.
pub struct DeliveryStateMachine {
    config: SyncConfig,
    scheduler: Arc<dyn TaskScheduler>,
    channels: Vec<Arc<dyn Mailer>>,
    /// Whether a sent issue is published to the public archive.
    archive: bool,
    log: DeliveryLog,
}

impl DeliveryStateMachine {
    pub fn new(
        config: SyncConfig,
        scheduler: Arc<dyn TaskScheduler>,
        channels: Vec<Arc<dyn Mailer>>,
        archive: bool,
    ) -> Self {
        Self {
            config,
            scheduler,
            channels,
            archive,
            log: DeliveryLog::new(),
        }
    }

    pub fn log(&self) -> &DeliveryLog {
        &self.log
    }

    /// Schedule `newsletter` for delivery at `release`.
    ///
    /// The release must lie beyond the configured safety margin so the
    /// timer cannot fire while the transition is still in flight.
    pub async fn schedule(&self, newsletter: &Newsletter, release: DateTime<Utc>) -> Result<()> {
        let id = newsletter.id();
        if newsletter.sent_at().is_some() {
            return Err(StateError::AlreadySent { id: id.to_string() }.into());
        }
        if release <= Utc::now() + self.config.schedule_margin {
            return Err(StateError::ReleaseInPast { id: id.to_string() }.into());
        }
        if !newsletter.transition(ScheduleState::Off, ScheduleState::Ongoing) {
            return Err(StateError::AlreadyScheduled {
                id: id.to_string(),
                state: newsletter.schedule_state().to_string(),
            }
            .into());
        }

        for channel in &self.channels {
            if let Err(err) = channel.on_scheduled(newsletter).await {
                error!(
                    newsletter_id = %id,
                    channel = channel.name(),
                    error = %err,
                    "schedule hook failed, rolling back"
                );
                newsletter.force_state(ScheduleState::Off);
                return Err(err);
            }
        }

        let handle = match self.scheduler.schedule(release, id).await {
            Ok(handle) => handle,
            Err(err) => {
                newsletter.force_state(ScheduleState::Off);
                return Err(err.into());
            }
        };
        newsletter.set_release(release);
        newsletter.set_task_handle(Some(handle));
        newsletter.force_state(ScheduleState::On);
        info!(newsletter_id = %id, %release, "newsletter scheduled");
        Ok(())
    }

    /// Cancel a scheduled delivery.
    pub async fn unschedule(&self, newsletter: &Newsletter) -> Result<()> {
        let id = newsletter.id();
        if newsletter.schedule_state() != ScheduleState::On {
            return Err(StateError::NotScheduled { id: id.to_string() }.into());
        }
        let handle = newsletter
            .task_handle()
            .ok_or(StateError::MissingTaskHandle { id: id.to_string() })?;

        self.scheduler.revoke(&handle).await?;
        for channel in &self.channels {
            if let Err(err) = channel.on_unscheduled(newsletter).await {
                warn!(
                    newsletter_id = %id,
                    channel = channel.name(),
                    error = %err,
                    "unschedule hook failed"
                );
            }
        }
        newsletter.set_task_handle(None);
        newsletter.force_state(ScheduleState::Off);
        info!(newsletter_id = %id, "newsletter unscheduled");
        Ok(())
    }

    /// Immediate send of an unscheduled newsletter.
    pub async fn send_now(&self, newsletter: &Newsletter) -> Result<()> {
        if newsletter.schedule_state() != ScheduleState::Off {
            return Err(StateError::AlreadyScheduled {
                id: newsletter.id().to_string(),
                state: newsletter.schedule_state().to_string(),
            }
            .into());
        }
        self.execute_send(newsletter).await
    }

    /// Timer-fired entry point: the handle is spent, then the send runs
    /// under the same at-most-once guard as every other path.
    pub async fn handle_fired(&self, newsletter: &Newsletter) -> Result<()> {
        newsletter.set_task_handle(None);
        newsletter.force_state(ScheduleState::Off);
        self.execute_send(newsletter).await
    }

    /// The single send path. First caller wins the sent timestamp; every
    /// later caller gets `AlreadySent` regardless of how it got here.
    async fn execute_send(&self, newsletter: &Newsletter) -> Result<()> {
        let id = newsletter.id();
        if newsletter.mark_sent(Utc::now(), self.archive).is_some() {
            return Err(StateError::AlreadySent { id: id.to_string() }.into());
        }

        for channel in &self.channels {
            let result = channel.send(newsletter).await;
            self.log.append(DeliveryLogEntry {
                timestamp: Utc::now(),
                newsletter_id: id,
                channel: channel.name().to_string(),
                is_test: false,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            });
            if let Err(err) = result {
                error!(
                    newsletter_id = %id,
                    channel = channel.name(),
                    error = %err,
                    "delivery failed, remaining channels skipped"
                );
                return Err(err);
            }
        }
        info!(newsletter_id = %id, channels = self.channels.len(), "newsletter sent");
        Ok(())
    }

    /// Test delivery to explicit recipients. Channels run independently;
    /// one failing does not stop the others, and issue state is untouched.
    pub async fn send_test(&self, newsletter: &Newsletter, recipients: &[String]) -> Result<()> {
        let id = newsletter.id();
        let mut first_error = None;
        for channel in &self.channels {
            let result = channel.send_test(newsletter, recipients).await;
            self.log.append(DeliveryLogEntry {
                timestamp: Utc::now(),
                newsletter_id: id,
                channel: channel.name().to_string(),
                is_test: true,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            });
            if let Err(err) = result {
                warn!(
                    newsletter_id = %id,
                    channel = channel.name(),
                    error = %err,
                    "test delivery failed"
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
