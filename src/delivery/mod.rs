//! Newsletter delivery: issues, channels, scheduling.

pub mod machine;
pub mod mailer;
pub mod newsletter;
pub mod scheduler;

pub use machine::{DeliveryStateMachine, TaskScheduler};
pub use mailer::{
    CampaignMailer, EmailMailer, ListRelayMailer, Mailer, MailerParams, MailerRegistry, ParamValue,
};
pub use newsletter::{
    DeliveryLog, DeliveryLogEntry, Newsletter, NewsletterContent, ScheduleState, TaskHandle,
};
pub use scheduler::TokioTaskScheduler;
