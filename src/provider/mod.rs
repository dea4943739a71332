//! Email-marketing provider integration.

pub mod client;
pub mod list;

pub use client::{
    BatchResult, CampaignContent, GroupDef, ListMetadata, ListStats, MemberRecord, MemberStatus,
    MergeFieldDef, ProviderClient, ProviderCredentials, RestProviderClient, SubscribeOptions,
    UnsubscribeOptions,
};
pub use list::{ProviderList, SourceListBinding};
