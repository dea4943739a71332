use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use listsync::commands::SyncCommand;
use listsync::config::SyncConfig;
use listsync::provider::{ProviderClient, ProviderCredentials, RestProviderClient};
use listsync::provider::list::{ProviderList, SourceListBinding};
use listsync::reconcile::ReconciliationEngine;
use listsync::registry::AddressRegistry;
use listsync::webhook::WebhookEventRouter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let api_key = std::env::var("LISTSYNC_PROVIDER_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: LISTSYNC_PROVIDER_API_KEY not set");
        std::process::exit(1);
    });
    let endpoint = std::env::var("LISTSYNC_PROVIDER_ENDPOINT")
        .unwrap_or_else(|_| "https://api.provider.example/3.0".to_string());
    let list_id = std::env::var("LISTSYNC_PROVIDER_LIST_ID").unwrap_or_else(|_| {
        eprintln!("Error: LISTSYNC_PROVIDER_LIST_ID not set");
        std::process::exit(1);
    });
    let source_list =
        std::env::var("LISTSYNC_SOURCE_LIST").unwrap_or_else(|_| "announce".to_string());
    let webhook_secret =
        std::env::var("LISTSYNC_WEBHOOK_SECRET").unwrap_or_else(|_| "change-me".to_string());
    let sync_interval_secs: u64 = std::env::var("LISTSYNC_SYNC_INTERVAL_SECS")
        .unwrap_or_else(|_| "300".to_string())
        .parse()
        .unwrap_or(300);

    eprintln!("listsync v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Provider list: {list_id}");
    eprintln!("   Source list:   {source_list}");
    eprintln!("   Sync every:    {sync_interval_secs}s\n");

    let config = SyncConfig::default();
    let registry = AddressRegistry::new();
    let client: Arc<dyn ProviderClient> = Arc::new(RestProviderClient::new(ProviderCredentials {
        endpoint: endpoint.clone(),
        api_key: secrecy::SecretString::from(api_key.clone()),
    }));

    let provider_list = Arc::new(
        ProviderList::new(
            list_id.clone(),
            ProviderCredentials {
                endpoint,
                api_key: secrecy::SecretString::from(api_key),
            },
            registry.clone(),
        )
        .with_binding(SourceListBinding::new(source_list, true)),
    );

    if let Err(e) = provider_list.refresh_metadata(client.as_ref()).await {
        tracing::warn!(error = %e, "initial metadata refresh failed, continuing offline");
    }

    let (command_tx, mut command_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut lists = HashMap::new();
    lists.insert(list_id.clone(), Arc::clone(&provider_list));
    let router = Arc::new(WebhookEventRouter::new(
        registry.clone(),
        config.clone(),
        lists,
        command_tx,
    ));
    let token = router.issue_token(&webhook_secret, &list_id);
    tracing::info!(list_id = %list_id, token = %token.token, "webhook token issued");

    // Command worker: webhook handlers enqueue, only this task talks to
    // the provider.
    let worker_client = Arc::clone(&client);
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            apply_command(worker_client.as_ref(), command).await;
        }
    });

    let engine = ReconciliationEngine::new(registry, config);
    let mut ticker = tokio::time::interval(Duration::from_secs(sync_interval_secs));
    loop {
        ticker.tick().await;
        match engine
            .synchronize(&provider_list, client.as_ref(), &HashMap::new())
            .await
        {
            Ok(summary) => tracing::info!(
                added = summary.added,
                updated = summary.updated,
                errors = summary.errors,
                "sync pass complete"
            ),
            Err(e) => tracing::error!(error = %e, "sync pass failed"),
        }
    }
}

async fn apply_command(client: &dyn ProviderClient, command: SyncCommand) {
    let result = match &command {
        SyncCommand::SubscribeRemote { list_id, email } => {
            client
                .subscribe(list_id, email, Default::default(), Default::default())
                .await
        }
        SyncCommand::UnsubscribeRemote { list_id, email } => {
            client.unsubscribe(list_id, email, Default::default()).await
        }
        SyncCommand::UpdateRemoteProfile {
            list_id,
            email,
            new_email,
        } => {
            client
                .update_profile(
                    list_id,
                    email,
                    new_email.as_deref().unwrap_or(email),
                    Default::default(),
                )
                .await
        }
        SyncCommand::ApplyAttributes { email, attrs } => {
            tracing::info!(email, count = attrs.len(), "attributes recorded");
            Ok(())
        }
        SyncCommand::CampaignEvent { list_id, .. } => {
            tracing::info!(list_id, "campaign event recorded");
            Ok(())
        }
    };
    if let Err(e) = result {
        tracing::error!(error = %e, ?command, "command failed");
    }
}
