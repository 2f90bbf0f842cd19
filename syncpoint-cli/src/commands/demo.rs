//! Run the full pairing lifecycle against a simulated server.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use syncpoint_client::{
    ClientConfig, ClientEvent, InstallResult, MemoryStore, OAuthToken, ServerSimulator,
    SyncpointClient, TokenAuthenticator,
};

/// How long to wait for the next client event or install before giving up.
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for the demo command.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Token to pair with.
    pub token: String,
    /// Token type.
    pub token_type: String,
    /// Channels to install.
    pub channels: Vec<String>,
    /// User id the simulated server assigns.
    pub user_id: String,
}

/// What the demo observed.
#[derive(Debug)]
pub struct DemoSummary {
    /// States entered, in order.
    pub states: Vec<&'static str>,
    /// `(channel name, local database)` for every installed channel.
    pub installed: Vec<(String, String)>,
}

/// Run the demo command.
pub async fn run(config: ClientConfig, options: &DemoOptions) -> Result<DemoSummary> {
    let token = OAuthToken::new(options.token.as_str(), options.token_type.as_str())
        .context("Invalid token")?;

    let store = MemoryStore::new();
    let _server = ServerSimulator::new(store.clone(), &config)
        .context("Invalid configuration")?
        .with_user_id(options.user_id.as_str())
        .start();
    let client = SyncpointClient::start(config, store)
        .await
        .context("Failed to start client")?;
    let mut events = client.events();

    println!("=== syncpoint demo ===");
    println!("State: {}", client.state());

    client.authenticate(Arc::new(TokenAuthenticator::new(token)))?;

    // Requested before the session is ready, so these are deferred
    let mut waiting = Vec::new();
    let mut summary = DemoSummary {
        states: Vec::new(),
        installed: Vec::new(),
    };
    for name in &options.channels {
        match client.install_channel_named(name, None).await? {
            InstallResult::Installed(installation) => {
                println!("Installed {} into {}", name, installation.local_db_name);
                summary
                    .installed
                    .push((name.clone(), installation.local_db_name.to_string()));
            }
            InstallResult::Deferred(pending) | InstallResult::ChannelPending(pending) => {
                println!("Requested {} ({})", name, pending.request_id());
                waiting.push((name.clone(), pending));
            }
        }
    }

    let mut ready = client.state().is_ready();
    while !ready {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .context("Timed out waiting for the client")?
            .context("Client event stream closed")?;

        match event {
            ClientEvent::StateChanged { from, to } => {
                println!("State: {} -> {}", from, to);
                summary.states.push(to.name());
                if to.is_error() {
                    anyhow::bail!("Pairing failed: {}", to);
                }
                ready = to.is_ready();
            }
            ClientEvent::InstallCompleted { .. } => {}
            ClientEvent::InstallationReplicationFailed {
                installation,
                message,
            } => {
                tracing::warn!("Installation {} stopped: {}", installation, message);
            }
            ClientEvent::Error(report) => {
                tracing::warn!("Client error: {}", report);
            }
        }
    }

    for (name, pending) in waiting {
        let installation = tokio::time::timeout(EVENT_TIMEOUT, pending.wait())
            .await
            .with_context(|| format!("Timed out installing {}", name))?
            .with_context(|| format!("Failed to install {}", name))?;
        println!("Installed {} into {}", name, installation.local_db_name);
        summary
            .installed
            .push((name, installation.local_db_name.to_string()));
    }

    let session = client.session();
    println!();
    println!("Ready channels:      {}", session.ready_channels().count().await?);
    println!("Subscriptions:       {}", session.active_subscriptions().count().await?);
    println!("Local installations: {}", session.all_installations().count().await?);

    client.shutdown().await;
    Ok(summary)
}
