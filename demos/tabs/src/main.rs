//! Three simulated tabs sharing one in-memory channel.
//!
//! Run with: cargo run -p tabs-demo
//!
//! Set `TABSYNC_CONFIG` to a JSON client config to override the defaults,
//! e.g. `{"prefix": "demo", "election": {"electionDelayMs": 50}}`.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use futures::StreamExt;
use tabsync_client::{ClientConfig, ClientEvent, CrossTabClient};
use tabsync_core::{Action, LoopbackNode, MemoryChannel, Meta, SharedChannel, SyncNode};
use tabsync_leader::{ElectionConfig, Role};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_config() -> anyhow::Result<ClientConfig> {
    let Ok(raw) = std::env::var("TABSYNC_CONFIG") else {
        return Ok(ClientConfig::for_user("demo").with_election(
            ElectionConfig::default()
                .with_election_delay(Duration::from_millis(100))
                .with_leader_ping(Duration::from_millis(200))
                .with_leader_timeout(Duration::from_millis(500))
                .with_role_timeout(Duration::from_millis(300)),
        ));
    };
    let config: ClientConfig = serde_json::from_str(&raw).context("TABSYNC_CONFIG is not a valid config")?;
    config.validate()?;
    Ok(config)
}

fn open_tab(config: &ClientConfig, bus: &Arc<MemoryChannel>) -> anyhow::Result<CrossTabClient> {
    let node: Arc<dyn SyncNode> = Arc::new(LoopbackNode::new());
    let client = CrossTabClient::builder(config.clone(), Arc::clone(bus) as Arc<dyn SharedChannel>, node)
        .start()?;

    let id = client.id().clone();
    let mut events = client.event_stream();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                ClientEvent::Role(role) => tracing::info!(tab = %id, %role, "role"),
                ClientEvent::State(state) => tracing::info!(tab = %id, %state, "state"),
                ClientEvent::Add { action, .. } => tracing::info!(tab = %id, action = %action.kind, "add"),
                ClientEvent::Clean { action, .. } => tracing::info!(tab = %id, action = %action.kind, "clean"),
                ClientEvent::User(user) => tracing::info!(tab = %id, %user, "user"),
                ClientEvent::Error(report) => tracing::warn!(tab = %id, %report, "error"),
            }
        }
    });
    Ok(client)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let settle = config.election.election_delay * 3;
    let bus = Arc::new(MemoryChannel::new());

    let mut tabs = Vec::new();
    for _ in 0..3 {
        tabs.push(open_tab(&config, &bus)?);
    }
    tokio::time::sleep(settle).await;

    let leader = tabs
        .iter()
        .position(|t| t.role() == Role::Leader)
        .context("no leader elected")?;
    let follower = (leader + 1) % tabs.len();
    tracing::info!(leader = %tabs[leader].id(), "Election finished");

    tabs[follower]
        .add(Action::new("counter/increment"), Meta::new().synced())
        .await?;
    tabs[follower]
        .subscribe("counters", serde_json::Map::new())
        .await?;
    tokio::time::sleep(settle).await;

    tracing::info!(tab = %tabs[leader].id(), "Closing leader tab");
    let old = tabs.remove(leader);
    old.prepare_unload()?;
    old.destroy().await;

    let new_leader = tokio::time::timeout(config.election.leader_timeout * 4, async {
        loop {
            if let Some(next) = tabs.iter().find(|t| t.role() == Role::Leader) {
                return next.id().clone();
            }
            tokio::time::sleep(config.election.election_delay).await;
        }
    })
    .await
    .context("no new leader elected")?;
    tracing::info!(leader = %new_leader, "New leader took over");

    for tab in &tabs {
        let subscriptions = tab.subscriptions().await?;
        tracing::info!(
            tab = %tab.id(),
            subscriptions = subscriptions.len(),
            entries = tab.log().entries().len(),
            "Final view"
        );
        tab.destroy().await;
    }
    Ok(())
}
