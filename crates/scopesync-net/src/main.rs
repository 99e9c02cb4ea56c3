//! ScopeSync loopback demo.
//!
//! Runs a server and one client in-process over a memory hub, exercises reads,
//! writes, middleware rejection and a per-client instance, then logs the
//! replicated state of both sides.

use anyhow::Result;
use scopesync_core::{Actor, Definition, Middleware, ReplicaContext, StateTree};
use scopesync_net::{Coordinator, Mailbox, MemoryHub, Runtime, RuntimeHandle, SyncConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn world() -> Vec<(&'static str, Definition)> {
    vec![
        (
            "Public",
            Definition::public_server(vec![
                ("Round", Definition::leaf(1)),
                ("Health", Definition::leaf(100)),
            ]),
        ),
        (
            "Secret",
            Definition::private_server(vec![("Seed", Definition::leaf(42))]),
        ),
        (
            "Settings",
            Definition::private_client(vec![("Volume", Definition::leaf(0.5))]),
        ),
        (
            "Players",
            Definition::public_client(|_| {
                vec![
                    ("Name".to_string(), Definition::empty_leaf()),
                    ("Score".to_string(), Definition::leaf(0)),
                ]
            }),
        ),
    ]
}

async fn forward(mut mailbox: Mailbox, handle: RuntimeHandle) {
    while let Some(delivery) = mailbox.recv().await {
        if handle.deliver(delivery.from, delivery.payload).await.is_err() {
            break;
        }
    }
}

async fn shutdown(run_for: Duration) {
    tokio::select! {
        () = tokio::time::sleep(run_for) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }
}

fn log_state(side: &str, tree: &StateTree) {
    for (name, key) in tree.roots() {
        tracing::info!(side, root = name, state = %tree.snapshot(key), "Final state");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::from_env()?;
    let client_actor = Actor::Client(config.client_id);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        client = %client_actor,
        tick_ms = config.tick.as_millis(),
        ticks = config.demo_ticks,
        "Starting ScopeSync loopback"
    );

    let hub = MemoryHub::new();
    let server_box = hub.register(Actor::Server);
    let client_box = hub.register(client_actor);

    let mut server = Coordinator::build(world(), ReplicaContext::server())?;
    let health = server.tree().resolve("Public/Health")?;
    server.tree_mut().add_middleware(
        health,
        Middleware::error("non-negative", |_: Option<i64>, new: i64| new >= 0),
    )?;
    let client = Coordinator::build(world(), ReplicaContext::client(config.client_id))?;

    let (server_rt, server_handle) = Runtime::new(server, hub.transport(Actor::Server), &config);
    let (client_rt, client_handle) = Runtime::new(client, hub.transport(client_actor), &config);

    let run_for = config.tick * config.demo_ticks.max(8);
    let server_task = tokio::spawn(server_rt.run(shutdown(run_for)));
    let client_task = tokio::spawn(client_rt.run(shutdown(run_for)));
    tokio::spawn(forward(server_box, server_handle.clone()));
    tokio::spawn(forward(client_box, client_handle.clone()));

    server_handle.connect(client_actor).await?;
    client_handle.connect(Actor::Server).await?;

    // Client reads mirror state and follows the players vine.
    client_handle
        .apply(|c| -> Result<()> {
            let tree = c.tree_mut();
            let health = tree.resolve("Public/Health")?;
            let pending = tree.get(health)?;
            tokio::spawn(async move {
                match pending.await {
                    Ok(value) => tracing::info!(%value, "Client read Public/Health"),
                    Err(e) => tracing::warn!(error = %e, "Client read failed"),
                }
            });
            let players = tree.resolve("Players")?;
            tree.subscribe_vine(players, |event| {
                tracing::info!(?event, "Client saw players change");
            })?;
            tree.subscribe(health, |value| {
                tracing::info!(%value, "Client observed Public/Health");
            })?;
            Ok(())
        })
        .await??;

    tokio::time::sleep(config.tick * 3).await;

    // Server writes, one of which the middleware rejects.
    server_handle
        .apply(|c| -> Result<()> {
            let tree = c.tree_mut();
            let health = tree.resolve("Public/Health")?;
            let rejected = tree.set(health, serde_json::json!(-5))?;
            tracing::info!(?rejected, "Server set Public/Health to -5");
            let applied = tree.set(health, serde_json::json!(250))?;
            tracing::info!(?applied, "Server set Public/Health to 250");
            Ok(())
        })
        .await??;

    tokio::time::sleep(config.tick * 3).await;

    // Client names its own player entry.
    client_handle
        .apply(move |c| -> Result<()> {
            let tree = c.tree_mut();
            let players = tree.resolve("Players")?;
            let Some(instance) = tree.instance_owned_by(players, &client_actor) else {
                tracing::warn!("Client instance not replicated yet");
                return Ok(());
            };
            let name = tree.resolve(format!("Players/[{instance}]/Name").as_str())?;
            let outcome = tree.set(name, serde_json::json!("loopback"))?;
            tracing::info!(?outcome, "Client set its name");
            Ok(())
        })
        .await??;

    let server = server_task.await?;
    let client = client_task.await?;
    log_state("server", server.tree());
    log_state("client", client.tree());

    tracing::info!("Loopback finished");
    Ok(())
}
