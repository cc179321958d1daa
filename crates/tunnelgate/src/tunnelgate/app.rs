use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::tunnelgate::{
    config::{self, Config},
    gateway::{
        client::{Client, ClientOptions, ForwardSpec},
        registry::ProxyRegistry,
        server::{Server, ServerOptions},
    },
    logging,
    relay::listener::{self, RelayOptions},
    telemetry,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        gateway = cfg.gateway.is_some(),
        client = cfg.client.is_some(),
        relays = cfg.relays.len(),
        "tunnelgate: starting"
    );

    telemetry::init_prometheus(&cfg.metrics_addr)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = spawn_components(&cfg, &shutdown_rx)?;

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            match res {
                Some(Ok(Err(err))) => return Err(err),
                Some(Err(join_err)) => return Err(join_err.into()),
                _ => tracing::info!("shutdown: component finished"),
            }
        }
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting remaining tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn spawn_components(
    cfg: &Config,
    shutdown_rx: &watch::Receiver<bool>,
) -> anyhow::Result<JoinSet<anyhow::Result<()>>> {
    let mut tasks = JoinSet::new();

    if let Some(g) = &cfg.gateway {
        let server = Server::new(ServerOptions {
            listen_addr: g.listen_addr.clone(),
            auth_token: g.auth_token.clone(),
            handshake_timeout: g.handshake_timeout,
            sink_capacity: g.sink_capacity,
            heartbeat_interval: g.heartbeat_interval,
            registry: Arc::new(ProxyRegistry::new()),
        })?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    if let Some(c) = &cfg.client {
        let client = Client::new(ClientOptions {
            server_addr: c.server_addr.clone(),
            auth_token: c.auth_token.clone(),
            dial_timeout: c.dial_timeout,
            forwards: c
                .forwards
                .iter()
                .map(|f| ForwardSpec {
                    address: f.address.clone(),
                    port: f.port,
                    command: f.command.clone(),
                })
                .collect(),
        })?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    for r in &cfg.relays {
        let opts = RelayOptions {
            listen_addr: r.listen_addr.clone(),
            upstream: r.upstream.clone(),
            mode: r.mode,
            crypt_key: r.crypt_key.clone(),
            cipher: r.cipher,
            dial_timeout: r.dial_timeout,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { listener::serve_with_shutdown(opts, shutdown).await });
    }

    Ok(tasks)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
