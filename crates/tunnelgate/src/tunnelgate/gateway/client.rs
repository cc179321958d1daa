use std::time::Duration;

use anyhow::Context;
use tokio::{net::TcpStream, sync::watch, task::JoinSet};

use crate::tunnelgate::gateway::{
    service::REQUEST_TCPIP_FORWARD,
    transport::mux::{ClientChannel, MuxClient},
    wire::{self, ForwardRequest},
};

const SIDEBAND_REQUEST: &str = "exec";

/// One service to expose through the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub address: String,
    pub port: u32,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub auth_token: String,
    pub dial_timeout: Duration,
    pub forwards: Vec<ForwardSpec>,
}

pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("client: server_addr is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        opts.forwards.retain(|f| !f.command.trim().is_empty());
        Ok(Self { opts })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "client: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.opts.server_addr.as_str();
        let conn = tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
            .with_context(|| format!("dial {addr}"))?;
        let _ = conn.set_nodelay(true);

        let client = MuxClient::connect(conn, &self.opts.auth_token)
            .await
            .context("handshake")?;

        let mut channels = JoinSet::new();
        for f in &self.opts.forwards {
            let fwd = ForwardRequest {
                address: f.address.clone(),
                port: f.port,
                ..Default::default()
            };
            let ok = client
                .global_request(REQUEST_TCPIP_FORWARD, true, &fwd.encode())
                .await
                .context("tcpip-forward")?;
            if ok != Some(true) {
                tracing::warn!(address = %f.address, port = f.port, "client: forward refused");
            }

            let mut ch = client.open_channel().await.context("open channel")?;
            ch.send_request(SIDEBAND_REQUEST, &wire::encode_sideband(&f.command))
                .await
                .context("send command")?;
            channels.spawn(watch_channel(ch, f.port));
        }

        tracing::info!(
            server = %self.opts.server_addr,
            forwards = self.opts.forwards.len(),
            "client: connected"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        client.close().await;
                        return Ok(());
                    }
                }
                _ = client.closed() => {
                    anyhow::bail!("client: session closed by gateway");
                }
            }
        }
    }
}

async fn watch_channel(mut ch: ClientChannel, port: u32) {
    loop {
        match ch.next_request().await {
            Ok(Some(req)) => tracing::debug!(port, kind = %req.kind, "client: request from gateway"),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(port, err = %err, "client: channel ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnelgate::gateway::{
        registry::ProxyRegistry,
        server::{Server, ServerOptions},
    };
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(3);

    #[tokio::test]
    async fn registers_forwards_and_stops_on_shutdown() {
        let registry = Arc::new(ProxyRegistry::new());
        let server = Server::new(ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            auth_token: "tok".into(),
            handshake_timeout: Duration::from_secs(5),
            sink_capacity: 4,
            heartbeat_interval: Duration::from_millis(50),
            registry: registry.clone(),
        })
        .unwrap();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (server_stop, server_rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(ln, server_rx).await });

        let client = Client::new(ClientOptions {
            server_addr: addr.to_string(),
            auth_token: "tok".into(),
            dial_timeout: Duration::ZERO,
            forwards: vec![
                ForwardSpec {
                    address: "127.0.0.1".into(),
                    port: 16200,
                    command: "tcp -port 16200".into(),
                },
                ForwardSpec {
                    address: "127.0.0.1".into(),
                    port: 16201,
                    command: "tcp -port 16201".into(),
                },
            ],
        })
        .unwrap();
        let (stop, rx) = watch::channel(false);
        let run = tokio::spawn(async move { client.run(rx).await });

        tokio::time::timeout(WAIT, async {
            while registry.snapshot().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let mut ports: Vec<u32> = registry
            .snapshot()
            .await
            .iter()
            .map(|p| p.config.remote_port)
            .collect();
        ports.sort();
        assert_eq!(ports, vec![16200, 16201]);

        // a few heartbeats pass without dropping the session
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.snapshot().await.len(), 2);

        stop.send(true).unwrap();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();

        tokio::time::timeout(WAIT, async {
            while !registry.snapshot().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let _ = server_stop.send(true);
    }

    #[tokio::test]
    async fn unreachable_gateway_retries_until_shutdown() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        drop(ln);

        let client = Client::new(ClientOptions {
            server_addr: addr.to_string(),
            auth_token: String::new(),
            dial_timeout: Duration::from_millis(200),
            forwards: vec![],
        })
        .unwrap();
        let (stop, rx) = watch::channel(false);
        let run = tokio::spawn(async move { client.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run.is_finished());
        stop.send(true).unwrap();
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn new_requires_a_server_and_drops_empty_commands() {
        assert!(
            Client::new(ClientOptions {
                server_addr: " ".into(),
                auth_token: String::new(),
                dial_timeout: Duration::ZERO,
                forwards: vec![],
            })
            .is_err()
        );

        let c = Client::new(ClientOptions {
            server_addr: "127.0.0.1:2200".into(),
            auth_token: String::new(),
            dial_timeout: Duration::ZERO,
            forwards: vec![ForwardSpec {
                address: "127.0.0.1".into(),
                port: 1,
                command: "  ".into(),
            }],
        })
        .unwrap();
        assert!(c.opts.forwards.is_empty());
        assert_eq!(c.opts.dial_timeout, Duration::from_secs(5));
    }
}
