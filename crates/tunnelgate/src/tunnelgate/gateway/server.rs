use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};

use crate::tunnelgate::{
    gateway::{
        registry::ProxyRegistry,
        service::{Fault, Service, ServiceOptions},
        transport::{
            TransportError,
            mux::{self, HandshakeOptions},
        },
    },
    net,
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub auth_token: String,
    pub handshake_timeout: Duration,
    pub sink_capacity: usize,
    pub heartbeat_interval: Duration,
    pub registry: Arc<ProxyRegistry>,
}

pub struct Server {
    opts: Arc<ServerOptions>,
}

impl Server {
    pub fn new(mut opts: ServerOptions) -> anyhow::Result<Self> {
        if opts.listen_addr.trim().is_empty() {
            anyhow::bail!("gateway: listen_addr is required");
        }
        if opts.handshake_timeout.is_zero() {
            opts.handshake_timeout = Duration::from_secs(10);
        }
        if opts.sink_capacity == 0 {
            opts.sink_capacity = 16;
        }
        Ok(Self {
            opts: Arc::new(opts),
        })
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind gateway {}", self.opts.listen_addr))?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(&self, ln: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(addr = %self.opts.listen_addr, "gateway: listening");

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = res?;
                    let opts = self.opts.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_session(opts, conn, peer, shutdown).await {
                            tracing::warn!(remote = %peer, err = %err, "gateway: session ended with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_session(
    opts: Arc<ServerOptions>,
    conn: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let _ = conn.set_nodelay(true);
    let hs_opts = HandshakeOptions {
        auth_token: opts.auth_token.clone(),
    };
    let hs = tokio::time::timeout(
        opts.handshake_timeout,
        mux::server_handshake(conn, Some(peer), &hs_opts),
    )
    .await
    .map_err(|_| TransportError::Timeout)
    .and_then(|r| r)
    .context("handshake")?;

    let registry = opts.registry.clone();
    let session_id = registry.next_session_id();
    let (sink_tx, mut sink_rx) = mpsc::channel(opts.sink_capacity);
    let (fault_tx, fault_rx) = mpsc::channel(opts.sink_capacity);

    let handle = Service::start(
        hs,
        sink_tx,
        fault_rx,
        ServiceOptions {
            heartbeat_interval: opts.heartbeat_interval,
        },
    );
    tracing::info!(session = %session_id, remote = %peer, "gateway: client connected");

    loop {
        tokio::select! {
            _ = handle.closed() => break,
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    handle.close().await;
                    break;
                }
            }
            cfg = sink_rx.recv() => {
                let Some(cfg) = cfg else {
                    handle.closed().await;
                    break;
                };
                match registry.register(&session_id, cfg.clone()).await {
                    Ok(()) => tracing::info!(
                        session = %session_id,
                        proxy = %cfg.name,
                        backend = %cfg.backend_address,
                        remote_port = cfg.remote_port,
                        "gateway: proxy registered"
                    ),
                    Err(err) => {
                        tracing::warn!(session = %session_id, proxy = %cfg.name, err = %err, "gateway: proxy rejected");
                        let fault = Fault::ProxyFailed {
                            name: cfg.name,
                            reason: err.to_string(),
                        };
                        let _ = fault_tx.send(fault).await;
                    }
                }
            }
        }
    }

    let removed = registry.unregister_session(&session_id).await;
    tracing::info!(session = %session_id, remote = %peer, removed, "gateway: client disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnelgate::gateway::{
        command::ProxyKind,
        registry::ProxySnapshot,
        service::REQUEST_TCPIP_FORWARD,
        transport::mux::{ClientChannel, MuxClient},
        wire::{self, ForwardRequest},
    };
    use tokio::io::AsyncReadExt;

    const WAIT: Duration = Duration::from_secs(3);

    async fn start(token: &str, handshake_timeout: Duration) -> (SocketAddr, Arc<ProxyRegistry>, watch::Sender<bool>) {
        let registry = Arc::new(ProxyRegistry::new());
        let server = Server::new(ServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            auth_token: token.into(),
            handshake_timeout,
            sink_capacity: 4,
            heartbeat_interval: Duration::from_secs(60),
            registry: registry.clone(),
        })
        .unwrap();

        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(ln, rx).await });
        (addr, registry, tx)
    }

    async fn connect(addr: SocketAddr, token: &str) -> MuxClient {
        let c = TcpStream::connect(addr).await.unwrap();
        MuxClient::connect(c, token).await.unwrap()
    }

    async fn expose(client: &MuxClient, address: &str, port: u32, command: &str) -> ClientChannel {
        let fwd = ForwardRequest {
            address: address.into(),
            port,
            ..Default::default()
        };
        let ok = client
            .global_request(REQUEST_TCPIP_FORWARD, true, &fwd.encode())
            .await
            .unwrap();
        assert_eq!(ok, Some(true));

        let mut ch = client.open_channel().await.unwrap();
        ch.send_request("exec", &wire::encode_sideband(command)).await.unwrap();
        ch
    }

    async fn wait_for(registry: &ProxyRegistry, n: usize) -> Vec<ProxySnapshot> {
        tokio::time::timeout(WAIT, async {
            loop {
                let snap = registry.snapshot().await;
                if snap.len() == n {
                    return snap;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn forward_and_command_register_a_proxy_until_disconnect() {
        let (addr, registry, _stop) = start("secret", Duration::from_secs(5)).await;

        let client = connect(addr, "secret").await;
        let _ch = expose(&client, "127.0.0.1", 16000, "tcp -address 127.0.0.1 -port 16000").await;

        let snap = wait_for(&registry, 1).await;
        assert_eq!(snap[0].config.kind, ProxyKind::Tcp);
        assert_eq!(snap[0].config.backend_address, "127.0.0.1");
        assert_eq!(snap[0].config.remote_port, 16000);
        assert!(snap[0].config.name.starts_with("ssh-proxy-127.0.0.1:"));

        client.close().await;
        drop(client);
        wait_for(&registry, 0).await;
    }

    #[tokio::test]
    async fn rejected_proxy_closes_only_the_offending_session() {
        let (addr, registry, _stop) = start("", Duration::from_secs(5)).await;

        let first = connect(addr, "").await;
        let _ch1 = expose(&first, "127.0.0.1", 16001, "tcp").await;
        wait_for(&registry, 1).await;

        let second = connect(addr, "").await;
        let _ch2 = expose(&second, "127.0.0.1", 16001, "tcp").await;
        tokio::time::timeout(WAIT, second.closed()).await.unwrap();

        let snap = wait_for(&registry, 1).await;
        assert_eq!(snap[0].config.remote_port, 16001);
        assert!(tokio::time::timeout(Duration::from_millis(100), first.closed()).await.is_err());
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_after_the_handshake_timeout() {
        let (addr, _registry, _stop) = start("", Duration::from_millis(100)).await;

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_live_sessions() {
        let (addr, _registry, stop) = start("", Duration::from_secs(5)).await;
        let client = connect(addr, "").await;

        stop.send(true).unwrap();
        tokio::time::timeout(WAIT, client.closed()).await.unwrap();
    }
}
