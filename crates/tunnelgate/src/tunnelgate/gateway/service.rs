//! Per-session control-channel service.
//!
//! A session runs four cooperating tasks:
//! - the global-request reader, which turns `tcpip-forward` requests into
//!   [`ForwardRequest`]s,
//! - the channel-accept loop, which starts a heartbeat and a sideband reader
//!   for every data channel,
//! - the pairing loop, which joins one forward request with one extra command
//!   and emits a [`ProxyConfig`] into the sink,
//! - the fault drain, which closes the session when a proxy fails.
//!
//! Every blocking handoff races the session's shutdown token, so a close from
//! any task unblocks all of them.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tunnelgate::{
    gateway::{
        command::{self, ExtraCommand, ProxyKind},
        transport::{ChannelRequest, ControlSession, DataChannel, GlobalRequest, Handshake, NewChannel},
        wire::{self, ForwardRequest, Sideband},
    },
    telemetry,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub const REQUEST_TCPIP_FORWARD: &str = "tcpip-forward";
pub const REQUEST_KEEPALIVE: &str = "keepalive@openssh.com";
pub const REQUEST_HEARTBEAT: &str = "heartbeat";

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub heartbeat_interval: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Proxy record handed to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub name: String,
    pub kind: ProxyKind,
    pub backend_address: String,
    pub remote_port: u32,
}

/// Signals the sink consumer sends back to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A proxy emitted by this session could not be started. Closes the session.
    ProxyFailed { name: String, reason: String },
    /// Informational; ignored.
    Notice { message: String },
}

static LAST_NAME_NANOS: AtomicU64 = AtomicU64::new(0);

/// Wall-clock nanoseconds, strictly increasing across calls in this process.
fn unique_nanos() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    let prev = LAST_NAME_NANOS
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
            Some(now.max(last.saturating_add(1)))
        })
        .unwrap_or_else(|last| last);
    now.max(prev.saturating_add(1))
}

pub fn proxy_name(remote: &str) -> String {
    format!("ssh-proxy-{remote}-{}", unique_nanos())
}

struct Inner {
    session: Arc<dyn ControlSession>,
    remote: String,
    closing: AtomicBool,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl Inner {
    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.cancel();
        self.session.close().await;
        self.closed.cancel();

        metrics::gauge!(telemetry::ACTIVE_SESSIONS).decrement(1.0);
        tracing::info!(remote = %self.remote, "gateway: session closed");
    }
}

/// Handle to a running session. Clones share the session.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<Inner>,
}

impl ServiceHandle {
    /// Closes the session. Only the first caller runs teardown; later and
    /// concurrent callers return at once.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Resolves once teardown has finished.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

pub struct Service;

impl Service {
    pub fn start(
        handshake: Handshake,
        sink: mpsc::Sender<ProxyConfig>,
        faults: mpsc::Receiver<Fault>,
        opts: ServiceOptions,
    ) -> ServiceHandle {
        let Handshake {
            session,
            global_requests,
            new_channels,
        } = handshake;

        let remote = session
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let inner = Arc::new(Inner {
            session,
            remote,
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        });

        metrics::counter!(telemetry::SESSIONS_TOTAL).increment(1);
        metrics::gauge!(telemetry::ACTIVE_SESSIONS).increment(1.0);
        tracing::info!(remote = %inner.remote, "gateway: session started");

        let (forward_tx, forward_rx) = mpsc::channel::<ForwardRequest>(1);
        let (command_tx, command_rx) = mpsc::channel::<ExtraCommand>(1);

        tokio::spawn(read_global_requests(inner.clone(), global_requests, forward_tx));
        tokio::spawn(accept_channels(
            inner.clone(),
            new_channels,
            command_tx,
            opts.heartbeat_interval,
        ));
        tokio::spawn(generate_proxies(inner.clone(), forward_rx, command_rx, sink));
        tokio::spawn(drain_faults(inner.clone(), faults));

        ServiceHandle { inner }
    }
}

async fn recv_or_cancel<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        v = rx.recv() => v,
    }
}

async fn read_global_requests(
    inner: Arc<Inner>,
    mut requests: mpsc::Receiver<GlobalRequest>,
    forwards: mpsc::Sender<ForwardRequest>,
) {
    loop {
        let mut req = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            req = requests.recv() => match req {
                Some(r) => r,
                None => {
                    tracing::info!(remote = %inner.remote, "gateway: global request stream closed");
                    inner.close().await;
                    return;
                }
            },
        };

        match req.kind.as_str() {
            REQUEST_TCPIP_FORWARD => {
                let fwd = match ForwardRequest::decode(&req.payload) {
                    Ok(f) => f,
                    Err(err) => {
                        tracing::error!(remote = %inner.remote, err = %err, "gateway: decode tcpip-forward failed");
                        inner.close().await;
                        return;
                    }
                };
                tracing::debug!(
                    remote = %inner.remote,
                    address = %fwd.address,
                    port = fwd.port,
                    "gateway: forward requested"
                );

                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => return,
                    _ = forwards.send(fwd) => {}
                }
            }
            REQUEST_KEEPALIVE => tracing::debug!(remote = %inner.remote, "gateway: keepalive"),
            other => tracing::info!(remote = %inner.remote, kind = %other, "gateway: unhandled global request"),
        }

        if req.want_reply()
            && let Err(err) = req.reply(true)
        {
            tracing::error!(remote = %inner.remote, err = %err, "gateway: reply to global request failed");
        }
    }
}

async fn accept_channels(
    inner: Arc<Inner>,
    mut channels: mpsc::Receiver<Box<dyn NewChannel>>,
    commands: mpsc::Sender<ExtraCommand>,
    heartbeat: Duration,
) {
    loop {
        let Some(nc) = recv_or_cancel(&mut channels, &inner.shutdown).await else {
            tracing::debug!(remote = %inner.remote, "gateway: channel accept loop done");
            return;
        };

        let (ch, requests) = match nc.accept().await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(remote = %inner.remote, err = %err, "gateway: accept channel failed");
                return;
            }
        };

        tokio::spawn(send_heartbeats(inner.clone(), ch, heartbeat));
        tokio::spawn(read_sideband(inner.clone(), requests, commands.clone()));
    }
}

async fn send_heartbeats(inner: Arc<Inner>, ch: Arc<dyn DataChannel>, period: Duration) {
    let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        match ch.send_request(REQUEST_HEARTBEAT, &[]).await {
            Ok(()) => tracing::debug!(remote = %inner.remote, "gateway: heartbeat sent"),
            Err(err) if err.is_eof() => {
                tracing::error!(remote = %inner.remote, err = %err, "gateway: heartbeat peer gone");
                inner.close().await;
                return;
            }
            Err(err) => {
                tracing::error!(remote = %inner.remote, err = %err, "gateway: heartbeat send failed");
            }
        }
    }
}

/// Reads sideband requests until one parses into a command.
async fn read_sideband(
    inner: Arc<Inner>,
    mut requests: mpsc::Receiver<ChannelRequest>,
    commands: mpsc::Sender<ExtraCommand>,
) {
    while let Some(req) = recv_or_cancel(&mut requests, &inner.shutdown).await {
        let text = match wire::decode_sideband(&req.payload) {
            Sideband::TooShort => {
                tracing::debug!(remote = %inner.remote, "gateway: sideband payload too short");
                continue;
            }
            Sideband::Internal => {
                tracing::debug!(remote = %inner.remote, kind = %req.kind, "gateway: transport exchange data");
                continue;
            }
            Sideband::Command(s) => s,
        };

        let parsed = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            r = command::parse_extra_command(&text) => r,
        };
        match parsed {
            Ok(cmd) => {
                tracing::info!(
                    remote = %inner.remote,
                    kind = %cmd.kind,
                    address = %cmd.address,
                    port = cmd.port,
                    "gateway: extra command"
                );
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => {}
                    _ = commands.send(cmd) => {}
                }
                return;
            }
            Err(err) => {
                tracing::warn!(
                    remote = %inner.remote,
                    err = %err,
                    payload = ?req.payload,
                    "gateway: parse extra command failed"
                );
            }
        }
    }
}

async fn generate_proxies(
    inner: Arc<Inner>,
    mut forwards: mpsc::Receiver<ForwardRequest>,
    mut commands: mpsc::Receiver<ExtraCommand>,
    sink: mpsc::Sender<ProxyConfig>,
) {
    loop {
        let (fwd, cmd) = tokio::join!(
            recv_or_cancel(&mut forwards, &inner.shutdown),
            recv_or_cancel(&mut commands, &inner.shutdown),
        );
        if inner.shutdown.is_cancelled() {
            return;
        }
        let (Some(fwd), Some(cmd)) = (fwd, cmd) else {
            tracing::debug!(remote = %inner.remote, "gateway: pairing inputs closed");
            return;
        };

        match cmd.kind {
            ProxyKind::Tcp => {
                let cfg = ProxyConfig {
                    name: proxy_name(&inner.remote),
                    kind: ProxyKind::Tcp,
                    backend_address: fwd.address,
                    remote_port: fwd.port,
                };
                tracing::info!(
                    remote = %inner.remote,
                    proxy = %cfg.name,
                    backend = %cfg.backend_address,
                    remote_port = cfg.remote_port,
                    "gateway: proxy emitted"
                );

                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => return,
                    res = sink.send(cfg) => {
                        if res.is_err() {
                            tracing::warn!(remote = %inner.remote, "gateway: proxy sink closed");
                            continue;
                        }
                    }
                }
                metrics::counter!(telemetry::PROXIES_EMITTED_TOTAL).increment(1);
            }
            ProxyKind::Http => {
                tracing::debug!(remote = %inner.remote, "gateway: http tunnel requested, nothing emitted");
            }
        }
    }
}

async fn drain_faults(inner: Arc<Inner>, mut faults: mpsc::Receiver<Fault>) {
    while let Some(fault) = recv_or_cancel(&mut faults, &inner.shutdown).await {
        match fault {
            Fault::ProxyFailed { name, reason } => {
                tracing::error!(
                    remote = %inner.remote,
                    proxy = %name,
                    reason = %reason,
                    "gateway: proxy failed, closing session"
                );
                inner.close().await;
                return;
            }
            Fault::Notice { message } => {
                tracing::debug!(remote = %inner.remote, message = %message, "gateway: fault notice");
            }
        }
    }
}
