//! Yamux-multiplexed control transport.
//!
//! ```text
//! client -> server: "TGCT" | u8 version | u32 BE token_len | token
//! server -> client: u8 status (0 ok, 1 unauthorized)
//! ```
//!
//! After the preamble the connection carries a yamux session. Every stream the
//! client opens starts with a one-byte tag: `G` for the global-request stream
//! (the first one wins) and `C` for a data channel.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tokio_yamux::{Config, Control, Session, StreamHandle};

use crate::tunnelgate::gateway::{
    transport::{
        ChannelRequest, ControlSession, DataChannel, GlobalRequest, Handshake, NewChannel,
        TransportError,
    },
    wire::{self, RequestFrame},
};

pub const TAG_GLOBAL: u8 = b'G';
pub const TAG_CHANNEL: u8 = b'C';

const REPLY_SUCCESS: u8 = 1;
const REPLY_FAILURE: u8 = 0;

const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default)]
pub struct HandshakeOptions {
    /// Empty accepts any client.
    pub auth_token: String,
}

/// Byte stream a mux session can run over.
pub trait MuxIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> MuxIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type GlobalSlot = Arc<Mutex<Option<mpsc::Sender<GlobalRequest>>>>;

pub async fn server_handshake<T: MuxIo>(
    mut io: T,
    remote: Option<SocketAddr>,
    opts: &HandshakeOptions,
) -> Result<Handshake, TransportError> {
    let token = read_preamble(&mut io).await?;
    if !opts.auth_token.is_empty() && token != opts.auth_token {
        let _ = io.write_u8(wire::STATUS_UNAUTHORIZED).await;
        let _ = io.flush().await;
        return Err(TransportError::Unauthorized);
    }
    io.write_u8(wire::STATUS_OK).await?;
    io.flush().await?;

    let mut session = Session::new_server(io, Config::default());
    let control = session.control();

    let (global_tx, global_rx) = mpsc::channel::<GlobalRequest>(16);
    let (chan_tx, chan_rx) = mpsc::channel::<Box<dyn NewChannel>>(16);
    let slot: GlobalSlot = Arc::new(Mutex::new(Some(global_tx)));

    let task = tokio::spawn(async move {
        while let Some(next) = session.next().await {
            match next {
                Ok(st) => {
                    tokio::spawn(classify_stream(st, slot.clone(), chan_tx.clone()));
                }
                Err(err) => {
                    tracing::debug!(err = %err, "mux: session ended");
                    break;
                }
            }
        }
        // A session that never opened a global stream still ends the
        // global request stream.
        if let Ok(mut g) = slot.lock() {
            g.take();
        }
    });

    Ok(Handshake {
        session: Arc::new(MuxSession {
            control: tokio::sync::Mutex::new(control),
            remote,
            task,
        }),
        global_requests: global_rx,
        new_channels: chan_rx,
    })
}

async fn read_preamble<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, TransportError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).await?;
    if &magic != wire::MAGIC_PREAMBLE {
        return Err(TransportError::BadMagic);
    }

    let ver = r.read_u8().await?;
    if ver != wire::PROTOCOL_V1 {
        return Err(TransportError::BadVersion(ver));
    }

    let n = r.read_u32().await?;
    if n > wire::MAX_TOKEN_BYTES {
        return Err(wire::WireError::PayloadTooLarge(n).into());
    }
    let mut token = vec![0u8; n as usize];
    r.read_exact(&mut token).await?;
    Ok(String::from_utf8_lossy(&token).into_owned())
}

async fn write_preamble<W: AsyncWrite + Unpin>(w: &mut W, token: &str) -> Result<(), TransportError> {
    let n: u32 = token.len().try_into().unwrap_or(u32::MAX);
    if n > wire::MAX_TOKEN_BYTES {
        return Err(wire::WireError::PayloadTooLarge(n).into());
    }
    w.write_all(wire::MAGIC_PREAMBLE).await?;
    w.write_u8(wire::PROTOCOL_V1).await?;
    w.write_u32(n).await?;
    w.write_all(token.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}

async fn classify_stream(
    mut st: StreamHandle,
    slot: GlobalSlot,
    channels: mpsc::Sender<Box<dyn NewChannel>>,
) {
    let tag = match st.read_u8().await {
        Ok(v) => v,
        Err(err) => {
            tracing::debug!(err = %err, "mux: stream closed before tag");
            return;
        }
    };

    match tag {
        TAG_GLOBAL => {
            let tx = slot.lock().ok().and_then(|mut g| g.take());
            match tx {
                Some(tx) => serve_global_stream(st, tx).await,
                None => tracing::debug!("mux: extra global stream dropped"),
            }
        }
        TAG_CHANNEL => {
            let _ = channels.send(Box::new(MuxNewChannel { stream: st })).await;
        }
        other => tracing::debug!(tag = other, "mux: unknown stream tag"),
    }
}

/// Forwards global requests and writes replies back in request order.
async fn serve_global_stream(mut st: StreamHandle, tx: mpsc::Sender<GlobalRequest>) {
    loop {
        let frame = match wire::read_request(&mut st).await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(err = %err, "mux: global stream read failed");
                break;
            }
        };

        if !frame.want_reply {
            if tx.send(GlobalRequest::no_reply(frame.kind, frame.payload)).await.is_err() {
                break;
            }
            continue;
        }

        let (req, reply) = GlobalRequest::with_reply(frame.kind, frame.payload);
        if tx.send(req).await.is_err() {
            break;
        }
        let ok = reply.await.unwrap_or(false);
        let b = if ok { REPLY_SUCCESS } else { REPLY_FAILURE };
        if st.write_u8(b).await.is_err() || st.flush().await.is_err() {
            break;
        }
    }
}

struct MuxSession {
    control: tokio::sync::Mutex<Control>,
    remote: Option<SocketAddr>,
    task: JoinHandle<()>,
}

#[async_trait]
impl ControlSession for MuxSession {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    async fn close(&self) {
        let mut ctrl = self.control.lock().await;
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, ctrl.close()).await.is_err() {
            tracing::debug!("mux: close drain timed out");
        }
        self.task.abort();
    }
}

struct MuxNewChannel {
    stream: StreamHandle,
}

#[async_trait]
impl NewChannel for MuxNewChannel {
    async fn accept(
        self: Box<Self>,
    ) -> Result<(Arc<dyn DataChannel>, mpsc::Receiver<ChannelRequest>), TransportError> {
        let (mut rd, wr) = tokio::io::split(self.stream);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut forwarding = true;
            loop {
                match wire::read_request(&mut rd).await {
                    Ok(Some(f)) => {
                        // Keep draining once the consumer is gone.
                        if forwarding {
                            let req = ChannelRequest {
                                kind: f.kind,
                                payload: f.payload,
                            };
                            forwarding = tx.send(req).await.is_ok();
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(err = %err, "mux: channel read failed");
                        break;
                    }
                }
            }
        });

        let ch: Arc<dyn DataChannel> = Arc::new(MuxDataChannel {
            wr: tokio::sync::Mutex::new(wr),
        });
        Ok((ch, rx))
    }
}

struct MuxDataChannel {
    wr: tokio::sync::Mutex<WriteHalf<StreamHandle>>,
}

#[async_trait]
impl DataChannel for MuxDataChannel {
    async fn send_request(&self, kind: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut wr = self.wr.lock().await;
        wire::write_request(&mut *wr, kind, false, payload).await?;
        Ok(())
    }
}

/// Client end of the mux transport.
pub struct MuxClient {
    control: tokio::sync::Mutex<Control>,
    global: tokio::sync::Mutex<StreamHandle>,
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl MuxClient {
    pub async fn connect<T: MuxIo>(mut io: T, token: &str) -> Result<Self, TransportError> {
        write_preamble(&mut io, token).await?;
        match io.read_u8().await? {
            wire::STATUS_OK => {}
            wire::STATUS_UNAUTHORIZED => return Err(TransportError::Unauthorized),
            other => return Err(TransportError::Mux(format!("unexpected status {other}"))),
        }

        let mut session = Session::new_client(io, Config::default());
        let mut control = session.control();
        let done = CancellationToken::new();

        let done_task = done.clone();
        let task = tokio::spawn(async move {
            // The server never opens streams; polling keeps the session moving.
            while let Some(next) = session.next().await {
                if next.is_err() {
                    break;
                }
            }
            done_task.cancel();
        });

        let mut global = control
            .open_stream()
            .await
            .map_err(|e| TransportError::Mux(e.to_string()))?;
        global.write_u8(TAG_GLOBAL).await?;
        global.flush().await?;

        Ok(Self {
            control: tokio::sync::Mutex::new(control),
            global: tokio::sync::Mutex::new(global),
            done,
            task,
        })
    }

    /// Sends a global request; `Ok(None)` when no reply was asked for.
    pub async fn global_request(
        &self,
        kind: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<Option<bool>, TransportError> {
        let mut g = self.global.lock().await;
        wire::write_request(&mut *g, kind, want_reply, payload).await?;
        if !want_reply {
            return Ok(None);
        }
        let b = g.read_u8().await?;
        Ok(Some(b == REPLY_SUCCESS))
    }

    pub async fn open_channel(&self) -> Result<ClientChannel, TransportError> {
        let mut st = {
            let mut ctrl = self.control.lock().await;
            ctrl.open_stream()
                .await
                .map_err(|e| TransportError::Mux(e.to_string()))?
        };
        st.write_u8(TAG_CHANNEL).await?;
        st.flush().await?;

        let (rd, wr) = tokio::io::split(st);
        Ok(ClientChannel { rd, wr })
    }

    /// Resolves once the underlying session is gone.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    pub async fn close(&self) {
        let mut ctrl = self.control.lock().await;
        let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, ctrl.close()).await;
        self.task.abort();
        self.done.cancel();
    }
}

pub struct ClientChannel {
    rd: ReadHalf<StreamHandle>,
    wr: WriteHalf<StreamHandle>,
}

impl ClientChannel {
    pub async fn send_request(&mut self, kind: &str, payload: &[u8]) -> Result<(), TransportError> {
        wire::write_request(&mut self.wr, kind, false, payload).await?;
        Ok(())
    }

    /// Next request from the server; `Ok(None)` once the channel closes.
    pub async fn next_request(&mut self) -> Result<Option<RequestFrame>, TransportError> {
        Ok(wire::read_request(&mut self.rd).await?)
    }
}
