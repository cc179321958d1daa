use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::tunnelgate::{
    net,
    relay::{self, cipher::CipherMode},
};

/// How a relay treats bytes flowing from the accepted client to the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Raw,
    /// Client bytes are sealed before reaching the upstream.
    Encrypt,
    /// Client bytes are framed ciphertext and are opened for the upstream.
    Decrypt,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayMode::Raw => "raw",
            RelayMode::Encrypt => "encrypt",
            RelayMode::Decrypt => "decrypt",
        })
    }
}

impl FromStr for RelayMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "raw" => Ok(RelayMode::Raw),
            "encrypt" => Ok(RelayMode::Encrypt),
            "decrypt" => Ok(RelayMode::Decrypt),
            _ => anyhow::bail!("relay: unknown mode {s:?} (expected raw|encrypt|decrypt)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub listen_addr: String,
    pub upstream: String,
    pub mode: RelayMode,
    pub crypt_key: String,
    pub cipher: CipherMode,
    pub dial_timeout: Duration,
}

pub async fn serve_with_shutdown(
    opts: RelayOptions,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(&opts.listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind relay {}", opts.listen_addr))?;
    serve(ln, opts, shutdown).await
}

pub async fn serve(
    ln: TcpListener,
    opts: RelayOptions,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(
        listen_addr = %opts.listen_addr,
        upstream = %opts.upstream,
        mode = %opts.mode,
        "relay: listening"
    );
    let opts = Arc::new(opts);

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = res?;
                let opts = opts.clone();
                tokio::spawn(async move {
                    tracing::debug!(client = %peer, "relay: accepted");
                    if let Err(err) = handle_conn(conn, &opts).await {
                        tracing::debug!(client = %peer, err = %err, "relay: connection ended");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_conn(conn: TcpStream, opts: &RelayOptions) -> anyhow::Result<()> {
    let upstream = dial(&opts.upstream, opts.dial_timeout).await?;
    let _ = conn.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    let key = opts.crypt_key.as_bytes();
    match opts.mode {
        RelayMode::Raw => relay::join(conn, upstream).await,
        RelayMode::Encrypt => relay::join_encrypted(conn, upstream, key, opts.cipher).await?,
        RelayMode::Decrypt => relay::join_encrypted(upstream, conn, key, opts.cipher).await?,
    }
    Ok(())
}

async fn dial(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let c = if timeout > Duration::ZERO {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))??
    } else {
        TcpStream::connect(addr).await?
    };
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(3);

    async fn echo_server() -> std::net::SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut c, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = c.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    async fn start_relay(upstream: std::net::SocketAddr, mode: RelayMode, key: &str) -> (std::net::SocketAddr, watch::Sender<bool>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let opts = RelayOptions {
            listen_addr: addr.to_string(),
            upstream: upstream.to_string(),
            mode,
            crypt_key: key.into(),
            cipher: CipherMode::Aes256Gcm,
            dial_timeout: Duration::from_secs(1),
        };
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { serve(ln, opts, rx).await });
        (addr, tx)
    }

    #[tokio::test]
    async fn raw_relay_echoes() {
        let echo = echo_server().await;
        let (relay, _stop) = start_relay(echo, RelayMode::Raw, "").await;

        let mut c = TcpStream::connect(relay).await.unwrap();
        c.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(WAIT, c.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_relays_are_transparent() {
        // client -> [encrypt] -> [decrypt] -> echo
        let echo = echo_server().await;
        let (outer, _s1) = start_relay(echo, RelayMode::Decrypt, "k3y").await;
        let (inner, _s2) = start_relay(outer, RelayMode::Encrypt, "k3y").await;

        let mut c = TcpStream::connect(inner).await.unwrap();
        let payload = vec![0xa5u8; 50_000];
        c.write_all(&payload).await.unwrap();
        let mut got = vec![0u8; payload.len()];
        tokio::time::timeout(WAIT, c.read_exact(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let echo = echo_server().await;
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let opts = RelayOptions {
            listen_addr: "127.0.0.1:0".into(),
            upstream: echo.to_string(),
            mode: RelayMode::Raw,
            crypt_key: String::new(),
            cipher: CipherMode::Aes128Gcm,
            dial_timeout: Duration::ZERO,
        };
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { serve(ln, opts, rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("".parse::<RelayMode>().unwrap(), RelayMode::Raw);
        assert_eq!("Encrypt".parse::<RelayMode>().unwrap(), RelayMode::Encrypt);
        assert_eq!("decrypt".parse::<RelayMode>().unwrap(), RelayMode::Decrypt);
        assert!("rot13".parse::<RelayMode>().is_err());
    }
}
