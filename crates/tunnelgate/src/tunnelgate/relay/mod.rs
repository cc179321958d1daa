//! Data-plane relay between two live connections.
//!
//! A pipe runs both copy directions concurrently. Whichever direction ends
//! first (EOF or error) cancels the other, both write halves are shut down,
//! and both connections are dropped once the call returns.

pub mod cipher;
pub mod frame;
pub mod listener;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use cipher::{Cipher, CipherError, CipherMode};
use frame::{FrameError, FrameReader};

use crate::tunnelgate::telemetry;

pub const CHUNK_BYTES: usize = 10 * 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Pipes bytes between `a` and `b` until either side closes.
pub async fn join<A, B>(a: A, b: B)
where
    A: RelayStream,
    B: RelayStream,
{
    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let done = CancellationToken::new();

    let (up, down) = tokio::join!(
        finish(copy_raw(a_rd, b_wr, &done), &done),
        finish(copy_raw(b_rd, a_wr, &done), &done),
    );

    for (dir, res) in [("a->b", up), ("b->a", down)] {
        match res {
            Ok(n) => metrics::counter!(telemetry::RELAY_BYTES_TOTAL).increment(n),
            Err(err) => tracing::warn!(dir, err = %err, "relay: join connections error"),
        }
    }
    tracing::debug!("relay: pipe closed");
}

/// Pipes `a` and `b` with `a -> b` encrypted and `b -> a` decrypted.
///
/// Both ciphers are built before any byte moves; a bad key leaves both
/// connections untouched and is returned as [`RelayError::Cipher`].
pub async fn join_encrypted<A, B>(
    a: A,
    b: B,
    key: &[u8],
    mode: CipherMode,
) -> Result<(), RelayError>
where
    A: RelayStream,
    B: RelayStream,
{
    let enc = Cipher::init(key, mode)
        .inspect_err(|err| tracing::error!(err = %err, "relay: init encrypt cipher failed"))?;
    let dec = Cipher::init(key, mode)
        .inspect_err(|err| tracing::error!(err = %err, "relay: init decrypt cipher failed"))?;

    let (a_rd, a_wr) = tokio::io::split(a);
    let (b_rd, b_wr) = tokio::io::split(b);
    let done = CancellationToken::new();

    let (up, down) = tokio::join!(
        finish(encrypt_pipe(a_rd, b_wr, &enc, &done), &done),
        finish(decrypt_pipe(b_rd, a_wr, &dec, &done), &done),
    );
    tracing::debug!(cipher = %mode, "relay: encrypted pipe closed");

    let up = up?;
    let down = down?;
    metrics::counter!(telemetry::RELAY_BYTES_TOTAL).increment(up + down);
    Ok(())
}

/// Runs one direction, then cancels its sibling and shuts down the writer.
async fn finish<F, W, E>(dir: F, done: &CancellationToken) -> Result<u64, E>
where
    F: std::future::Future<Output = (Result<u64, E>, W)>,
    W: AsyncWrite + Unpin,
{
    let (res, mut wr) = dir.await;
    done.cancel();
    let _ = wr.shutdown().await;
    res
}

async fn copy_raw<R, W>(
    mut rd: R,
    mut wr: W,
    done: &CancellationToken,
) -> (std::io::Result<u64>, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut total = 0u64;

    let res = loop {
        let n = tokio::select! {
            _ = done.cancelled() => break Ok(total),
            r = rd.read(&mut buf) => match r {
                Ok(0) => break Ok(total),
                Ok(n) => n,
                Err(err) => break Err(err),
            },
        };
        tokio::select! {
            _ = done.cancelled() => break Ok(total),
            r = wr.write_all(&buf[..n]) => {
                if let Err(err) = r {
                    break Err(err);
                }
            }
        }
        total += n as u64;
    };
    (res, wr)
}

async fn encrypt_pipe<R, W>(
    mut rd: R,
    mut wr: W,
    cipher: &Cipher,
    done: &CancellationToken,
) -> (Result<u64, RelayError>, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let res = encrypt_loop(&mut rd, &mut wr, cipher, done).await;
    if let Err(err) = &res {
        tracing::debug!(err = %err, "relay: encrypt pipe ended");
    }
    (res, wr)
}

async fn encrypt_loop<R, W>(
    rd: &mut R,
    wr: &mut W,
    cipher: &Cipher,
    done: &CancellationToken,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => return Ok(total),
            r = rd.read(&mut buf) => r?,
        };
        if n == 0 {
            return Ok(total);
        }

        let sealed = cipher.encrypt(&buf[..n])?;
        let framed = frame::encode_frame(&sealed);
        tokio::select! {
            _ = done.cancelled() => return Ok(total),
            r = wr.write_all(&framed) => r?,
        }
        total += n as u64;
    }
}

async fn decrypt_pipe<R, W>(
    mut rd: R,
    mut wr: W,
    cipher: &Cipher,
    done: &CancellationToken,
) -> (Result<u64, RelayError>, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let res = decrypt_loop(&mut rd, &mut wr, cipher, done).await;
    if let Err(err) = &res {
        tracing::debug!(err = %err, "relay: decrypt pipe ended");
    }
    (res, wr)
}

async fn decrypt_loop<R, W>(
    rd: &mut R,
    wr: &mut W,
    cipher: &Cipher,
    done: &CancellationToken,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut frames = FrameReader::new();
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => return Ok(total),
            r = rd.read(&mut buf) => r?,
        };
        if n == 0 {
            return Ok(total);
        }

        frames.extend(&buf[..n]);
        while let Some(sealed) = frames.next_frame()? {
            let plain = cipher.decrypt(&sealed)?;
            tokio::select! {
                _ = done.cancelled() => return Ok(total),
                r = wr.write_all(&plain) => r?,
            }
            total += plain.len() as u64;
        }
    }
}
