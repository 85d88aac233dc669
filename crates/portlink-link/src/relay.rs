//! Byte relay for one direction of a proxied connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) const RELAY_BUFFER_SIZE: usize = 8192;

/// One active proxied flow, registered in the owning instance's channel
/// map for as long as at least one relay direction is running.
#[derive(Clone)]
pub(crate) struct Channel {
    /// Client remote-address string, the map key.
    pub peer: String,
    /// Bytes relayed client -> backend.
    pub bytes_received: Arc<AtomicU64>,
    /// Bytes relayed backend -> client.
    pub bytes_sent: Arc<AtomicU64>,
}

impl Channel {
    pub fn new(peer: String) -> Self {
        Self {
            peer,
            bytes_received: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub(crate) type ChannelMap = Arc<Mutex<HashMap<String, Channel>>>;

/// Copy bytes from `src` to `dst` until the source side ends (EOF or
/// error) or the instance is closed. Every chunk is counted on the
/// direction's own counter and the link's cumulative flow counter before
/// the next read. On exit the destination's write half is shut down so
/// TCP half-close propagates to the peer.
pub(crate) async fn relay_direction<R, W>(
    mut src: R,
    mut dst: W,
    counter: Arc<AtomicU64>,
    link_flow: Arc<AtomicU64>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = src.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = dst.write_all(&buf[..n]).await {
                        debug!(error = %err, "relay write failed");
                        break;
                    }
                    counter.fetch_add(n as u64, Ordering::Relaxed);
                    link_flow.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    debug!(error = %err, "relay read failed");
                    break;
                }
            },
        }
    }
    let _ = dst.shutdown().await;
}
