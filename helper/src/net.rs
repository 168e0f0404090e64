//! Line framing over a TCP stream.

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::error::{Result, SyncError};

/// Lines a connection may have queued but not yet written.
pub const OUTBOUND_QUEUE: usize = 32;

/// Outbound handle: each queued string is written as one line.
pub type LineSender = mpsc::Sender<String>;

/// Queue `line` without waiting. A peer that stopped reading fills its queue and
/// gets `QueueFull` instead of growing it.
pub fn queue_line(tx: &LineSender, line: String, peer: &str) -> Result<()> {
    tx.try_send(line).map_err(|e| match e {
        TrySendError::Full(_) => SyncError::QueueFull(peer.to_string()),
        TrySendError::Closed(_) => SyncError::ChannelClosed(peer.to_string()),
    })
}

/// Spawn a task draining `rx` onto `writer`, one line per message, flushing after
/// each. The task ends when every sender is dropped or a write fails; either way the
/// socket is shut down for writing.
pub fn spawn_line_writer(writer: OwnedWriteHalf, peer: String) -> LineSender {
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    tokio::spawn(async move {
        let mut out = BufWriter::new(writer);
        while let Some(line) = rx.recv().await {
            let res = async {
                out.write_all(line.as_bytes()).await?;
                out.write_all(b"\n").await?;
                out.flush().await
            }
            .await;
            if let Err(e) = res {
                debug!(peer = %peer, error = %e, "write failed, closing writer");
                break;
            }
        }
        let _ = out.shutdown().await;
    });
    tx
}
