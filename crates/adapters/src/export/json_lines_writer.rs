use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::channel_exporter::StateEvent;

/// Drain replication events into `out` as JSON, one event per line.
///
/// Runs until the channel closes or `cancel` fires; events still queued at
/// cancellation are flushed first. Returns the number of lines written.
pub async fn write_json_lines<W>(
    mut rx: mpsc::Receiver<StateEvent>,
    mut out: W,
    cancel: CancellationToken,
) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => {
                rx.close();
                match rx.recv().await {
                    Some(event) => event,
                    None => break,
                }
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match serde_json::to_vec(&event) {
            Ok(mut line) => {
                line.push(b'\n');
                out.write_all(&line).await?;
                written += 1;
            }
            Err(e) => warn!("cannot encode state event: {e}"),
        }
    }
    out.flush().await?;
    info!(events = written, "state export writer stopped");
    Ok(written)
}
