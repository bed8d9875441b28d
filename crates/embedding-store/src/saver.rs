use crate::error::Result;
use crate::persist::write_atomic;
use crate::store::{StoreInner, SAVE_DEBOUNCE};
use std::sync::Weak;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

pub(crate) enum SaverCommand {
    /// State changed; arm (or re-arm) the debounce timer.
    Mutated,
    /// Write now and acknowledge.
    Flush(oneshot::Sender<Result<()>>),
}

/// The single writer for the store file. Holds only a `Weak` so that
/// dropping every `EmbeddingStore` handle closes the channel and ends the
/// task.
pub(crate) fn spawn_saver(inner: Weak<StoreInner>, mut rx: mpsc::Receiver<SaverCommand>) {
    tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SaverCommand::Mutated) => {
                        deadline = Some(Instant::now() + SAVE_DEBOUNCE);
                    }
                    Some(SaverCommand::Flush(ack)) => {
                        deadline = None;
                        let _ = ack.send(save_now(&inner).await);
                    }
                    None => break,
                },
                () = async {
                    if let Some(at) = deadline {
                        sleep_until(at).await;
                    }
                }, if deadline.is_some() => {
                    deadline = None;
                    if let Err(err) = save_now(&inner).await {
                        log::warn!("debounced embedding store save failed: {err}");
                    }
                }
            }
        }
    });
}

async fn save_now(inner: &Weak<StoreInner>) -> Result<()> {
    let Some(inner) = inner.upgrade() else {
        return Ok(());
    };
    let bytes = inner.encode_snapshot()?;
    write_atomic(inner.path(), &bytes).await?;
    log::debug!(
        "saved embedding store ({} bytes) to {}",
        bytes.len(),
        inner.path().display()
    );
    Ok(())
}
