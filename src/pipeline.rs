use bytes::Bytes;

use crate::command::Command;
use crate::error::Result;
use crate::frame::Reply;
use crate::pool::Pool;

/// Accumulates encoded commands without sending anything, then flushes
/// them as one batch over a single connection and collects one reply per
/// command, in submission order.
///
/// The flush runs on a connection checked out of the pool exclusively for
/// its duration, so no other caller's command can land between the batch's
/// writes and break the reply correlation.
pub struct Pipeline {
    pool: Pool,
    messages: Vec<Bytes>,
}

impl Pipeline {
    pub(crate) fn new(pool: Pool) -> Pipeline {
        Pipeline {
            pool,
            messages: Vec::new(),
        }
    }

    /// Encodes the command and appends it to the batch. Nothing is written
    /// until `send`.
    pub fn add(&mut self, cmd: &Command) -> &mut Pipeline {
        self.messages.push(cmd.encode());
        self
    }

    /// Discards all accumulated commands with no wire effect.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Flushes the batch and waits for every reply. Always resolves with
    /// exactly as many replies as commands were added, in submission
    /// order; server error replies ride inline as `Reply::Error` values
    /// and do not abort the rest of the batch.
    ///
    /// The buffer is cleared whether the flush succeeds or fails, so the
    /// pipeline can be reused for a fresh batch.
    pub async fn send(&mut self) -> Result<Vec<Reply>> {
        let messages = std::mem::take(&mut self.messages);
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.pool.get_exclusive().await?;
        match conn.send_batch(&messages).await {
            Ok(replies) => {
                self.pool.release(conn).await?;
                Ok(replies)
            }
            Err(err) => {
                // The connection is in an unknowable state mid-batch; shut
                // it down rather than hand it back.
                let _ = conn.close().await;
                Err(err)
            }
        }
    }
}
