//! Serialized GATT writes with bounded retry on transient busyness.
//!
//! Many host stacks reject overlapping GATT operations with an "operation
//! in progress" error, so every write goes through [`WriteQueue::submit`]
//! and is awaited before the next one is issued.

use std::time::Duration;

use uuid::Uuid;

use crate::error::Error;
use crate::transport::{DfuTransport, WriteKind};

const MAX_ATTEMPTS: u32 = 15;
const RETRY_SPACING: Duration = Duration::from_millis(150);

#[derive(Debug, Default)]
pub struct WriteQueue {
    busy_retries: u64,
}

impl WriteQueue {
    /// Issue one write, retrying busy responses up to the attempt budget.
    ///
    /// Non-busy failures propagate immediately; link loss maps to
    /// [`Error::Disconnected`].
    pub async fn submit<T: DfuTransport>(
        &mut self,
        transport: &mut T,
        characteristic: Uuid,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), Error> {
        for attempt in 1..=MAX_ATTEMPTS {
            match transport.write(characteristic, value, kind).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_busy() => {
                    self.busy_retries += 1;
                    tracing::debug!(attempt, "transport busy, retrying write");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_SPACING).await;
                    }
                }
                Err(e) if e.is_disconnected() => return Err(Error::Disconnected),
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Err(Error::TransportBusy)
    }

    /// Number of busy retries since the last [`reset`](Self::reset).
    pub fn busy_retries(&self) -> u64 {
        self.busy_retries
    }

    /// Restore the idle state after an aborted transfer attempt.
    pub fn reset(&mut self) {
        self.busy_retries = 0;
    }
}
