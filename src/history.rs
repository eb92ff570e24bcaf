//! Archive fetch serialization and result accumulation.
//!
//! Archive results carry no per-request correlation, so only one fetch may
//! be outstanding per client. The slot lock is taken before the query is
//! sent and is owned by the pending fetch from then on: only the
//! end-of-archive marker, an error reply to the query or connection loss
//! release it. Dropping the `fetch` future does not. Results arriving in
//! between accumulate in a shared buffer.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Message;

type Waiter = oneshot::Sender<Result<Vec<Message>>>;

#[derive(Default)]
struct Pending {
    /// Id of the archive query in flight.
    id: Option<String>,
    buffer: Vec<Message>,
    waiter: Option<Waiter>,
    slot: Option<OwnedMutexGuard<()>>,
}

impl Pending {
    /// End the current fetch, releasing the slot. Returns its waiter and page.
    fn complete(&mut self) -> (Option<Waiter>, Vec<Message>) {
        self.id = None;
        self.slot = None;
        (self.waiter.take(), std::mem::take(&mut self.buffer))
    }
}

pub struct HistoryAggregator {
    slot: Arc<tokio::sync::Mutex<()>>,
    pending: Mutex<Pending>,
}

impl Default for HistoryAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the slot if the query never made it out.
struct Unsent<'a> {
    history: &'a HistoryAggregator,
    id: &'a str,
    armed: bool,
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut pending = self.history.pending();
        if pending.id.as_deref() == Some(self.id) {
            pending.complete();
        }
    }
}

impl HistoryAggregator {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(tokio::sync::Mutex::new(())),
            pending: Mutex::new(Pending::default()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue the archive query `id` through `send` and wait for its complete page.
    ///
    /// Waits until any fetch already in flight has finished before `send`
    /// is called.
    pub async fn fetch<F, Fut>(&self, id: &str, send: F) -> Result<Vec<Message>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let slot = self.slot.clone().lock_owned().await;

        let rx = {
            let mut pending = self.pending();
            let (tx, rx) = oneshot::channel();
            pending.id = Some(id.to_string());
            pending.buffer.clear();
            pending.waiter = Some(tx);
            pending.slot = Some(slot);
            rx
        };

        let mut unsent = Unsent {
            history: self,
            id,
            armed: true,
        };
        send().await?;
        unsent.armed = false;

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Append one archived message to the page being collected.
    pub fn append(&self, message: Message) {
        let mut pending = self.pending();
        if pending.slot.is_none() {
            warn!(id = %message.id, "Archive result without a pending fetch, dropping");
            return;
        }
        pending.buffer.push(message);
    }

    /// End-of-archive marker: hand the collected page to the waiting fetch.
    pub fn finish(&self) {
        let (waiter, page) = self.pending().complete();
        match waiter {
            Some(waiter) => {
                debug!(count = page.len(), "Archive page complete");
                let _ = waiter.send(Ok(page));
            }
            None => debug!("End-of-archive marker without a pending fetch"),
        }
    }

    /// Fail the fetch whose query `id` was answered with an error.
    /// Returns false when no fetch is waiting on `id`.
    pub fn fail(&self, id: &str, condition: &str) -> bool {
        let waiter = {
            let mut pending = self.pending();
            if pending.id.as_deref() != Some(id) {
                return false;
            }
            pending.complete().0
        };
        warn!(id = %id, condition = %condition, "Archive query failed");
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(Error::Query(condition.to_string())));
        }
        true
    }

    /// Fail the pending fetch, if any (connection lost).
    pub fn abort(&self) {
        let (waiter, _) = self.pending().complete();
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.pending().buffer.len()
    }
}
