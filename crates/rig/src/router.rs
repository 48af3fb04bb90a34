//! Matching responses to requests.
//!
//! Every outstanding request has an entry in the pending map, keyed by its
//! request id. An entry is settled exactly once, by whichever happens first:
//! its response arrives, its deadline passes, its abort signal fires, or the
//! connection goes away. Settling removes the entry, so a late response or a
//! second settlement finds nothing and is dropped.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use filigree_protocol::{encode_line, Command, Response};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::error::RequestError;
use crate::reader::LineReader;

/// The process-wide request id counter, shared by every controller so that
/// ids in logs and on the wire never collide.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: AtomicU32,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// The owning side of an abort signal.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires. Never resolves if the handle is dropped unfired.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_abort(signal: Option<&mut AbortSignal>) {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}

type Settle = oneshot::Sender<Result<u32, RequestError>>;

/// A request's claim on its pending entry.
///
/// Dropping it before the request settles takes the entry back out, along
/// with the command if it hasn't been written.
struct Ticket<'a> {
    router: &'a Router,
    id: u32,
    rx: oneshot::Receiver<Result<u32, RequestError>>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        // Closing our end marks our sender, so a newer request that reused
        // the id keeps its entry.
        self.rx.close();
        let mut inner = self.router.lock();
        if inner.pending.get(&self.id).is_some_and(|tx| tx.is_closed()) {
            inner.pending.remove(&self.id);
            inner.outbox.retain(|cmd| cmd.request_id != self.id);
            log::debug!("request {} abandoned before it settled", self.id);
        }
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<u32, Settle>,
    outbox: VecDeque<Command>,
}

/// Per-connection request bookkeeping: the pending map and the outbox.
#[derive(Default)]
pub struct Router {
    inner: Mutex<Inner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    // Nothing panics while holding the lock, but don't let a poisoned lock wedge the rig.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `command` for writing and waits for its response.
    ///
    /// The command's `request_id` is used as-is; callers stamp it from
    /// [`RequestIds`]. Resolves to the response's result field.
    pub async fn send_request(
        &self,
        command: Command,
        timeout: Duration,
        mut abort: Option<AbortSignal>,
    ) -> Result<u32, RequestError> {
        if abort.as_ref().is_some_and(AbortSignal::is_aborted) {
            return Err(RequestError::Aborted);
        }

        let id = command.request_id;
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if let Some(stale) = inner.pending.insert(id, tx) {
                log::warn!("request id {id} reused while still pending");
                let _ = stale.send(Err(RequestError::Aborted));
            }
            inner.outbox.push_back(command);
        }
        let mut ticket = Ticket {
            router: self,
            id,
            rx,
        };

        let deadline = Instant::now() + timeout;
        tokio::select! {
            res = &mut ticket.rx => return res.unwrap_or(Err(RequestError::Disconnected)),
            _ = tokio::time::sleep_until(deadline) => {
                log::warn!("request {id} timed out after {timeout:?}");
                self.withdraw(id);
                self.settle(id, Err(RequestError::TimedOut));
            }
            _ = wait_for_abort(abort.as_mut()) => {
                self.withdraw(id);
                self.settle(id, Err(RequestError::Aborted));
            }
        }
        // Either we just settled it, or a response beat us to it.
        (&mut ticket.rx)
            .await
            .unwrap_or(Err(RequestError::Disconnected))
    }

    /// Hands a decoded response line to whoever is waiting for it.
    ///
    /// Returns false, after logging, if nobody is: that happens legitimately
    /// when the response shows up after its request timed out.
    pub fn dispatch(&self, line: Command) -> bool {
        let resp = Response::from(line);
        let result = if resp.is_ok() {
            Ok(resp.result)
        } else {
            Err(RequestError::Device { code: resp.error })
        };
        if self.settle(resp.request_id, result) {
            true
        } else {
            log::warn!("dropping response to unknown request: {line:?}");
            false
        }
    }

    fn settle(&self, id: u32, result: Result<u32, RequestError>) -> bool {
        let settle = self.lock().pending.remove(&id);
        match settle {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drops a command that hasn't been written yet. One that has stays sent.
    fn withdraw(&self, id: u32) {
        self.lock().outbox.retain(|cmd| cmd.request_id != id);
    }

    /// Rejects every outstanding request and forgets anything not yet written.
    pub fn fail_all(&self, err: RequestError) {
        let pending: Vec<Settle> = {
            let mut inner = self.lock();
            inner.outbox.clear();
            inner.pending.drain().map(|(_, tx)| tx).collect()
        };
        if !pending.is_empty() {
            log::info!("rejecting {} outstanding requests: {err}", pending.len());
        }
        for tx in pending {
            let _ = tx.send(Err(err.clone()));
        }
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn pending_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn outbox_len(&self) -> usize {
        self.lock().outbox.len()
    }

    /// One round of the poll loop: read at most one response, then flush the outbox.
    ///
    /// Reading first means a response that has just arrived is settled
    /// before more requests go out.
    pub async fn poll_once<R, W>(
        &self,
        reader: &mut LineReader<R>,
        writer: &mut W,
        read_timeout: Duration,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Some(line) = reader.read_command(read_timeout).await? {
            log::debug!("<- {line:?}");
            self.dispatch(line);
        }

        loop {
            // Don't hold the lock across the write.
            let next = self.lock().outbox.pop_front();
            let Some(cmd) = next else {
                break;
            };
            let line = encode_line(&cmd);
            log::debug!("-> {}", line.trim_end());
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}
