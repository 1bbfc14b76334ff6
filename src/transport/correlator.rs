// MIT License - Copyright (c) 2026 Peter Wright
// Command/response correlation over the unsolicited message stream

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::error::{ArrowheadError, Result};
use crate::protocol;

/// Which inbound line answers a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMatch {
    /// The next line, whatever it is
    AnyLine,
    /// An `OK...` acknowledgement or an `ERR...` report
    Ack,
    /// A line starting with the given text (e.g. `P74E`), or an error report
    Prefix(String),
}

impl ResponseMatch {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::AnyLine => true,
            Self::Ack => protocol::is_ok(line) || protocol::is_error(line),
            Self::Prefix(prefix) => line.starts_with(prefix.as_str()) || protocol::is_error(line),
        }
    }
}

struct Waiter {
    id: u64,
    matcher: ResponseMatch,
    tx: oneshot::Sender<String>,
}

/// A registered wait for a response. Obtained before the command is written
/// so a fast answer cannot be missed.
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<String>,
}

/// Routes inbound lines to at most one waiting command.
///
/// Each line is also written to a rolling "last line" slot that the login
/// flow watches; it holds only the newest line and never backs up.
pub struct ResponseCorrelator {
    waiter: Mutex<Option<Waiter>>,
    last_line: watch::Sender<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        let (last_line, _) = watch::channel(None);
        Self {
            waiter: Mutex::new(None),
            last_line,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Claim the single waiter slot.
    ///
    /// Fails with `CommandInFlight` while another command is still waiting.
    pub async fn expect(&self, matcher: ResponseMatch) -> Result<PendingResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ArrowheadError::ConnectionClosed);
        }
        let mut slot = self.waiter.lock().await;
        if slot.as_ref().is_some_and(|w| !w.tx.is_closed()) {
            return Err(ArrowheadError::CommandInFlight);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *slot = Some(Waiter { id, matcher, tx });
        Ok(PendingResponse { id, rx })
    }

    /// Wait for the registered response. Frees the slot on timeout.
    pub async fn wait(
        &self,
        pending: PendingResponse,
        limit: Duration,
        command: &str,
    ) -> Result<String> {
        match timeout(limit, pending.rx).await {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(_)) => Err(ArrowheadError::ConnectionClosed),
            Err(_) => {
                self.release(pending.id).await;
                debug!("No response to {} within {:?}", command, limit);
                Err(ArrowheadError::CommandTimeout {
                    command: command.to_string(),
                })
            }
        }
    }

    /// Drop the waiter if it is still the one identified by `id`.
    pub async fn release(&self, id: u64) {
        let mut slot = self.waiter.lock().await;
        if slot.as_ref().is_some_and(|w| w.id == id) {
            *slot = None;
        }
    }

    /// `awaitNext`: the next inbound line within `limit`.
    pub async fn await_next(&self, limit: Duration) -> Result<String> {
        let pending = self.expect(ResponseMatch::AnyLine).await?;
        self.wait(pending, limit, "<next line>").await
    }

    /// Hand one inbound line to the waiting command (if it matches) and to
    /// the last-line slot. Returns true if a command consumed it.
    pub async fn publish(&self, line: &str) -> bool {
        self.last_line.send_replace(Some(line.to_string()));

        let mut slot = self.waiter.lock().await;
        if !slot.as_ref().is_some_and(|w| w.matcher.matches(line)) {
            return false;
        }
        match slot.take() {
            Some(waiter) => waiter.tx.send(line.to_string()).is_ok(),
            None => false,
        }
    }

    /// Receiver for the last-line slot. The current value is still unseen,
    /// so a line that arrived before subscribing is not missed.
    pub fn subscribe_lines(&self) -> watch::Receiver<Option<String>> {
        let mut rx = self.last_line.subscribe();
        rx.mark_changed();
        rx
    }

    /// Fail any pending wait with `ConnectionClosed` and refuse new ones.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.waiter.lock().await.take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Wait on a last-line receiver for a line satisfying `accept`.
///
/// Lines that do not satisfy it are skipped. Returns `None` on timeout or
/// when the connection goes away.
pub async fn wait_for_line<F>(
    lines: &mut watch::Receiver<Option<String>>,
    limit: Duration,
    accept: F,
) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    let search = async {
        loop {
            if lines.changed().await.is_err() {
                return None;
            }
            let current = lines.borrow_and_update().clone();
            if let Some(line) = current
                && accept(&line)
            {
                return Some(line);
            }
        }
    };
    timeout(limit, search).await.ok().flatten()
}
