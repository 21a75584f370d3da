//! Multiplexer fanning transactions out to entity-filtered subscribers.

use crate::error::{panic_message, CacheError, Result};
use crate::types::{Columns, Interest, Line, SubscriptionId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

use super::callback::ChangeChannel;

/// Internal subscription state.
#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    interest: Interest,
    channel: Arc<dyn ChangeChannel>,
}

/// The transaction currently holding the exclusive section.
struct OpenTransaction {
    owner: ThreadId,
    /// Subscribers registered when the transaction started.
    subscribers: Vec<Subscription>,
    /// Subscribers that have received at least one event, in order.
    invoked: Vec<SubscriptionId>,
    /// Subscribers dropped during this transaction.
    failed: HashSet<SubscriptionId>,
}

enum TxState {
    Idle,
    Open(OpenTransaction),
}

struct Inner {
    state: TxState,
    subscriptions: Vec<Subscription>,
}

/// Fans each transaction out to the subscribers interested in the
/// entities it touches.
///
/// `start` takes an exclusive section that lasts until `finish` or
/// `cancel`. While it is held, other threads calling `start`,
/// `subscribe` or `unsubscribe` block, so at most one transaction is open
/// and the subscriber set is stable throughout it. Calling any of those
/// from the owning thread is a protocol violation rather than a deadlock.
///
/// A subscriber only hears about a transaction once an event for an
/// entity it is interested in arrives; it then receives `start`
/// followed by that event, and later `finish` or `cancel`. A subscriber
/// that fails is unsubscribed, sent `cancel`, and skipped for the rest of
/// the transaction. The remaining subscribers are unaffected. A subscriber
/// that panics counts as failed, so it cannot leave the section held.
pub struct Multiplexer {
    inner: Mutex<Inner>,
    /// Signalled whenever the state returns to idle.
    idle: Condvar,
    next_id: AtomicU64,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TxState::Idle,
                subscriptions: Vec::new(),
            }),
            idle: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. Blocks while another thread's transaction is open.
    pub fn subscribe(
        &self,
        interest: Interest,
        channel: Arc<dyn ChangeChannel>,
    ) -> Result<SubscriptionId> {
        let mut inner = self.wait_idle("subscribe")?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        inner.subscriptions.push(Subscription {
            id,
            interest,
            channel,
        });
        info!("Registered subscription {:?}", id);
        Ok(id)
    }

    /// Register a subscriber after running `replay` against it while
    /// holding the exclusive section, so that no transaction can slip in
    /// between the replayed state and the first live update.
    pub fn subscribe_with<F>(
        &self,
        interest: Interest,
        channel: Arc<dyn ChangeChannel>,
        replay: F,
    ) -> Result<SubscriptionId>
    where
        F: FnOnce(&dyn ChangeChannel) -> Result<()>,
    {
        {
            let mut inner = self.wait_idle("subscribe")?;
            inner.state = TxState::Open(OpenTransaction {
                owner: thread::current().id(),
                subscribers: Vec::new(),
                invoked: Vec::new(),
                failed: HashSet::new(),
            });
        }
        let section = SectionGuard { mux: self };

        replay(&*channel)?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        section.release_with(|inner| {
            inner.subscriptions.push(Subscription {
                id,
                interest,
                channel,
            })
        });
        info!("Registered subscription {:?} after replay", id);
        Ok(id)
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let mut inner = self.wait_idle("unsubscribe")?;
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s.id != id);
        let removed = inner.subscriptions.len() != before;
        if removed {
            info!("Removed subscription {:?}", id);
        }
        Ok(removed)
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Whether a transaction currently holds the exclusive section.
    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, TxState::Open(_))
    }

    /// Lock and wait until no other thread holds the exclusive section.
    fn wait_idle(&self, operation: &str) -> Result<MutexGuard<'_, Inner>> {
        let me = thread::current().id();
        let mut inner = self.inner.lock();
        loop {
            match &inner.state {
                TxState::Idle => return Ok(inner),
                TxState::Open(tx) if tx.owner == me => {
                    return Err(CacheError::ProtocolViolation(format!(
                        "{}() called while this thread has a transaction open",
                        operation
                    )))
                }
                TxState::Open(_) => self.idle.wait(&mut inner),
            }
        }
    }

    /// Pick the subscribers for an entity-scoped event, marking them invoked.
    /// The flag says whether the subscriber still needs `start`.
    fn targets(&self, entity: &str) -> Result<Vec<(Subscription, bool)>> {
        let mut inner = self.inner.lock();
        let tx = Self::owned_transaction(&mut inner)?;

        let mut targets = Vec::new();
        for sub in &tx.subscribers {
            if tx.failed.contains(&sub.id) || !sub.interest.covers(entity) {
                continue;
            }
            let first = !tx.invoked.contains(&sub.id);
            if first {
                tx.invoked.push(sub.id);
            }
            targets.push((sub.clone(), first));
        }
        Ok(targets)
    }

    fn owned_transaction(inner: &mut Inner) -> Result<&mut OpenTransaction> {
        match &mut inner.state {
            TxState::Open(tx) if tx.owner == thread::current().id() => Ok(tx),
            TxState::Open(_) => Err(CacheError::ProtocolViolation(
                "event from a thread that does not own the open transaction".into(),
            )),
            TxState::Idle => Err(CacheError::ProtocolViolation(
                "event received outside a transaction".into(),
            )),
        }
    }

    fn deliver<F>(&self, entity: &str, event: F) -> Result<()>
    where
        F: Fn(&dyn ChangeChannel) -> Result<()>,
    {
        for (sub, first) in self.targets(entity)? {
            let result = if first {
                Self::invoke(&sub, |ch| ch.start().and_then(|_| event(ch)))
            } else {
                Self::invoke(&sub, &event)
            };
            if let Err(e) = result {
                self.drop_subscriber(&sub, e, true);
            }
        }
        Ok(())
    }

    /// Call into a subscriber, turning a panic into an error.
    fn invoke<F>(sub: &Subscription, call: F) -> Result<()>
    where
        F: FnOnce(&dyn ChangeChannel) -> Result<()>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| call(&*sub.channel))) {
            Ok(result) => result,
            Err(payload) => Err(CacheError::Panicked(panic_message(&*payload))),
        }
    }

    /// Unsubscribe a failed subscriber and tell it to cancel.
    fn drop_subscriber(&self, sub: &Subscription, error: CacheError, send_cancel: bool) {
        {
            let mut inner = self.inner.lock();
            inner.subscriptions.retain(|s| s.id != sub.id);
            if let TxState::Open(tx) = &mut inner.state {
                tx.failed.insert(sub.id);
            }
        }

        let failure = CacheError::Subscriber {
            id: sub.id,
            source: Box::new(error),
        };
        warn!("Unsubscribing after delivery failure: {}", failure);

        if send_cancel {
            if let Err(e) = Self::invoke(sub, |ch| ch.cancel()) {
                warn!("Subscriber {:?} also failed to cancel: {}", sub.id, e);
            }
        }
    }

    /// Subscribers that must hear `finish`/`cancel`.
    fn completion_targets(&self) -> Result<Vec<Subscription>> {
        let mut inner = self.inner.lock();
        let tx = Self::owned_transaction(&mut inner)?;
        Ok(tx
            .invoked
            .iter()
            .filter(|id| !tx.failed.contains(id))
            .filter_map(|id| tx.subscribers.iter().find(|s| s.id == *id).cloned())
            .collect())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = TxState::Idle;
        self.idle.notify_all();
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeChannel for Multiplexer {
    fn start(&self) -> Result<()> {
        let mut inner = self.wait_idle("start")?;
        let subscribers = inner.subscriptions.clone();
        debug!("Opening transaction for {} subscribers", subscribers.len());
        inner.state = TxState::Open(OpenTransaction {
            owner: thread::current().id(),
            subscribers,
            invoked: Vec::new(),
            failed: HashSet::new(),
        });
        Ok(())
    }

    fn start_bulk(&self, entity: &str, columns: &Columns) -> Result<()> {
        self.deliver(entity, |ch| ch.start_bulk(entity, columns))
    }

    fn start_group_bulk(&self, entity: &str, group: &str, key: &str) -> Result<()> {
        self.deliver(entity, |ch| ch.start_group_bulk(entity, group, key))
    }

    fn start_block(&self, entity: &str, columns: &Columns) -> Result<()> {
        self.deliver(entity, |ch| ch.start_block(entity, columns))
    }

    fn process_update(&self, entity: &str, columns: &Columns, line: &Line) -> Result<()> {
        self.deliver(entity, |ch| ch.process_update(entity, columns, line))
    }

    fn process_remove(&self, entity: &str, id: &str) -> Result<()> {
        self.deliver(entity, |ch| ch.process_remove(entity, id))
    }

    fn finish(&self) -> Result<()> {
        let targets = self.completion_targets()?;
        for sub in &targets {
            if let Err(e) = Self::invoke(sub, |ch| ch.finish()) {
                self.drop_subscriber(sub, e, true);
            }
        }
        debug!("Transaction finished for {} subscribers", targets.len());
        self.close();
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        let targets = self.completion_targets()?;
        for sub in &targets {
            if let Err(e) = Self::invoke(sub, |ch| ch.cancel()) {
                self.drop_subscriber(sub, e, false);
            }
        }
        debug!("Transaction cancelled for {} subscribers", targets.len());
        self.close();
        Ok(())
    }
}

/// Returns the multiplexer to idle when dropped, even on early return.
struct SectionGuard<'a> {
    mux: &'a Multiplexer,
}

impl SectionGuard<'_> {
    fn release_with<F: FnOnce(&mut Inner)>(self, f: F) {
        {
            let mut inner = self.mux.inner.lock();
            f(&mut inner);
        }
        drop(self);
    }
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.mux.close();
    }
}
