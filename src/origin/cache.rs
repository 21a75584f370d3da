//! The origin-side cache: one live [`EntityCache`] per entity, rebuilt off
//! to the side on full reload and swapped in at commit.

use crate::channel::{text_block, ChangeChannel, Multiplexer, TransactionBuffer};
use crate::codec;
use crate::config::{OriginConfig, UpdateMode};
use crate::error::{CacheError, Result};
use crate::types::{Columns, DiffResult, Interest, Line, SubscriptionId};
use arc_swap::ArcSwap;
use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::differ::{self, Delta};
use super::entity_cache::EntityCache;
use super::outbound::{ChannelSender, OutboundHub, OutboundMessage, OutboundSender};
use super::source::OriginSource;

/// Live pointer to the current cache of one entity.
type Slot = Arc<ArcSwap<EntityCache>>;

/// Server-tier cache of every entity an origin serves.
///
/// Reads go through a per-entity live pointer and never wait for a reload.
/// A full reload replays the origin into a private scratch cache and only
/// repoints the live pointer when the transaction finishes; a cancelled
/// reload leaves the live pointer untouched. Every committed transaction is
/// forwarded to subscribers through the multiplexer and rendered once for
/// the outbound senders.
pub struct OriginCache {
    source: Arc<dyn OriginSource>,
    config: OriginConfig,
    hub: Arc<OutboundHub>,
    mux: Multiplexer,
    slots: RwLock<BTreeMap<String, Slot>>,
    /// Commit counter. Guarded separately so that publishing a swap and
    /// waking waiters never waits on reload work.
    generation: Mutex<u64>,
    swapped: Condvar,
}

impl OriginCache {
    /// Create the cache and load every entity the source serves in one
    /// transaction.
    pub fn open(
        source: Arc<dyn OriginSource>,
        config: OriginConfig,
        hub: Arc<OutboundHub>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Self {
            source,
            config,
            hub,
            mux: Multiplexer::new(),
            slots: RwLock::new(BTreeMap::new()),
            generation: Mutex::new(0),
            swapped: Condvar::new(),
        };
        cache.reload_all()?;
        info!("Opened origin cache with {} entities", cache.entity_ids().len());
        Ok(cache)
    }

    pub fn config(&self) -> &OriginConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<OutboundHub> {
        &self.hub
    }

    /// Register an outbound sender.
    pub fn register_sender(&self, sender: Arc<dyn OutboundSender>) {
        self.hub.register(sender);
    }

    /// Register a queue-backed sender sized by `outbound_buffer` and return
    /// its receiving end.
    pub fn outbound_channel(&self) -> Receiver<OutboundMessage> {
        let (sender, receiver) = ChannelSender::bounded(self.config.outbound_buffer);
        self.hub.register(Arc::new(sender));
        receiver
    }

    // Reads

    pub fn entity_ids(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    /// The live cache of `entity`.
    pub fn entity(&self, entity: &str) -> Result<Arc<EntityCache>> {
        self.slots
            .read()
            .get(entity)
            .map(|slot| slot.load_full())
            .ok_or_else(|| CacheError::UnknownEntity(entity.to_string()))
    }

    pub fn columns(&self, entity: &str) -> Result<Columns> {
        Ok(self.entity(entity)?.columns().clone())
    }

    pub fn line(&self, entity: &str, id: &str) -> Result<Option<Line>> {
        Ok(self.entity(entity)?.get(id))
    }

    pub fn row(&self, entity: &str, id: &str) -> Result<Option<String>> {
        Ok(self.line(entity, id)?.map(|line| line.row))
    }

    /// The whole entity as a wire payload.
    pub fn snapshot_payload(&self, entity: &str) -> Result<String> {
        Ok(self.entity(entity)?.render())
    }

    /// A payload for `ids`: present ids as rows, absent ids as deletions.
    pub fn payload_for<I, S>(&self, entity: &str, ids: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cache = self.entity(entity)?;
        let (present, absent): (BTreeSet<String>, BTreeSet<String>) = ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .partition(|id| cache.get(id).is_some());
        Ok(cache.render_subset(&present, &absent))
    }

    /// Number of transactions committed so far.
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Wait until more than `after` transactions have committed. Returns
    /// false on timeout.
    pub fn wait_for_generation(&self, after: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation <= after {
            if self.swapped.wait_until(&mut generation, deadline).timed_out() {
                return *generation > after;
            }
        }
        true
    }

    // Subscriptions

    /// Register `channel` after replaying the current content of every
    /// entity `interest` covers to it as one full-bulk transaction.
    pub fn subscribe(
        &self,
        interest: Interest,
        channel: Arc<dyn ChangeChannel>,
    ) -> Result<SubscriptionId> {
        let entities: Vec<String> = self
            .entity_ids()
            .into_iter()
            .filter(|e| interest.covers(e))
            .collect();

        self.mux.subscribe_with(interest, channel, |sink| {
            if entities.is_empty() {
                return Ok(());
            }
            sink.start()?;
            let replayed: Result<()> = entities.iter().try_for_each(|entity| {
                let cache = self.entity(entity)?;
                sink.start_bulk(entity, cache.columns())?;
                sink.start_block(entity, cache.columns())?;
                for line in cache.snapshot_all() {
                    sink.process_update(entity, cache.columns(), &line)?;
                }
                Ok(())
            });
            match replayed {
                Ok(()) => sink.finish(),
                Err(e) => {
                    if let Err(cancel_error) = sink.cancel() {
                        warn!("Subscriber failed to cancel snapshot replay: {}", cancel_error);
                    }
                    Err(e)
                }
            }
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.mux.unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.mux.subscription_count()
    }

    // Transactions

    /// A producer-side transaction handle. Trusted producers drive it as a
    /// [`ChangeChannel`], starting with `start`.
    pub fn begin(&self) -> CacheTransaction<'_> {
        CacheTransaction {
            cache: self,
            staging: Mutex::new(None),
            section: AtomicBool::new(false),
        }
    }

    /// Run `f` inside one transaction, cancelling it if `f` fails.
    fn run<R>(&self, f: impl FnOnce(&CacheTransaction<'_>) -> Result<R>) -> Result<R> {
        let tx = self.begin();
        tx.start()?;
        match f(&tx) {
            Ok(value) => {
                tx.finish()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(cancel_error) = tx.cancel() {
                    warn!("Cancel after failed transaction also failed: {}", cancel_error);
                }
                Err(e)
            }
        }
    }

    /// Replace `entity` with the origin's full content.
    pub fn reload(&self, entity: &str) -> Result<()> {
        self.run(|tx| self.source.fetch_all(entity, tx))?;
        info!("Reloaded {}", entity);
        Ok(())
    }

    /// Replace every entity the origin serves, in one transaction.
    pub fn reload_all(&self) -> Result<()> {
        let entities = self.source.entity_ids()?;
        self.run(|tx| {
            entities
                .iter()
                .try_for_each(|entity| self.source.fetch_all(entity, tx))
        })?;
        info!("Reloaded {} entities", entities.len());
        Ok(())
    }

    /// Replace the rows of `entity` whose `group` value is `key`.
    pub fn reload_group(&self, entity: &str, group: &str, key: &str) -> Result<()> {
        self.require_group(entity, group)?;
        self.run(|tx| self.source.fetch_by_group(entity, group, key, tx))?;
        info!("Reloaded {} where {} = {}", entity, group, key);
        Ok(())
    }

    /// Re-fetch `ids` from the origin and publish whatever changed.
    /// The ids come from an untrusted notification, so their content is
    /// never taken from the caller.
    pub fn apply_external_update(&self, entity: &str, ids: &BTreeSet<String>) -> Result<DiffResult> {
        self.run(|tx| {
            let live = self.entity(entity)?;
            let fetched = self.fetch_ids(entity, ids)?;
            let delta = differ::diff_lines(&live, ids, fetched);
            Self::stage_delta(tx, entity, live.columns(), &delta)?;
            Ok(delta.result)
        })
    }

    /// [`apply_external_update`](Self::apply_external_update) for an
    /// id-only update message as received from the transport.
    pub fn apply_update_message(&self, entity: &str, message: &str) -> Result<DiffResult> {
        let ids: BTreeSet<String> = text_block::read_ids(message)?.into_iter().collect();
        self.apply_external_update(entity, &ids)
    }

    /// Apply rows asserted by the transport. A row holding only an id is a
    /// deletion. How far the rows are trusted depends on the configured
    /// [`UpdateMode`].
    pub fn apply_trusted_transaction(
        &self,
        entity: &str,
        columns: &Columns,
        rows: &[String],
    ) -> Result<DiffResult> {
        let live = self.entity(entity)?;
        if columns != live.columns() {
            return Err(CacheError::ColumnMismatch {
                entity: entity.to_string(),
                expected: live.columns().to_csv(),
                got: columns.to_csv(),
            });
        }

        let mut updates = Vec::new();
        let mut requested = BTreeSet::new();
        for row in rows {
            let fields = codec::split_row(row)?;
            let line = match fields.first() {
                Some(Some(id)) => {
                    requested.insert(id.clone());
                    if fields.len() == 1 {
                        continue;
                    }
                    if fields.len() != columns.len() {
                        return Err(CacheError::ColumnMismatch {
                            entity: entity.to_string(),
                            expected: columns.to_csv(),
                            got: row.clone(),
                        });
                    }
                    // Canonical rendering, so quoting alone never reads as a change.
                    Line::from_fields(fields.iter().map(|f| f.as_deref()))?
                }
                _ => return Err(CacheError::Encoding(format!("row with a null id: {:?}", row))),
            };
            updates.push(self.attach_groups(entity, columns, line)?);
        }

        match self.config.update_mode {
            UpdateMode::Trusted => self.run(|tx| {
                let live = self.entity(entity)?;
                let delta = differ::diff_lines(&live, &requested, updates);
                Self::stage_delta(tx, entity, live.columns(), &delta)?;
                Ok(delta.result)
            }),
            UpdateMode::Untrusted => self.apply_external_update(entity, &requested),
            UpdateMode::Reconcile => self.run(|tx| {
                let live = self.entity(entity)?;
                let fetched = self.fetch_ids(entity, &requested)?;
                Self::reconcile(entity, &requested, &updates, &fetched);
                let delta = differ::diff_lines(&live, &requested, fetched);
                Self::stage_delta(tx, entity, live.columns(), &delta)?;
                Ok(delta.result)
            }),
        }
    }

    /// Re-fetch one id and publish it whether or not it changed.
    pub fn force_republish(&self, entity: &str, id: &str) -> Result<DiffResult> {
        self.run(|tx| {
            let live = self.entity(entity)?;
            let ids = std::iter::once(id.to_string()).collect();
            let fetched = self.fetch_ids(entity, &ids)?.into_iter().next();
            let delta = differ::poke(&live, id, fetched);
            Self::stage_delta(tx, entity, live.columns(), &delta)?;
            debug!("Republished {}/{}", entity, id);
            Ok(delta.result)
        })
    }

    fn fetch_ids(&self, entity: &str, ids: &BTreeSet<String>) -> Result<Vec<Line>> {
        let buffer = TransactionBuffer::new();
        buffer.start()?;
        self.source.fetch_by_ids(entity, ids, &buffer)?;
        buffer.finish()?;
        Ok(buffer.lines_for(entity))
    }

    /// Send the reported part of a delta through `tx`. Unchanged lines
    /// equal what is cached, so they are not staged.
    fn stage_delta(
        tx: &CacheTransaction<'_>,
        entity: &str,
        columns: &Columns,
        delta: &Delta,
    ) -> Result<()> {
        if delta.is_empty() {
            debug!("Nothing changed for {}", entity);
            return Ok(());
        }
        tx.start_block(entity, columns)?;
        for line in delta.changed_lines() {
            tx.process_update(entity, columns, line)?;
        }
        for id in &delta.result.deleted_ids {
            tx.process_remove(entity, id)?;
        }
        Ok(())
    }

    /// Log every transport row that disagrees with the origin.
    fn reconcile(entity: &str, requested: &BTreeSet<String>, claimed: &[Line], fetched: &[Line]) {
        let origin: BTreeMap<&str, &Line> = fetched.iter().map(|l| (l.id.as_str(), l)).collect();
        let claimed: BTreeMap<&str, &Line> = claimed.iter().map(|l| (l.id.as_str(), l)).collect();
        for id in requested {
            match (claimed.get(id.as_str()), origin.get(id.as_str())) {
                (Some(ours), Some(theirs)) if ours.row != theirs.row => warn!(
                    "Consistency warning: {}/{} transport row {:?} differs from origin row {:?}",
                    entity, id, ours.row, theirs.row
                ),
                (Some(ours), None) => warn!(
                    "Consistency warning: {}/{} transport row {:?} is absent from origin",
                    entity, id, ours.row
                ),
                (None, Some(theirs)) => warn!(
                    "Consistency warning: {}/{} deleted by transport but origin holds {:?}",
                    entity, id, theirs.row
                ),
                _ => {}
            }
        }
    }

    fn require_group(&self, entity: &str, group: &str) -> Result<()> {
        if self.config.declares_group(entity, group) {
            Ok(())
        } else {
            Err(CacheError::UnknownGroup {
                entity: entity.to_string(),
                group: group.to_string(),
            })
        }
    }

    /// Fill in declared group values the line does not carry, taking them
    /// from the column of the same name.
    fn attach_groups(&self, entity: &str, columns: &Columns, mut line: Line) -> Result<Line> {
        let groups = match self.config.groups.get(entity) {
            Some(groups) => groups,
            None => return Ok(line),
        };
        let mut fields = None;
        for group in groups {
            if line.group_values.contains_key(group) {
                continue;
            }
            if let Some(position) = columns.position(group) {
                if fields.is_none() {
                    fields = Some(line.fields()?);
                }
                if let Some(Some(value)) = fields.as_ref().and_then(|f| f.get(position)) {
                    line.group_values.insert(group.clone(), value.clone());
                }
            }
        }
        Ok(line)
    }

    /// Repoint live pointers and wake generation waiters.
    fn publish_swaps(&self, swaps: Vec<Arc<EntityCache>>) {
        let mut generation = self.generation.lock();
        if !swaps.is_empty() {
            let mut slots = self.slots.write();
            for cache in swaps {
                let entity = cache.entity().to_string();
                match slots.get(&entity) {
                    Some(slot) => slot.store(cache),
                    None => {
                        slots.insert(entity, Arc::new(ArcSwap::new(cache)));
                    }
                }
            }
        }
        *generation += 1;
        self.swapped.notify_all();
    }
}

/// What one transaction does to one entity.
enum Stage {
    /// Full content, built in a scratch cache.
    Bulk { scratch: EntityCache, block: bool },
    /// Full content of one group value.
    Group {
        group: String,
        key: String,
        lines: BTreeMap<String, Line>,
        block: bool,
    },
    /// Individual updates and removals.
    Sparse {
        updates: BTreeMap<String, Line>,
        removes: BTreeSet<String>,
    },
}

impl Stage {
    fn has_block(&self) -> bool {
        match self {
            Stage::Bulk { block, .. } | Stage::Group { block, .. } => *block,
            Stage::Sparse { .. } => true,
        }
    }
}

/// A rendered payload waiting for the outbound hub.
struct Publication {
    entity: String,
    payload: String,
    bulk: bool,
}

/// A transaction against an [`OriginCache`].
///
/// Full-bulk entities are built in a scratch cache and swapped in at
/// `finish`. Group and sparse changes are staged and applied to the live
/// cache at `finish`, each entity under one write lock. Every event is
/// forwarded to the cache's subscribers. `cancel` discards everything.
///
/// Dropping a started transaction, including during a panic, cancels it.
pub struct CacheTransaction<'a> {
    cache: &'a OriginCache,
    staging: Mutex<Option<BTreeMap<String, Stage>>>,
    /// Whether this transaction holds the multiplexer's exclusive section.
    section: AtomicBool,
}

impl CacheTransaction<'_> {
    /// Close the multiplexer's section, committing or cancelling it.
    fn release(&self, commit: bool) -> Result<()> {
        self.section.store(false, Ordering::SeqCst);
        if commit {
            self.cache.mux.finish()
        } else {
            self.cache.mux.cancel()
        }
    }

    fn with_stage<R>(
        &self,
        entity: &str,
        f: impl FnOnce(&mut Stage) -> Result<R>,
    ) -> Result<R> {
        let mut staging = self.staging.lock();
        let stages = staging.as_mut().ok_or_else(|| {
            CacheError::ProtocolViolation("event received outside a transaction".into())
        })?;
        match stages.get_mut(entity) {
            Some(stage) if stage.has_block() => f(stage),
            _ => Err(CacheError::ProtocolViolation(format!(
                "event for {} before start_block",
                entity
            ))),
        }
    }

    fn check_columns(entity: &str, expected: &Columns, got: &Columns) -> Result<()> {
        if expected == got {
            Ok(())
        } else {
            Err(CacheError::ColumnMismatch {
                entity: entity.to_string(),
                expected: expected.to_csv(),
                got: got.to_csv(),
            })
        }
    }

    /// Apply staged changes. Returns the caches to swap in and the payloads
    /// to publish.
    fn commit(
        &self,
        stages: BTreeMap<String, Stage>,
    ) -> Result<(Vec<Arc<EntityCache>>, Vec<Publication>)> {
        let mut swaps = Vec::new();
        let mut payloads = Vec::new();

        for (entity, stage) in stages {
            match stage {
                Stage::Bulk { scratch, .. } => {
                    debug!("Swapping in {} lines for {}", scratch.len(), entity);
                    payloads.push(Publication {
                        payload: scratch.render(),
                        entity,
                        bulk: true,
                    });
                    swaps.push(Arc::new(scratch));
                }
                Stage::Group {
                    group, key, lines, ..
                } => {
                    let live = self.cache.entity(&entity)?;
                    let updated: BTreeSet<String> = lines.keys().cloned().collect();
                    let gone = live.replace_group(&group, &key, lines.into_values().collect());
                    if !(updated.is_empty() && gone.is_empty()) {
                        payloads.push(Publication {
                            payload: live.render_subset(&updated, &gone),
                            entity,
                            bulk: false,
                        });
                    }
                }
                Stage::Sparse { updates, removes } => {
                    let live = self.cache.entity(&entity)?;
                    let updated: BTreeSet<String> = updates.keys().cloned().collect();
                    let deleted: BTreeSet<String> = removes
                        .iter()
                        .filter(|id| live.get(id).is_some())
                        .cloned()
                        .collect();
                    live.apply(updates.into_values().collect(), &removes);
                    if !(updated.is_empty() && deleted.is_empty()) {
                        payloads.push(Publication {
                            payload: live.render_subset(&updated, &deleted),
                            entity,
                            bulk: false,
                        });
                    }
                }
            }
        }
        Ok((swaps, payloads))
    }
}

impl ChangeChannel for CacheTransaction<'_> {
    fn start(&self) -> Result<()> {
        if self.staging.lock().is_some() {
            return Err(CacheError::ProtocolViolation(
                "start() called twice on a cache transaction".into(),
            ));
        }
        self.cache.mux.start()?;
        self.section.store(true, Ordering::SeqCst);
        *self.staging.lock() = Some(BTreeMap::new());
        Ok(())
    }

    fn start_bulk(&self, entity: &str, columns: &Columns) -> Result<()> {
        {
            let mut staging = self.staging.lock();
            let stages = staging.as_mut().ok_or_else(|| {
                CacheError::ProtocolViolation("start_bulk() outside a transaction".into())
            })?;
            if stages.contains_key(entity) {
                return Err(CacheError::ProtocolViolation(format!(
                    "{} already touched by this transaction",
                    entity
                )));
            }
            stages.insert(
                entity.to_string(),
                Stage::Bulk {
                    scratch: EntityCache::new(entity, columns.clone()),
                    block: false,
                },
            );
        }
        self.cache.mux.start_bulk(entity, columns)
    }

    fn start_group_bulk(&self, entity: &str, group: &str, key: &str) -> Result<()> {
        self.cache.require_group(entity, group)?;
        self.cache.entity(entity)?;
        {
            let mut staging = self.staging.lock();
            let stages = staging.as_mut().ok_or_else(|| {
                CacheError::ProtocolViolation("start_group_bulk() outside a transaction".into())
            })?;
            if stages.contains_key(entity) {
                return Err(CacheError::ProtocolViolation(format!(
                    "{} already touched by this transaction",
                    entity
                )));
            }
            stages.insert(
                entity.to_string(),
                Stage::Group {
                    group: group.to_string(),
                    key: key.to_string(),
                    lines: BTreeMap::new(),
                    block: false,
                },
            );
        }
        self.cache.mux.start_group_bulk(entity, group, key)
    }

    fn start_block(&self, entity: &str, columns: &Columns) -> Result<()> {
        {
            let mut staging = self.staging.lock();
            let stages = staging.as_mut().ok_or_else(|| {
                CacheError::ProtocolViolation("start_block() outside a transaction".into())
            })?;
            match stages.get_mut(entity) {
                Some(Stage::Bulk { scratch, block }) => {
                    Self::check_columns(entity, scratch.columns(), columns)?;
                    *block = true;
                }
                Some(Stage::Group { block, .. }) => {
                    Self::check_columns(entity, self.cache.entity(entity)?.columns(), columns)?;
                    *block = true;
                }
                Some(Stage::Sparse { .. }) => {
                    Self::check_columns(entity, self.cache.entity(entity)?.columns(), columns)?;
                }
                None => {
                    Self::check_columns(entity, self.cache.entity(entity)?.columns(), columns)?;
                    stages.insert(
                        entity.to_string(),
                        Stage::Sparse {
                            updates: BTreeMap::new(),
                            removes: BTreeSet::new(),
                        },
                    );
                }
            }
        }
        self.cache.mux.start_block(entity, columns)
    }

    fn process_update(&self, entity: &str, columns: &Columns, line: &Line) -> Result<()> {
        let line = self.cache.attach_groups(entity, columns, line.clone())?;
        self.with_stage(entity, |stage| {
            match stage {
                Stage::Bulk { scratch, .. } => {
                    Self::check_columns(entity, scratch.columns(), columns)?;
                    scratch.put(line.clone());
                }
                Stage::Group {
                    group, key, lines, ..
                } => {
                    if line.group_values.get(group.as_str()) != Some(&*key) {
                        return Err(CacheError::ProtocolViolation(format!(
                            "{}/{} is outside group {} = {}",
                            entity, line.id, group, key
                        )));
                    }
                    lines.insert(line.id.clone(), line.clone());
                }
                Stage::Sparse { updates, removes } => {
                    removes.remove(&line.id);
                    updates.insert(line.id.clone(), line.clone());
                }
            }
            Ok(())
        })?;
        self.cache.mux.process_update(entity, columns, &line)
    }

    fn process_remove(&self, entity: &str, id: &str) -> Result<()> {
        self.with_stage(entity, |stage| {
            match stage {
                Stage::Bulk { scratch, .. } => {
                    scratch.remove(id);
                }
                Stage::Group { lines, .. } => {
                    lines.remove(id);
                }
                Stage::Sparse { updates, removes } => {
                    updates.remove(id);
                    removes.insert(id.to_string());
                }
            }
            Ok(())
        })?;
        self.cache.mux.process_remove(entity, id)
    }

    fn finish(&self) -> Result<()> {
        let stages = self.staging.lock().take().ok_or_else(|| {
            CacheError::ProtocolViolation("finish() without start()".into())
        })?;
        if let Some((entity, _)) = stages.iter().find(|(_, stage)| !stage.has_block()) {
            let violation = CacheError::ProtocolViolation(format!(
                "{} marked for reload but no block followed",
                entity
            ));
            self.release(false)?;
            return Err(violation);
        }

        let touched = stages.len();
        let (swaps, payloads) = match self.commit(stages) {
            Ok(committed) => committed,
            Err(e) => {
                self.release(false)?;
                return Err(e);
            }
        };
        self.cache.publish_swaps(swaps);

        for publication in &payloads {
            if publication.bulk {
                self.cache.hub.publish_bulk(&publication.entity, &publication.payload);
            } else {
                self.cache.hub.publish(&publication.entity, &publication.payload);
            }
        }
        debug!("Committed transaction touching {} entities", touched);
        self.release(true)
    }

    fn cancel(&self) -> Result<()> {
        if self.staging.lock().take().is_none() {
            return Err(CacheError::ProtocolViolation(
                "cancel() without start()".into(),
            ));
        }
        debug!("Transaction cancelled, scratch state discarded");
        self.release(false)
    }
}

impl Drop for CacheTransaction<'_> {
    fn drop(&mut self) {
        if !self.section.swap(false, Ordering::SeqCst) {
            return;
        }
        self.staging.get_mut().take();
        warn!("Cache transaction dropped while open, cancelling it");
        if let Err(e) = self.cache.mux.cancel() {
            warn!("Cancel of dropped transaction failed: {}", e);
        }
    }
}
