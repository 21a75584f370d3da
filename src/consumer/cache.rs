//! The consumer-side cache of typed records for one entity.

use crate::channel::{text_block, ChangeChannel};
use crate::composite_id::CompositeIdCodec;
use crate::config::ConsumerConfig;
use crate::error::{panic_message, CacheError, Result};
use crate::groups::GroupIndex;
use crate::origin::OriginCache;
use crate::types::{Columns, Interest, Line, ObserverId, SubscriptionId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::convert::RecordConverter;

/// Receives the outcome of each committed transaction.
///
/// Each commit produces at most one `records_updated` call and at most one
/// `records_deleted` call, and neither is made with an empty argument.
pub trait CacheObserver<T>: Send + Sync {
    fn records_updated(&self, updated: &HashMap<String, Arc<T>>);

    fn records_deleted(&self, deleted: &BTreeSet<String>);
}

struct Live<T> {
    records: HashMap<String, Arc<T>>,
    groups: GroupIndex,
    columns: Option<Columns>,
}

/// What the staged lines replace at commit.
#[derive(Debug, PartialEq, Eq)]
enum Replace {
    /// Only the ids mentioned.
    Nothing,
    /// The whole entity.
    Everything,
    /// Every id holding one of these (group, value) pairs.
    Groups(Vec<(String, String)>),
}

struct Staging<T> {
    replace: Replace,
    columns: Option<Columns>,
    updated: HashMap<String, (Arc<T>, BTreeMap<String, String>)>,
    deleted: BTreeSet<String>,
}

impl<T> Staging<T> {
    fn new() -> Self {
        Self {
            replace: Replace::Nothing,
            columns: None,
            updated: HashMap::new(),
            deleted: BTreeSet::new(),
        }
    }
}

enum Phase<T> {
    Idle,
    Open(Staging<T>),
    /// A transaction was cancelled. Reads still serve the last commit.
    Poisoned,
}

type Observers<T> = Vec<(ObserverId, Arc<dyn CacheObserver<T>>)>;

/// Typed records of one entity, replaced transaction by transaction.
///
/// Lines are converted as they arrive and staged; nothing is visible to
/// readers until `finish`, when the staged records are merged into the
/// live mapping in one step and observers are notified. A full-bulk
/// transaction stages from empty, so every id it does not mention is
/// deleted at commit. A group-bulk transaction does the same within the
/// ids currently holding that group value.
///
/// The protocol cannot resume a half-received block, so `cancel` is fatal:
/// it returns [`CacheError::TransactionCancelled`] and every later
/// transaction fails with [`CacheError::Poisoned`].
pub struct ConsumerCache<T> {
    config: ConsumerConfig,
    converter: Box<dyn RecordConverter<T>>,
    live: RwLock<Live<T>>,
    phase: Mutex<Phase<T>>,
    /// Locked before `live` whenever both are held.
    observers: RwLock<Observers<T>>,
    next_observer: AtomicU64,
    loaded: Mutex<bool>,
    loaded_signal: Condvar,
}

impl<T: Send + Sync + 'static> ConsumerCache<T> {
    pub fn new(config: ConsumerConfig, converter: impl RecordConverter<T> + 'static) -> Self {
        Self {
            config,
            converter: Box::new(converter),
            live: RwLock::new(Live {
                records: HashMap::new(),
                groups: GroupIndex::new(),
                columns: None,
            }),
            phase: Mutex::new(Phase::Idle),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            loaded: Mutex::new(false),
            loaded_signal: Condvar::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.config.entity
    }

    /// Subscribe to an origin cache in the same process.
    pub fn attach(self: &Arc<Self>, origin: &OriginCache) -> Result<SubscriptionId> {
        let channel: Arc<dyn ChangeChannel> = self.clone();
        origin.subscribe(Interest::entity(self.entity()), channel)
    }

    // Reads

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.live.read().records.get(id).cloned()
    }

    pub fn must_get(&self, id: &str) -> Result<Arc<T>> {
        self.get(id).ok_or_else(|| CacheError::NotFound {
            entity: self.entity().to_string(),
            id: id.to_string(),
        })
    }

    /// Look up a record whose id was built from components.
    pub fn get_by_components(&self, components: &[Option<&str>]) -> Option<Arc<T>> {
        self.get(&CompositeIdCodec::create_id(components))
    }

    pub fn must_get_by_components(&self, components: &[Option<&str>]) -> Result<Arc<T>> {
        self.must_get(&CompositeIdCodec::create_id(components))
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<T>> {
        self.live.read().records.clone()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.live.read().records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.read().records.is_empty()
    }

    /// Columns of the last committed transaction.
    pub fn columns(&self) -> Option<Columns> {
        self.live.read().columns.clone()
    }

    /// Ids whose `group` value is `key`.
    pub fn group_members(&self, group: &str, key: &str) -> BTreeSet<String> {
        self.live.read().groups.members(group, key)
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Poisoned)
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.lock()
    }

    /// Wait for the first commit. A cache that never loads means the
    /// origin is unavailable.
    pub fn wait_until_loaded(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut loaded = self.loaded.lock();
        while !*loaded {
            if self.is_poisoned() {
                return Err(CacheError::Poisoned(format!(
                    "{} was poisoned before its initial load",
                    self.entity()
                )));
            }
            if self.loaded_signal.wait_until(&mut loaded, deadline).timed_out() && !*loaded {
                return Err(CacheError::Unavailable(format!(
                    "{} not loaded within {:?}",
                    self.entity(),
                    timeout
                )));
            }
        }
        Ok(())
    }

    /// [`wait_until_loaded`](Self::wait_until_loaded) with the configured timeout.
    pub fn wait_for_initial_load(&self) -> Result<()> {
        self.wait_until_loaded(self.config.load_timeout())
    }

    // Observers

    pub fn add_observer(&self, observer: Arc<dyn CacheObserver<T>>) -> ObserverId {
        let id = self.next_observer_id();
        self.observers.write().push((id, observer));
        id
    }

    /// Build an observer from the current records and register it, with no
    /// commit able to land in between.
    pub fn add_observer_with<O, F>(&self, build: F) -> Result<(ObserverId, Arc<O>)>
    where
        O: CacheObserver<T> + 'static,
        F: FnOnce(&HashMap<String, Arc<T>>) -> Result<Arc<O>>,
    {
        let mut observers = self.observers.write();
        let observer = build(&self.live.read().records)?;
        let id = self.next_observer_id();
        let registered: Arc<dyn CacheObserver<T>> = observer.clone();
        observers.push((id, registered));
        Ok((id, observer))
    }

    /// Returns whether the observer was registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    fn next_observer_id(&self) -> ObserverId {
        ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst))
    }

    // Transport path

    /// Apply a wire payload as one transaction.
    pub fn apply_payload(&self, payload: &str, bulk: bool) -> Result<()> {
        let parsed = text_block::parse_payload(payload)?;
        self.start()?;
        match parsed.present(self.entity(), self, bulk) {
            Ok(()) => self.finish(),
            Err(e) => {
                // Poisons the cache. The conversion failure is reported.
                let _ = self.cancel();
                Err(e)
            }
        }
    }

    fn check_entity(&self, entity: &str) -> Result<()> {
        if entity == self.config.entity {
            Ok(())
        } else {
            Err(CacheError::ProtocolViolation(format!(
                "event for {} delivered to the {} cache",
                entity, self.config.entity
            )))
        }
    }

    fn with_staging<R>(&self, f: impl FnOnce(&mut Staging<T>) -> Result<R>) -> Result<R> {
        match &mut *self.phase.lock() {
            Phase::Open(staging) => f(staging),
            Phase::Idle => Err(CacheError::ProtocolViolation(
                "event received outside a transaction".into(),
            )),
            Phase::Poisoned => Err(self.poisoned()),
        }
    }

    fn poisoned(&self) -> CacheError {
        CacheError::Poisoned(format!(
            "{} cache refuses transactions after a cancel",
            self.config.entity
        ))
    }

    fn convert(&self, columns: &Columns, line: &Line) -> Result<T> {
        self.converter
            .convert(columns, line)
            .map_err(|e| match e {
                CacheError::Conversion { id, reason, .. } => CacheError::Conversion {
                    entity: self.config.entity.clone(),
                    id,
                    reason,
                },
                other => other,
            })
    }

    /// Merge staged records into the live mapping and notify observers.
    fn commit(&self, staging: Staging<T>) {
        let observers = self.observers.read();

        let (updated, deleted) = {
            let mut live = self.live.write();

            let mut candidates = staging.deleted;
            match &staging.replace {
                Replace::Nothing => {}
                Replace::Everything => candidates.extend(live.records.keys().cloned()),
                Replace::Groups(keys) => {
                    for (group, key) in keys {
                        candidates.extend(live.groups.members(group, key));
                    }
                }
            }
            let deleted: BTreeSet<String> = candidates
                .into_iter()
                .filter(|id| !staging.updated.contains_key(id) && live.records.contains_key(id))
                .collect();

            for id in &deleted {
                live.records.remove(id);
                live.groups.remove(id);
            }

            let mut updated = HashMap::with_capacity(staging.updated.len());
            for (id, (record, group_values)) in staging.updated {
                live.groups.insert(&id, &group_values);
                live.records.insert(id.clone(), record.clone());
                updated.insert(id, record);
            }

            if staging.columns.is_some() {
                live.columns = staging.columns;
            }
            (updated, deleted)
        };

        {
            let mut loaded = self.loaded.lock();
            if !*loaded {
                *loaded = true;
                info!("{} cache loaded", self.config.entity);
            }
            self.loaded_signal.notify_all();
        }

        debug!(
            "{} commit: {} updated, {} deleted",
            self.config.entity,
            updated.len(),
            deleted.len()
        );
        for (id, observer) in observers.iter() {
            // Records are already committed. A panicking observer is logged and skipped.
            let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                if !updated.is_empty() {
                    observer.records_updated(&updated);
                }
                if !deleted.is_empty() {
                    observer.records_deleted(&deleted);
                }
            }));
            if let Err(payload) = notified {
                error!(
                    "{} observer {:?} panicked: {}",
                    self.config.entity,
                    id,
                    panic_message(&*payload)
                );
            }
        }
    }
}

impl<T: Send + Sync + 'static> ChangeChannel for ConsumerCache<T> {
    fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        match &*phase {
            Phase::Idle => {
                *phase = Phase::Open(Staging::new());
                Ok(())
            }
            Phase::Open(_) => Err(CacheError::ProtocolViolation(
                "start() called while a transaction is open".into(),
            )),
            Phase::Poisoned => Err(self.poisoned()),
        }
    }

    fn start_bulk(&self, entity: &str, columns: &Columns) -> Result<()> {
        self.check_entity(entity)?;
        self.with_staging(|staging| {
            staging.replace = Replace::Everything;
            staging.updated.clear();
            staging.deleted.clear();
            staging.columns = Some(columns.clone());
            Ok(())
        })
    }

    fn start_group_bulk(&self, entity: &str, group: &str, key: &str) -> Result<()> {
        self.check_entity(entity)?;
        self.with_staging(|staging| {
            let pair = (group.to_string(), key.to_string());
            match staging.replace {
                Replace::Everything => {}
                Replace::Groups(ref mut keys) => keys.push(pair),
                Replace::Nothing => staging.replace = Replace::Groups(vec![pair]),
            }
            Ok(())
        })
    }

    fn start_block(&self, entity: &str, columns: &Columns) -> Result<()> {
        self.check_entity(entity)?;
        self.with_staging(|staging| {
            staging.columns = Some(columns.clone());
            Ok(())
        })
    }

    fn process_update(&self, entity: &str, columns: &Columns, line: &Line) -> Result<()> {
        self.check_entity(entity)?;
        // Fail on a closed or poisoned cache before paying for conversion.
        self.with_staging(|_| Ok(()))?;
        let record = Arc::new(self.convert(columns, line)?);
        self.with_staging(|staging| {
            staging.deleted.remove(&line.id);
            staging
                .updated
                .insert(line.id.clone(), (record, line.group_values.clone()));
            Ok(())
        })
    }

    fn process_remove(&self, entity: &str, id: &str) -> Result<()> {
        self.check_entity(entity)?;
        self.with_staging(|staging| {
            staging.updated.remove(id);
            staging.deleted.insert(id.to_string());
            Ok(())
        })
    }

    fn finish(&self) -> Result<()> {
        let staging = {
            let mut phase = self.phase.lock();
            match std::mem::replace(&mut *phase, Phase::Idle) {
                Phase::Open(staging) => staging,
                Phase::Idle => {
                    return Err(CacheError::ProtocolViolation(
                        "finish() without start()".into(),
                    ))
                }
                Phase::Poisoned => {
                    *phase = Phase::Poisoned;
                    return Err(self.poisoned());
                }
            }
        };
        self.commit(staging);
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        let mut phase = self.phase.lock();
        let staged = match &*phase {
            Phase::Open(staging) => staging.updated.len() + staging.deleted.len(),
            Phase::Idle => {
                return Err(CacheError::ProtocolViolation(
                    "cancel() without start()".into(),
                ))
            }
            Phase::Poisoned => return Err(self.poisoned()),
        };
        *phase = Phase::Poisoned;
        drop(phase);
        {
            let _loaded = self.loaded.lock();
            self.loaded_signal.notify_all();
        }
        error!(
            "{} transaction cancelled with {} staged changes; cache poisoned",
            self.config.entity, staged
        );
        Err(CacheError::TransactionCancelled {
            entity: self.config.entity.clone(),
        })
    }
}
