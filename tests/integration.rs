//! End-to-end tests: origin source → origin cache → consumer caches.

use rowcast::{
    CacheError, CacheObserver, ConsumerCache, ConsumerConfig, IndexDefinition, MultiIndex,
    OriginCache, OriginConfig, OutboundHub, SerdeConverter, TextBlockSource, UniqueIndex,
    UpdateMode,
};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Debug, Deserialize, PartialEq)]
struct Customer {
    id: String,
    name: String,
    currency: String,
    email: Option<String>,
}

fn source() -> Arc<TextBlockSource> {
    let source = TextBlockSource::new();
    source
        .set_block(
            "customer",
            "id,name,currency,email\n\
             1,Alice,GBP,alice@example.com\n\
             2,Bob,EUR,\n\
             3,Carol,GBP,carol@example.com",
        )
        .unwrap();
    source
        .set_block("currency", "id,name\nGBP,Pound Sterling\nEUR,Euro")
        .unwrap();
    source.declare_group("customer", "currency").unwrap();
    Arc::new(source)
}

fn open(source: &Arc<TextBlockSource>, mode: UpdateMode) -> OriginCache {
    let config = OriginConfig {
        update_mode: mode,
        ..OriginConfig::default().with_group("customer", "currency")
    };
    OriginCache::open(source.clone(), config, Arc::new(OutboundHub::new())).unwrap()
}

fn customers(origin: &OriginCache) -> Arc<ConsumerCache<Customer>> {
    let cache = Arc::new(ConsumerCache::new(
        ConsumerConfig::new("customer"),
        SerdeConverter::<Customer>::new(),
    ));
    cache.attach(origin).unwrap();
    cache.wait_until_loaded(Duration::from_secs(1)).unwrap();
    cache
}

fn ids(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Default)]
struct Recorder {
    updates: AtomicUsize,
    deletes: AtomicUsize,
    last_deleted: parking_lot::Mutex<BTreeSet<String>>,
}

impl CacheObserver<Customer> for Recorder {
    fn records_updated(&self, _updated: &HashMap<String, Arc<Customer>>) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn records_deleted(&self, deleted: &BTreeSet<String>) {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        *self.last_deleted.lock() = deleted.clone();
    }
}

#[test]
fn test_attach_replays_current_content() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let cache = customers(&origin);

    assert_eq!(cache.len(), 3);
    let alice = cache.must_get("1").unwrap();
    assert_eq!(alice.name, "Alice");
    assert_eq!(alice.email.as_deref(), Some("alice@example.com"));
    assert_eq!(cache.must_get("2").unwrap().email, None);
    assert_eq!(cache.group_members("currency", "GBP"), ids(&["1", "3"]));
}

#[test]
fn test_external_update_reaches_consumer_and_outbound() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let outbound = origin.outbound_channel();
    let cache = customers(&origin);

    source
        .upsert(
            "customer",
            &[Some("1"), Some("Alicia"), Some("GBP"), Some("alice@example.com")],
        )
        .unwrap();
    let result = origin.apply_external_update("customer", &ids(&["1", "2"])).unwrap();

    assert_eq!(result.updated_ids, ids(&["1"]));
    assert!(result.deleted_ids.is_empty());
    assert_eq!(cache.must_get("1").unwrap().name, "Alicia");

    let message = outbound.try_recv().unwrap();
    assert_eq!(message.entity, "customer");
    assert!(!message.bulk);
    assert_eq!(
        message.payload,
        "id,name,currency,email\n1,Alicia,GBP,alice@example.com"
    );
    assert!(outbound.try_recv().is_err());
}

#[test]
fn test_unchanged_notification_sends_nothing() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let outbound = origin.outbound_channel();
    let cache = customers(&origin);
    let recorder = Arc::new(Recorder::default());
    cache.add_observer(recorder.clone());

    let result = origin.apply_external_update("customer", &ids(&["1", "3"])).unwrap();

    assert!(result.is_empty());
    assert!(outbound.try_recv().is_err());
    assert_eq!(recorder.updates.load(Ordering::SeqCst), 0);
}

#[test]
fn test_deletion_propagates() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let outbound = origin.outbound_channel();
    let cache = customers(&origin);
    let recorder = Arc::new(Recorder::default());
    cache.add_observer(recorder.clone());

    assert!(source.delete("customer", "2").unwrap());
    let result = origin
        .apply_external_update("customer", &ids(&["2", "99"]))
        .unwrap();

    assert_eq!(result.deleted_ids, ids(&["2"]));
    assert!(cache.get("2").is_none());
    assert_eq!(recorder.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.last_deleted.lock(), ids(&["2"]));
    assert_eq!(outbound.try_recv().unwrap().payload, "id,name,currency,email\n2");
}

#[test]
fn test_group_reload_replaces_only_that_group() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let cache = customers(&origin);
    let recorder = Arc::new(Recorder::default());
    cache.add_observer(recorder.clone());

    assert!(source.delete("customer", "3").unwrap());
    source
        .upsert("customer", &[Some("4"), Some("Dan"), Some("GBP"), None])
        .unwrap();
    source
        .upsert("customer", &[Some("2"), Some("Bobby"), Some("EUR"), None])
        .unwrap();
    origin.reload_group("customer", "currency", "GBP").unwrap();

    assert_eq!(cache.ids(), ids(&["1", "2", "4"]));
    assert_eq!(cache.group_members("currency", "GBP"), ids(&["1", "4"]));
    // EUR was not reloaded.
    assert_eq!(cache.must_get("2").unwrap().name, "Bob");
    assert_eq!(*recorder.last_deleted.lock(), ids(&["3"]));
    assert_eq!(recorder.updates.load(Ordering::SeqCst), 1);
    assert_eq!(
        origin.entity("customer").unwrap().group_members("currency", "GBP"),
        ids(&["1", "4"])
    );
}

#[test]
fn test_full_reload_sends_bulk_and_deletes_missing() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let outbound = origin.outbound_channel();
    let cache = customers(&origin);

    source
        .set_block("customer", "id,name,currency,email\n5,Eve,GBP,")
        .unwrap();
    origin.reload("customer").unwrap();

    assert_eq!(cache.ids(), ids(&["5"]));
    let message = outbound.try_recv().unwrap();
    assert!(message.bulk);
    assert_eq!(message.payload, "id,name,currency,email\n5,Eve,GBP,");
}

#[test]
fn test_consumer_interest_is_entity_scoped() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let cache = customers(&origin);
    let recorder = Arc::new(Recorder::default());
    cache.add_observer(recorder.clone());

    source
        .upsert("currency", &[Some("GBP"), Some("Sterling")])
        .unwrap();
    origin.apply_external_update("currency", &ids(&["GBP"])).unwrap();

    assert_eq!(recorder.updates.load(Ordering::SeqCst), 0);
    assert_eq!(
        origin.row("currency", "GBP").unwrap().as_deref(),
        Some("GBP,Sterling")
    );
}

#[test]
fn test_trusted_rows_applied_as_given() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let cache = customers(&origin);
    let columns = origin.columns("customer").unwrap();

    let result = origin
        .apply_trusted_transaction(
            "customer",
            &columns,
            &["1,Alice,USD,alice@example.com".to_string(), "3".to_string()],
        )
        .unwrap();

    assert_eq!(result.updated_ids, ids(&["1"]));
    assert_eq!(result.deleted_ids, ids(&["3"]));
    assert_eq!(cache.must_get("1").unwrap().currency, "USD");
    assert!(cache.get("3").is_none());
    // The source was never consulted.
    assert!(source.delete("customer", "3").unwrap());
}

#[test]
fn test_untrusted_rows_refetched_from_origin() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Untrusted);
    let cache = customers(&origin);
    let columns = origin.columns("customer").unwrap();

    let result = origin
        .apply_trusted_transaction(
            "customer",
            &columns,
            &["1,Mallory,USD,".to_string()],
        )
        .unwrap();

    assert!(result.is_empty());
    assert_eq!(cache.must_get("1").unwrap().name, "Alice");
}

#[test]
fn test_reconcile_publishes_origin_value() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Reconcile);
    let cache = customers(&origin);
    let columns = origin.columns("customer").unwrap();

    source
        .upsert("customer", &[Some("2"), Some("Robert"), Some("EUR"), None])
        .unwrap();
    let result = origin
        .apply_trusted_transaction("customer", &columns, &["2,Bobby,EUR,".to_string()])
        .unwrap();

    assert_eq!(result.updated_ids, ids(&["2"]));
    assert_eq!(cache.must_get("2").unwrap().name, "Robert");
}

#[test]
fn test_force_republish_sends_unchanged_row() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let outbound = origin.outbound_channel();
    let cache = customers(&origin);
    let recorder = Arc::new(Recorder::default());
    cache.add_observer(recorder.clone());

    let result = origin.force_republish("customer", "1").unwrap();

    assert_eq!(result.updated_ids, ids(&["1"]));
    assert_eq!(recorder.updates.load(Ordering::SeqCst), 1);
    assert_eq!(
        outbound.try_recv().unwrap().payload,
        "id,name,currency,email\n1,Alice,GBP,alice@example.com"
    );
}

#[test]
fn test_indices_follow_commits() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let cache = customers(&origin);

    let by_email = UniqueIndex::attach(
        &cache,
        IndexDefinition::new("by_email", |c: &Customer| c.email.clone()).unique(),
    )
    .unwrap();
    let by_currency = MultiIndex::attach(
        &cache,
        IndexDefinition::new("by_currency", |c: &Customer| Some(c.currency.clone())),
    )
    .unwrap();

    assert_eq!(by_email.len(), 2);
    assert_eq!(by_currency.get(&"GBP".to_string()), ids(&["1", "3"]));

    source
        .upsert(
            "customer",
            &[Some("3"), Some("Carol"), Some("EUR"), Some("carol@example.org")],
        )
        .unwrap();
    source.delete("customer", "1").unwrap();
    origin
        .apply_external_update("customer", &ids(&["1", "3"]))
        .unwrap();

    assert!(by_email.get(&"alice@example.com".to_string()).is_none());
    assert!(by_email.get(&"carol@example.com".to_string()).is_none());
    assert_eq!(
        by_email.must_get(&"carol@example.org".to_string()).unwrap(),
        "3"
    );
    assert!(by_currency.get(&"GBP".to_string()).is_empty());
    assert_eq!(by_currency.get(&"EUR".to_string()), ids(&["2", "3"]));
    assert_eq!(cache.observer_count(), 2);
}

#[test]
fn test_failing_consumer_is_dropped_others_continue() {
    init_tracing();

    #[derive(Debug, Deserialize)]
    struct Strict {
        #[allow(dead_code)]
        id: u32,
    }

    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let good = customers(&origin);
    let strict = Arc::new(ConsumerCache::new(
        ConsumerConfig::new("customer"),
        |_: &rowcast::Columns, line: &rowcast::Line| -> rowcast::Result<Strict> {
            line.id
                .parse()
                .map(|id| Strict { id })
                .map_err(|e: std::num::ParseIntError| CacheError::Conversion {
                    entity: String::new(),
                    id: line.id.clone(),
                    reason: e.to_string(),
                })
        },
    ));
    strict.attach(&origin).unwrap();
    assert_eq!(origin.subscription_count(), 2);

    source
        .upsert("customer", &[Some("x9"), Some("Xavier"), Some("GBP"), None])
        .unwrap();
    origin.apply_external_update("customer", &ids(&["x9"])).unwrap();

    assert!(strict.is_poisoned());
    assert_eq!(strict.len(), 3);
    assert_eq!(origin.subscription_count(), 1);
    assert_eq!(good.must_get("x9").unwrap().name, "Xavier");
}

#[test]
fn test_payload_transport_between_tiers() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let outbound = origin.outbound_channel();

    // A remote consumer fed from wire payloads only.
    let remote = ConsumerCache::new(
        ConsumerConfig::new("customer"),
        SerdeConverter::<Customer>::new(),
    );
    remote
        .apply_payload(&origin.snapshot_payload("customer").unwrap(), true)
        .unwrap();
    assert_eq!(remote.len(), 3);

    source.delete("customer", "1").unwrap();
    source
        .upsert("customer", &[Some("2"), Some("Bobby"), Some("EUR"), None])
        .unwrap();
    origin
        .apply_external_update("customer", &ids(&["1", "2"]))
        .unwrap();

    let message = outbound.try_recv().unwrap();
    remote.apply_payload(&message.payload, message.bulk).unwrap();
    assert_eq!(remote.ids(), ids(&["2", "3"]));
    assert_eq!(remote.must_get("2").unwrap().name, "Bobby");
}

#[test]
fn test_unsubscribed_consumer_stops_receiving() {
    init_tracing();
    let source = source();
    let origin = open(&source, UpdateMode::Trusted);
    let cache = Arc::new(ConsumerCache::new(
        ConsumerConfig::new("customer"),
        SerdeConverter::<Customer>::new(),
    ));
    let id = cache.attach(&origin).unwrap();
    assert!(origin.unsubscribe(id).unwrap());
    assert!(!origin.unsubscribe(id).unwrap());

    source.delete("customer", "1").unwrap();
    origin.apply_external_update("customer", &ids(&["1"])).unwrap();
    assert!(cache.get("1").is_some());
}

#[test]
fn test_generation_advances_per_commit() {
    init_tracing();
    let source = source();
    let origin = Arc::new(open(&source, UpdateMode::Trusted));
    let before = origin.generation();

    let waiter = {
        let origin = origin.clone();
        std::thread::spawn(move || origin.wait_for_generation(before, Duration::from_secs(5)))
    };
    origin.reload("currency").unwrap();

    assert!(waiter.join().unwrap());
    assert_eq!(origin.generation(), before + 1);
}

#[derive(Debug, Deserialize)]
struct Revenue {
    id: String,
    site: String,
    year: u32,
    month: u32,
    revenue: u64,
}

#[test]
fn test_composite_ids_from_origin_to_consumer() {
    init_tracing();
    let source = TextBlockSource::new();
    source
        .set_block(
            "revenue",
            "id,site,year,month,revenue\n1,NY,2014,3,7000\n2,NY,2014,4,6500",
        )
        .unwrap();
    source
        .declare_composite_id("revenue", &["site", "year", "month"])
        .unwrap();
    let source = Arc::new(source);
    let origin =
        OriginCache::open(source.clone(), OriginConfig::default(), Arc::new(OutboundHub::new()))
            .unwrap();
    assert_eq!(
        origin.row("revenue", "NY/2014/3").unwrap().as_deref(),
        Some("NY/2014/3,NY,2014,3,7000")
    );

    let cache = Arc::new(ConsumerCache::new(
        ConsumerConfig::new("revenue"),
        SerdeConverter::<Revenue>::new(),
    ));
    cache.attach(&origin).unwrap();

    let march = cache
        .must_get_by_components(&[Some("NY"), Some("2014"), Some("3")])
        .unwrap();
    assert_eq!((march.id.as_str(), march.site.as_str()), ("NY/2014/3", "NY"));
    assert_eq!((march.year, march.month, march.revenue), (2014, 3, 7000));

    source
        .upsert(
            "revenue",
            &[None, Some("NY"), Some("2014"), Some("3"), Some("7100")],
        )
        .unwrap();
    source.delete("revenue", "NY/2014/4").unwrap();
    origin
        .apply_external_update("revenue", &ids(&["NY/2014/3", "NY/2014/4"]))
        .unwrap();

    assert_eq!(
        cache
            .must_get_by_components(&[Some("NY"), Some("2014"), Some("3")])
            .unwrap()
            .revenue,
        7100
    );
    assert!(cache
        .get_by_components(&[Some("NY"), Some("2014"), Some("4")])
        .is_none());
}
