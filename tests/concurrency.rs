//! Concurrent producers, subscribers and readers against one origin.

use rowcast::channel::ChannelEvent;
use rowcast::{
    ChangeChannel, Columns, ConsumerCache, ConsumerConfig, Interest, Line, Multiplexer,
    OriginCache, OriginConfig, OutboundHub, TextBlockSource, TransactionBuffer,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn origin() -> (Arc<TextBlockSource>, Arc<OriginCache>) {
    let source = Arc::new(TextBlockSource::new());
    source.set_block("price", "id,amount\np0,0").unwrap();
    let origin =
        OriginCache::open(source.clone(), OriginConfig::default(), Arc::new(OutboundHub::new()))
            .unwrap();
    (source, Arc::new(origin))
}

fn prices() -> ConsumerCache<u64> {
    ConsumerCache::new(
        ConsumerConfig::new("price"),
        |_: &Columns, line: &Line| -> rowcast::Result<u64> {
            let fields = line.fields()?;
            Ok(fields[1].as_deref().unwrap_or("0").parse().unwrap_or(0))
        },
    )
}

#[test]
fn test_concurrent_producers_serialize() {
    let (source, origin) = origin();
    let cache = Arc::new(prices());
    cache.attach(&origin).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let (source, origin) = (source.clone(), origin.clone());
            thread::spawn(move || {
                for i in 0..25u64 {
                    let id = format!("p{}", w);
                    let amount = (i + 1).to_string();
                    source
                        .upsert("price", &[Some(id.as_str()), Some(amount.as_str())])
                        .unwrap();
                    let ids: BTreeSet<String> = std::iter::once(id).collect();
                    origin.apply_external_update("price", &ids).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    for w in 0..4 {
        assert_eq!(*cache.must_get(&format!("p{}", w)).unwrap(), 25);
    }
    assert!(!cache.is_poisoned());
}

#[test]
fn test_late_subscriber_sees_consistent_state() {
    let (source, origin) = origin();

    let writer = {
        let (source, origin) = (source.clone(), origin.clone());
        thread::spawn(move || {
            for i in 1..=50u64 {
                let amount = i.to_string();
                source
                    .upsert("price", &[Some("p0"), Some(amount.as_str())])
                    .unwrap();
                let ids: BTreeSet<String> = std::iter::once("p0".to_string()).collect();
                origin.apply_external_update("price", &ids).unwrap();
            }
        })
    };

    thread::sleep(Duration::from_millis(1));
    let cache = Arc::new(prices());
    cache.attach(&origin).unwrap();
    writer.join().unwrap();

    // Whatever point the replay was taken at, every later commit followed it.
    assert_eq!(*cache.must_get("p0").unwrap(), 50);
}

#[test]
fn test_readers_never_see_partial_reload() {
    let (source, origin) = origin();
    let rows: String = (0..200).map(|i| format!("\np{},{}", i, i)).collect();
    source
        .set_block("price", &format!("id,amount{}", rows))
        .unwrap();
    origin.reload("price").unwrap();

    let reader = {
        let origin = origin.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let len = origin.entity("price").unwrap().len();
                assert!(len == 200 || len == 100, "saw {} lines", len);
            }
        })
    };

    let half: String = (0..100).map(|i| format!("\np{},{}", i, i)).collect();
    source
        .set_block("price", &format!("id,amount{}", half))
        .unwrap();
    origin.reload("price").unwrap();
    reader.join().unwrap();

    assert_eq!(origin.entity("price").unwrap().len(), 100);
}

#[test]
fn test_multiplexer_fans_out_by_interest() {
    let mux = Multiplexer::new();
    let prices = Arc::new(TransactionBuffer::new());
    let everything = Arc::new(TransactionBuffer::new());
    mux.subscribe(Interest::entity("price"), prices.clone()).unwrap();
    mux.subscribe(Interest::All, everything.clone()).unwrap();

    let columns = Columns::parse("id,name").unwrap();
    mux.start().unwrap();
    mux.start_block("currency", &columns).unwrap();
    mux.process_update("currency", &columns, &Line::new("GBP", "GBP,Pound"))
        .unwrap();
    mux.finish().unwrap();

    assert!(prices.events().is_empty());
    assert!(!prices.is_finished());
    assert!(everything.is_finished());
    assert!(matches!(
        everything.events().last(),
        Some(ChannelEvent::Update { .. })
    ));
}
