//! S6 from spec.md §8: a secondary index is registered after data already
//! exists, stays unusable until the background indexer catches up, and once
//! built, a search through it returns exactly the matching keys.

use std::sync::Arc;

use chainstore::datalayer::Datalayer;
use chainstore::datalayer::indexer::Indexer;
use chainstore::ids::{IndexId, RegionId};
use chainstore::index::IndexSpec;
use chainstore::types::{AttributeType, Check, Schema, Value};
use chainstore::worker::Worker;

#[test]
fn s6_background_index_build_then_search() {
    let dir = tempfile::tempdir().unwrap();
    let (layer, _) = Datalayer::open(dir.path()).unwrap();
    let layer = Arc::new(layer);
    let region = RegionId::new(1);
    layer.register_schema(
        region,
        Schema {
            key_type: AttributeType::Int64,
            attributes: vec![AttributeType::String, AttributeType::Int64],
        },
    );

    layer
        .put(region, &Value::Int(1), &[Value::Str("red".into()), Value::Int(10)], 1)
        .unwrap();
    layer
        .put(region, &Value::Int(2), &[Value::Str("blue".into()), Value::Int(20)], 1)
        .unwrap();
    layer
        .put(region, &Value::Int(3), &[Value::Str("red".into()), Value::Int(30)], 1)
        .unwrap();

    let spec = IndexSpec {
        id: IndexId::new(1),
        attr: 0,
        ty: AttributeType::String,
    };
    layer.register_index(region, spec);
    assert!(!layer.is_index_usable(region, spec.id));
    assert_eq!(layer.unusable_indices(), vec![(region, spec.id)]);

    // Before the index is built, a search against it must find nothing —
    // an unusable index is simply skipped as a candidate, not scanned.
    let empty: Vec<_> = layer
        .make_search_iterator(region, vec![Check::Equals { attr: 0, value: Value::Str("red".into()) }])
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(empty.is_empty());

    let mut indexer = Indexer::new(layer.clone());
    assert!(indexer.have_work());
    indexer.copy_work();
    indexer.do_work();
    assert!(layer.is_index_usable(region, spec.id));
    assert!(layer.unusable_indices().is_empty());

    let mut found: Vec<_> = layer
        .make_search_iterator(region, vec![Check::Equals { attr: 0, value: Value::Str("red".into()) }])
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    found.sort_by_key(|(key, ..)| match key {
        Value::Int(n) => *n,
        _ => unreachable!(),
    });

    assert_eq!(found.len(), 2);
    assert_eq!(found[0].0, Value::Int(1));
    assert_eq!(found[0].1, vec![Value::Str("red".into()), Value::Int(10)]);
    assert_eq!(found[0].2, 1);
    assert_eq!(found[1].0, Value::Int(3));
    assert_eq!(found[1].1, vec![Value::Str("red".into()), Value::Int(30)]);
    assert_eq!(found[1].2, 1);

    // The session-oriented cursor walks the same plan in caller-chosen
    // batches rather than all at once.
    let mut session = layer.start_search(region, vec![Check::Equals { attr: 0, value: Value::Str("red".into()) }]);
    let first_batch = session.next_batch(1).unwrap();
    assert_eq!(first_batch.len(), 1);
    let second_batch = session.next_batch(10).unwrap();
    assert_eq!(second_batch.len(), 1);
    let third_batch = session.next_batch(10).unwrap();
    assert!(third_batch.is_empty());
}
