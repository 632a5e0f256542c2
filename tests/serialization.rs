//! Wire-format round trips, schema validation on load, and the observer
//! hooks fired by bulk loads.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tupleheap::encoding::{ByteReader, ByteWriter};
use tupleheap::{
    ColumnSpec, ErrorKind, IndexObserver, Schema, Table, TableConfig, TableError, Value, ValueType,
};

fn mixed_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ColumnSpec::fixed(ValueType::BigInt, false),
        ColumnSpec::varchar(64, true),
        ColumnSpec::fixed(ValueType::Integer, true),
        ColumnSpec::fixed(ValueType::Double, true),
    ]))
}

fn mixed_names() -> Vec<String> {
    vec!["id".into(), "name".into(), "count".into(), "score".into()]
}

fn mixed_table(name: &str) -> Table {
    let mut table = Table::with_config(TableConfig::new(4096).name(name).database_id(7));
    table.initialize(mixed_schema(), mixed_names()).unwrap();
    table
}

/// Deterministic mixed-value row; roughly every seventh name and every
/// fifth count is NULL.
fn row_for(i: i64) -> Vec<Value<'static>> {
    vec![
        Value::BigInt(i),
        if i % 7 == 0 {
            Value::Null
        } else {
            Value::varchar(format!("name-{}", i * 31 % 97))
        },
        if i % 5 == 0 {
            Value::Null
        } else {
            Value::Integer((i * 13 % 1024) as i32)
        },
        if i % 11 == 0 {
            Value::Null
        } else {
            Value::Double(i as f64 * 0.75)
        },
    ]
}

#[test]
fn round_trip_restores_an_equal_table() {
    let mut original = mixed_table("events");
    for i in 0..1000 {
        original.insert(&row_for(i)).unwrap();
    }

    let mut w = ByteWriter::new();
    original.serialize_to(&mut w).unwrap();

    let mut restored = mixed_table("events");
    // skip the outer total-size prefix; the column header follows it
    let mut r = ByteReader::new(&w.as_slice()[4..]);
    restored.load_tuples_from(false, &mut r).unwrap();

    assert_eq!(r.remaining(), 0);
    assert_eq!(restored.active_tuple_count(), 1000);
    restored.validate().unwrap();
    assert!(original.equals(&restored).unwrap());
}

#[test]
fn round_trip_without_header_uses_local_schema() {
    let mut original = mixed_table("events");
    for i in 0..25 {
        original.insert(&row_for(i)).unwrap();
    }

    let mut w = ByteWriter::new();
    original.serialize_to(&mut w).unwrap();

    // re-read the stream manually: total size, header, then rows
    let mut r = ByteReader::new(w.as_slice());
    let total = r.read_i32("total").unwrap();
    assert_eq!(total as usize, w.as_slice().len() - 4);
    let header_size = r.read_i32("header size").unwrap();
    r.read_bytes("header body", header_size as usize).unwrap();

    let mut restored = mixed_table("events");
    restored.load_tuples_from_no_header(false, &mut r).unwrap();

    assert_eq!(r.remaining(), 0);
    assert!(original.equals(&restored).unwrap());
}

#[test]
fn column_count_mismatch_reports_both_schemas_and_loads_nothing() {
    let mut original = mixed_table("events");
    original.insert(&row_for(1)).unwrap();
    let mut w = ByteWriter::new();
    original.serialize_to(&mut w).unwrap();

    let mut target = Table::with_config(TableConfig::new(4096).name("narrow"));
    let schema = Arc::new(Schema::new(vec![
        ColumnSpec::fixed(ValueType::BigInt, false),
        ColumnSpec::varchar(64, true),
    ]));
    target
        .initialize(schema, vec!["id".into(), "name".into()])
        .unwrap();

    let mut r = ByteReader::new(&w.as_slice()[4..]);
    let err = target.load_tuples_from(false, &mut r).unwrap_err();
    let table_err = err.downcast_ref::<TableError>().unwrap();

    assert_eq!(table_err.kind(), ErrorKind::SchemaMismatch);
    assert!(table_err.message().contains("Expecting 2, but 4 given"));
    // both column lists appear in the message
    assert!(table_err.message().contains("column 1: name, type = VARCHAR"));
    assert!(table_err.message().contains("column 3: score, type = DOUBLE"));

    assert_eq!(target.active_tuple_count(), 0);
    assert_eq!(target.block_count(), 0);
    target.validate().unwrap();
}

#[test]
fn column_type_mismatch_is_a_schema_error() {
    let mut original = mixed_table("events");
    original.insert(&row_for(1)).unwrap();
    let mut w = ByteWriter::new();
    original.serialize_to(&mut w).unwrap();

    let mut target = Table::with_config(TableConfig::new(4096).name("events"));
    let schema = Arc::new(Schema::new(vec![
        ColumnSpec::fixed(ValueType::BigInt, false),
        ColumnSpec::varchar(64, true),
        ColumnSpec::fixed(ValueType::BigInt, true), // was INTEGER
        ColumnSpec::fixed(ValueType::Double, true),
    ]));
    target.initialize(schema, mixed_names()).unwrap();

    let mut r = ByteReader::new(&w.as_slice()[4..]);
    let err = target.load_tuples_from(false, &mut r).unwrap_err();
    let table_err = err.downcast_ref::<TableError>().unwrap();

    assert_eq!(table_err.kind(), ErrorKind::SchemaMismatch);
    assert!(table_err.message().contains("type mismatch at column 2"));
    assert_eq!(target.active_tuple_count(), 0);
}

#[test]
fn truncated_stream_is_a_deserialization_error() {
    let mut original = mixed_table("events");
    for i in 0..10 {
        original.insert(&row_for(i)).unwrap();
    }
    let mut w = ByteWriter::new();
    original.serialize_to(&mut w).unwrap();

    let cut = w.as_slice().len() - 9;
    let mut restored = mixed_table("events");
    let mut r = ByteReader::new(&w.as_slice()[4..cut]);
    let err = restored.load_tuples_from(false, &mut r).unwrap_err();
    let table_err = err.downcast_ref::<TableError>().unwrap();

    assert_eq!(table_err.kind(), ErrorKind::Deserialization);
    // the failed row was rolled back; earlier rows were kept
    restored.validate().unwrap();
    assert!(restored.active_tuple_count() < 10);
}

#[test]
fn serialize_tuples_frames_only_the_listed_rows() {
    let mut table = mixed_table("events");
    let mut addrs = Vec::new();
    for i in 0..6 {
        addrs.push(table.insert(&row_for(i)).unwrap());
    }

    let picked = [addrs[1], addrs[4]];
    let mut w = ByteWriter::new();
    table.serialize_tuples(&picked, &mut w).unwrap();

    let mut r = ByteReader::new(w.as_slice());
    let total = r.read_i32("total").unwrap();
    assert_eq!(total as usize, w.as_slice().len() - 4);
    let header_size = r.read_i32("header size").unwrap();
    r.read_bytes("header body", header_size as usize).unwrap();
    assert_eq!(r.read_i32("count").unwrap(), 2);

    // the framed rows load back into an empty table
    let mut target = mixed_table("events");
    let mut r = ByteReader::new(&w.as_slice()[4..]);
    target.load_tuples_from(false, &mut r).unwrap();
    assert_eq!(target.active_tuple_count(), 2);
    assert_eq!(
        target
            .tuple_at(target.active_slots()[0])
            .unwrap()
            .value(0)
            .unwrap(),
        Value::BigInt(1)
    );
}

#[derive(Clone, Default)]
struct LoadCounter {
    loaded: Rc<RefCell<Vec<(bool, i64)>>>,
}

impl IndexObserver for LoadCounter {
    fn on_loaded_tuple(&mut self, allow_export: bool, tuple: &tupleheap::TupleRef<'_>) {
        let id = match tuple.value(0).unwrap() {
            Value::BigInt(v) => v,
            other => panic!("unexpected id value {:?}", other),
        };
        self.loaded.borrow_mut().push((allow_export, id));
    }
}

#[test]
fn load_invokes_the_observer_per_tuple() {
    let mut original = mixed_table("events");
    for i in 0..5 {
        original.insert(&row_for(i)).unwrap();
    }
    let mut w = ByteWriter::new();
    original.serialize_to(&mut w).unwrap();

    let observer = LoadCounter::default();
    let loaded = Rc::clone(&observer.loaded);
    let mut target = Table::with_config(
        TableConfig::new(4096)
            .name("events")
            .database_id(7)
            .observer(Box::new(observer)),
    );
    target.initialize(mixed_schema(), mixed_names()).unwrap();

    let mut r = ByteReader::new(&w.as_slice()[4..]);
    target.load_tuples_from(true, &mut r).unwrap();

    let seen = loaded.borrow();
    assert_eq!(seen.len(), 5);
    assert!(seen.iter().all(|(allow_export, _)| *allow_export));
    assert_eq!(seen.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn equality_requires_matching_identity() {
    let mut a = mixed_table("events");
    let mut b = mixed_table("events");
    a.insert(&row_for(3)).unwrap();
    b.insert(&row_for(3)).unwrap();
    assert!(a.equals(&b).unwrap());

    // same rows, different table name
    let mut c = Table::with_config(TableConfig::new(4096).name("other").database_id(7));
    c.initialize(mixed_schema(), mixed_names()).unwrap();
    c.insert(&row_for(3)).unwrap();
    assert!(!a.equals(&c).unwrap());

    // same identity, different row payload
    let mut d = mixed_table("events");
    d.insert(&row_for(4)).unwrap();
    assert!(!a.equals(&d).unwrap());

    // different tuple count
    b.insert(&row_for(9)).unwrap();
    assert!(!a.equals(&b).unwrap());
}

#[test]
fn equality_survives_compaction_reordering() {
    let mut a = mixed_table("events");
    let mut b = mixed_table("events");
    let mut addrs = Vec::new();
    for i in 0..12 {
        addrs.push(a.insert(&row_for(i)).unwrap());
    }
    for i in (0..12).filter(|i| i % 3 != 0) {
        b.insert(&row_for(i)).unwrap();
    }
    for (i, addr) in addrs.iter().enumerate() {
        if i % 3 == 0 {
            a.free_slot(*addr).unwrap();
        }
    }

    // the surviving rows still line up in scan order
    assert!(a.equals(&b).unwrap());

    // compaction may reorder slots, but the row population is unchanged
    a.forced_compaction();
    a.validate().unwrap();
    assert_eq!(a.active_tuple_count(), b.active_tuple_count());

    let mut w_a = ByteWriter::new();
    a.serialize_to(&mut w_a).unwrap();
    let mut c = mixed_table("events");
    let mut r = ByteReader::new(&w_a.as_slice()[4..]);
    c.load_tuples_from(false, &mut r).unwrap();
    assert!(a.equals(&c).unwrap());
}
