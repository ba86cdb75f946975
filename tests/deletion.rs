mod common;

use std::sync::Arc;
use lance_storage_engine::fragment::ROW_ID;
use lance_storage_engine::{
    row_address, Array, CompactionOptions, DataType, Dataset, Field, LanceError, Predicate, RecordBatch, Schema, WriteParams,
};
use rstest::rstest;
use common::*;

#[test]
fn deleting_two_rows_keeps_the_rest_in_order() {
    let store = memory_store();
    let mut ds = create(&store, rows(0..10));
    assert_eq!(ds.delete(&Predicate::is_in("id", [3i64, 7])).unwrap(), 2);
    assert_eq!(ds.count_rows(None).unwrap(), 8);
    assert_eq!(ids_of(&ds), vec![0, 1, 2, 4, 5, 6, 8, 9]);
    // 删除前的版本不受影响
    assert_eq!(ds.checkout_version(1).unwrap().count_rows(None).unwrap(), 10);
}

/// {id: int64, vec: fixed_size_list<float32, 128>}
fn embeddings(ids: std::ops::Range<i64>) -> RecordBatch {
    const WIDTH: usize = 128;
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::vector("vec", WIDTH as u32),
    ]).unwrap());
    let flat: Vec<f32> = ids.clone().flat_map(|i| (0..WIDTH).map(move |d| (i as f32) + d as f32 / 1000.0)).collect();
    RecordBatch::try_new(schema, vec![
        Array::from_i64(ids.collect()),
        Array::from_vectors(WIDTH, flat).unwrap(),
    ]).unwrap()
}

#[test]
fn counts_across_appends_and_deletes() {
    let store = memory_store();
    let mut ds = create(&store, embeddings(0..1000));
    ds.append(&[embeddings(1000..1500)], &WriteParams::default()).unwrap();
    ds.delete(&Predicate::eq("id", 10i64)).unwrap();
    assert_eq!(ds.count_rows(None).unwrap(), 1499);
    assert_eq!(ds.scan().project(&["id"]).try_into_batch().unwrap().num_rows(), 1499);
    assert_eq!(ds.count_rows(Some(Predicate::lt("id", 20i64))).unwrap(), 19);

    let vectors = ds.scan().project(&["vec"]).filter(Predicate::eq("id", 1499i64)).try_into_batch().unwrap();
    let (dim, flat) = vectors.column(0).vector_values().unwrap();
    assert_eq!((dim, flat.len()), (128, 128));
    assert_eq!(flat[0], 1499.0);
}

#[test]
fn deletions_accumulate_and_row_addresses_stay_stable() {
    let store = memory_store();
    let mut ds = create(&store, rows(0..10));
    ds.delete_rows(&[row_address(0, 2)]).unwrap();
    ds.delete_rows(&[row_address(0, 2), row_address(0, 5)]).unwrap();
    assert_eq!(ds.fragments()[0].num_deleted(), 2);

    let batch = ds.scan().project(&["id"]).with_row_id().try_into_batch().unwrap();
    let addrs = batch.column_by_name(ROW_ID).unwrap().to_values();
    assert_eq!(batch.num_rows(), 8);
    // 行地址 = 物理偏移，不因删除而移动
    assert_eq!(addrs[2], lance_storage_engine::Value::UInt64(row_address(0, 3)));

    // 已删除的行再次删除不产生新版本
    let v = ds.version();
    assert_eq!(ds.delete_rows(&[row_address(0, 5)]).unwrap(), 0);
    assert_eq!(ds.version(), v);
    assert!(matches!(ds.delete_rows(&[row_address(0, 10)]), Err(LanceError::InvalidInput(_))));
    assert!(matches!(ds.delete_rows(&[row_address(7, 0)]), Err(LanceError::InvalidInput(_))));
}

#[rstest]
#[case(Predicate::is_null("category"), 1)]
#[case(Predicate::eq("category", "a").or(Predicate::is_null("category")), 3)]
#[case(!Predicate::eq("category", "a"), 4)]
#[case(Predicate::between("score", 1.0, 2.0), 3)]
fn delete_uses_three_valued_logic(#[case] predicate: Predicate, #[case] deleted: u64) {
    // ids 0..7：category = a b c a b c NULL
    let store = memory_store();
    let mut ds = create(&store, rows(0..7));
    assert_eq!(ds.delete(&predicate).unwrap(), deleted);
    assert_eq!(ds.count_rows(None).unwrap(), 7 - deleted);
}

#[test]
fn compaction_merges_small_fragments_and_preserves_order() {
    let store = memory_store();
    let mut ds = create(&store, rows(0..10));
    for i in 1..6 {
        ds.append(&[rows(i * 10..i * 10 + 10)], &WriteParams::default()).unwrap();
    }
    ds.delete(&Predicate::is_in("id", [3i64, 33, 47])).unwrap();
    let before = ds.scan().try_into_batch().unwrap();
    assert_eq!(ds.fragments().len(), 6);

    let options = CompactionOptions::default().with_target_rows_per_fragment(25);
    let metrics = ds.compact_files(&options, &WriteParams::default()).unwrap();
    assert_eq!(metrics.fragments_removed, 6);
    assert_eq!(metrics.fragments_added, 3);

    let after = ds.scan().try_into_batch().unwrap();
    for c in 0..before.num_columns() {
        assert_eq!(after.column(c).to_values(), before.column(c).to_values());
    }
    assert!(ds.fragments().iter().all(|f| f.num_deleted() == 0));
    // 新 fragment 的 id 接续分配
    assert_eq!(ds.fragments().iter().map(|f| f.id).collect::<Vec<_>>(), vec![6, 7, 8]);

    // 已经足够大的 fragment 不再重写
    let v = ds.version();
    let again = ds.compact_files(&CompactionOptions::default().with_target_rows_per_fragment(20), &WriteParams::default()).unwrap();
    assert_eq!(again.fragments_removed, 0);
    assert_eq!(ds.version(), v);
}

#[test]
fn compaction_can_leave_deletions_in_place() {
    let store = memory_store();
    let mut ds = create(&store, rows(0..100));
    ds.append(&[rows(100..200)], &WriteParams::default()).unwrap();
    ds.delete(&Predicate::eq("id", 150i64)).unwrap();

    let keep = CompactionOptions::default().with_target_rows_per_fragment(50).with_materialize_deletions(false);
    assert_eq!(ds.compact_files(&keep, &WriteParams::default()).unwrap().fragments_removed, 0);

    let materialize = CompactionOptions::default().with_target_rows_per_fragment(50);
    let m = ds.compact_files(&materialize, &WriteParams::default()).unwrap();
    assert_eq!((m.fragments_removed, m.fragments_added), (1, 2));
    assert_eq!(ds.count_rows(None).unwrap(), 199);
    assert_eq!(ids_of(&ds), (0..200).filter(|&i| i != 150).collect::<Vec<_>>());
}

#[test]
fn deleted_dataset_rows_are_not_taken() {
    let dir = tempfile::tempdir().unwrap();
    let mut ds = Dataset::write(dir.path(), &[rows(0..6)], &WriteParams::default()).unwrap();
    ds.delete(&Predicate::eq("id", 4i64)).unwrap();
    let taken = ds.take(&[row_address(0, 5), row_address(0, 4), row_address(0, 0)], &["id", "score"]).unwrap();
    assert_eq!(int64s(taken.column(0)), vec![5, 0]);
}
