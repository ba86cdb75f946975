mod common;

use std::sync::Arc;
use lance_storage_engine::index::{IndexKind, IndexOutput, IndexQuery};
use lance_storage_engine::scanner::DISTANCE;
use lance_storage_engine::{
    Dataset, IndexParams, LanceError, MetricType, Predicate, ScanState, Value, VectorIndexParams, WriteParams,
};
use rstest::rstest;
use common::*;

/// 取第 `row` 行的向量
fn vector_at(ds: &Dataset, id: i64) -> Vec<f32> {
    let b = ds.scan().project(&["vec"]).filter(Predicate::eq("id", id)).try_into_batch().unwrap();
    let (_, flat) = b.column(0).vector_values().unwrap();
    flat
}

fn nearest_ids(ds: &Dataset, query: &[f32], k: usize, tweak: impl Fn(lance_storage_engine::Scanner) -> lance_storage_engine::Scanner) -> (Vec<i64>, Vec<f32>) {
    let scan = tweak(ds.scan().project(&["id"]).nearest("vec", query, k));
    let b = scan.try_into_batch().unwrap();
    (int64s(b.column(0)), f32s(b.column_by_name(DISTANCE).unwrap()))
}

fn vector_dataset() -> Dataset {
    let store = memory_store();
    let mut ds = create(&store, docs(0..300, 7));
    ds.append(&[docs(300..400, 8)], &WriteParams::default()).unwrap();
    ds
}

// ── 过期策略 ──────────────────────────────────────────────────────────────────

#[test]
fn stale_index_falls_back_to_flat_scan_for_new_fragments() {
    let store = memory_store();
    let mut ds = create(&store, docs(0..100, 1));
    for i in 1..5 {
        ds.append(&[docs(i * 100..i * 100 + 100, i as u64 + 1)], &WriteParams::default()).unwrap();
    }
    assert_eq!(ds.version(), 5);
    let params = IndexParams::Vector(VectorIndexParams::ivf_flat(4, MetricType::L2));
    let vec_idx = ds.create_index("vec", None, &params).unwrap();
    ds.create_index("id", None, &IndexParams::BTree).unwrap();
    assert_eq!(vec_idx.dataset_version, 5);

    ds.append(&[docs(500..550, 99)], &WriteParams::default()).unwrap();
    let new_frag = ds.fragments().last().unwrap().id;

    // 向量：新追加的行也能被检索到
    let target = vector_at(&ds, 520);
    let plan = ds.scan().nearest("vec", &target, 3).nprobes(4).plan().unwrap();
    let usage = plan.index_usage().unwrap();
    assert!(usage.is_stale());
    assert_eq!(usage.built_at, 5);
    assert_eq!(usage.unindexed_fragments, vec![new_frag]);
    assert!(plan.explain().contains("Stale index `vec_idx`"));
    let (ids, dists) = nearest_ids(&ds, &target, 3, |s| s.nprobes(4));
    assert_eq!(ids[0], 520);
    assert_eq!(dists[0], 0.0);

    // 标量：索引覆盖部分与平扫部分合并
    let filter = Predicate::gt_eq("id", 495i64);
    let via_index = ds.scan().project(&["id"]).filter(filter.clone()).try_into_batch().unwrap();
    assert_eq!(int64s(via_index.column(0)), (495..550).collect::<Vec<_>>());
    assert_eq!(ds.count_rows(Some(filter)).unwrap(), 55);
}

// ── 标量索引 ──────────────────────────────────────────────────────────────────

#[rstest]
#[case(Predicate::eq("id", 42i64))]
#[case(Predicate::between("id", 10i64, 20i64).and(Predicate::eq("category", "a")))]
#[case(Predicate::is_in("category", ["a", "c"]))]
#[case(Predicate::is_null("category"))]
#[case(Predicate::gt("id", 990i64))]
#[case(Predicate::eq("category", "b").and(Predicate::lt("score", 50.0)))]
#[case(Predicate::eq("id", 5i64).or(Predicate::eq("id", 1100i64)))]
fn scalar_index_scans_equal_flat_scans(#[case] filter: Predicate) {
    let store = memory_store();
    let mut ds = create(&store, rows(0..600));
    ds.append(&[rows(600..1000)], &WriteParams::default()).unwrap();
    ds.create_index("id", None, &IndexParams::BTree).unwrap();
    ds.create_index("category", Some("cat"), &IndexParams::BTree).unwrap();
    ds.append(&[rows(1000..1200)], &WriteParams::default()).unwrap();
    ds.delete(&Predicate::is_in("id", [12i64, 15, 42, 991, 1100])).unwrap();

    let indexed = ds.scan().filter(filter.clone()).with_row_id().try_into_batch().unwrap();
    let flat = ds.scan().filter(filter).with_row_id().use_index(false).try_into_batch().unwrap();
    assert_eq!(indexed.num_columns(), flat.num_columns());
    for c in 0..flat.num_columns() {
        assert_eq!(indexed.column(c).to_values(), flat.column(c).to_values(), "column {c}");
    }
}

#[rstest]
#[case(Predicate::eq("x", 0.0f64), 2)]
#[case(Predicate::eq("x", -0.0f64), 2)]
#[case(Predicate::lt_eq("x", 0.0f64), 3)]
#[case(Predicate::gt("x", -0.0f64), 1)]
fn signed_zero_keys_match_flat_scans(#[case] filter: Predicate, #[case] expected: u64) {
    let schema = Arc::new(lance_storage_engine::Schema::new(vec![
        lance_storage_engine::Field::new("x", lance_storage_engine::DataType::Float64, false),
    ]).unwrap());
    let batch = lance_storage_engine::RecordBatch::try_new(schema, vec![
        lance_storage_engine::Array::from_f64(vec![-0.0, 0.0, 1.0, -2.0]),
    ]).unwrap();
    let store = memory_store();
    let mut ds = create(&store, batch);
    assert_eq!(ds.scan().filter(filter.clone()).use_index(false).try_into_batch().unwrap().num_rows() as u64, expected);

    ds.create_index("x", None, &IndexParams::BTree).unwrap();
    assert_eq!(ds.count_rows(Some(filter.clone())).unwrap(), expected);
    assert_eq!(ds.scan().filter(filter.clone()).try_into_batch().unwrap().num_rows() as u64, expected);
    // 删除同样走索引
    assert_eq!(ds.delete(&filter).unwrap(), expected);
    assert_eq!(ds.count_rows(None).unwrap(), 4 - expected);
}

#[test]
fn planner_picks_a_matching_index() {
    let store = memory_store();
    let mut ds = create(&store, rows(0..100));
    ds.create_index("category", None, &IndexParams::BTree).unwrap();

    let plan = ds.scan().filter(Predicate::gt("score", 3.0).and(Predicate::eq("category", "c"))).plan().unwrap();
    assert_eq!(plan.index_usage().map(|u| u.kind), Some(IndexKind::BTree));
    assert!(!plan.index_usage().unwrap().is_stale());

    // OR 无法用单个索引回答
    let plan = ds.scan().filter(Predicate::eq("category", "c").or(Predicate::gt("score", 3.0))).plan().unwrap();
    assert!(plan.index_usage().is_none());
    assert!(plan.explain().contains("full scan"));
}

// ── 全文索引 ──────────────────────────────────────────────────────────────────

#[test]
fn text_match_uses_the_inverted_index() {
    let mut ds = vector_dataset();
    let meta = ds.create_index("doc", None, &IndexParams::Inverted).unwrap();
    assert_eq!(meta.kind(), IndexKind::Inverted);

    let filter = Predicate::text_match("doc", "Cherry APPLE");
    let plan = ds.scan().filter(filter.clone()).plan().unwrap();
    assert_eq!(plan.index_usage().map(|u| u.kind), Some(IndexKind::Inverted));

    let indexed = ds.scan().project(&["id"]).filter(filter.clone()).try_into_batch().unwrap();
    let flat = ds.scan().project(&["id"]).filter(filter).use_index(false).try_into_batch().unwrap();
    assert_eq!(int64s(indexed.column(0)), int64s(flat.column(0)));
    assert!(indexed.num_rows() > 0);

    match ds.query_index(&meta.name, &IndexQuery::Text("banana".into())).unwrap() {
        IndexOutput::Rows(rows) => assert_eq!(rows.len(), 144),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(ds.query_index("missing", &IndexQuery::Text("x".into())), Err(LanceError::IndexNotFound(_))));
}

// ── 向量检索 ──────────────────────────────────────────────────────────────────

#[rstest]
#[case(MetricType::L2)]
#[case(MetricType::Cosine)]
#[case(MetricType::Dot)]
fn ivf_flat_with_all_probes_matches_exact_search(#[case] metric: MetricType) {
    let mut ds = vector_dataset();
    ds.create_index("vec", None, &IndexParams::Vector(VectorIndexParams::ivf_flat(8, metric))).unwrap();
    let query = vector_at(&ds, 123).iter().map(|x| x * 0.9 + 0.05).collect::<Vec<_>>();

    let (ids, dists) = nearest_ids(&ds, &query, 10, |s| s.nprobes(8));
    let (exact_ids, exact_dists) = nearest_ids(&ds, &query, 10, |s| s.use_index(false).distance_metric(metric));
    assert_eq!(ids, exact_ids);
    for (a, b) in dists.iter().zip(&exact_dists) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
    assert!(dists.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn ivf_pq_with_refine_finds_the_exact_match() {
    let mut ds = vector_dataset();
    let params = VectorIndexParams::ivf_pq(4, 4, MetricType::L2).with_seed(11);
    ds.create_index("vec", Some("pq"), &IndexParams::Vector(params)).unwrap();
    let target = vector_at(&ds, 77);

    let (ids, dists) = nearest_ids(&ds, &target, 5, |s| s.nprobes(4).refine_factor(10));
    assert_eq!(ids[0], 77);
    assert_eq!(dists[0], 0.0);
    assert_eq!(ids.len(), 5);
    // refine 后的距离是精确值
    let (exact_ids, exact_dists) = nearest_ids(&ds, &target, 5, |s| s.use_index(false));
    assert_eq!(ids, exact_ids);
    assert_eq!(dists, exact_dists);
}

#[test]
fn prefilter_returns_k_matching_rows() {
    let mut ds = vector_dataset();
    ds.create_index("vec", None, &IndexParams::Vector(VectorIndexParams::ivf_flat(4, MetricType::L2))).unwrap();
    let query = vector_at(&ds, 10);
    let filter = Predicate::gt_eq("id", 350i64);

    let (pre, _) = nearest_ids(&ds, &query, 5, |s| s.nprobes(4).filter(filter.clone()).prefilter(true));
    assert_eq!(pre.len(), 5);
    assert!(pre.iter().all(|&id| id >= 350));
    let (exact, _) = nearest_ids(&ds, &query, 5, |s| s.use_index(false).filter(filter.clone()).prefilter(true));
    assert_eq!(pre, exact);

    // 后过滤：先取 top-k 再过滤，结果只可能更少
    let (post, _) = nearest_ids(&ds, &query, 5, |s| s.nprobes(4).filter(filter.clone()));
    assert!(post.len() <= 5);
    assert!(post.iter().all(|id| pre.contains(id) || *id >= 350));
    assert!(!post.contains(&10));
}

#[test]
fn a_different_metric_bypasses_the_index() {
    let mut ds = vector_dataset();
    ds.create_index("vec", None, &IndexParams::Vector(VectorIndexParams::ivf_flat(4, MetricType::L2))).unwrap();
    let query = vector_at(&ds, 3);
    let plan = ds.scan().nearest("vec", &query, 4).distance_metric(MetricType::Cosine).plan().unwrap();
    assert!(plan.index_usage().is_none());
    assert!(plan.explain().contains("flat search"));
    assert!(plan.explain().contains("metric=cosine") || plan.explain().to_lowercase().contains("cosine"));
}

#[test]
fn nearest_rejects_bad_queries() {
    let ds = vector_dataset();
    let err = ds.scan().nearest("vec", &[1.0, 2.0], 3).plan().unwrap_err();
    assert!(matches!(err, LanceError::InvalidInput(_)));
    let err = ds.scan().nearest("doc", &[0.0; DIM as usize], 3).plan().unwrap_err();
    assert!(matches!(err, LanceError::UnsupportedSchema { .. }));
    let err = ds.scan().nearest("vec", &[0.0; DIM as usize], 0).plan().unwrap_err();
    assert!(matches!(err, LanceError::InvalidInput(_)));
}

#[test]
fn loaded_indices_are_cached() {
    let mut ds = vector_dataset();
    ds.create_index("id", None, &IndexParams::BTree).unwrap();
    let a = ds.load_index("id_idx").unwrap();
    let b = ds.checkout_latest().unwrap().load_index("id_idx").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    // 新句柄从存储加载，查询结果相同
    let fresh = Dataset::open_with_store(ds.store().clone(), "ds").unwrap();
    let q = IndexQuery::Scalar(lance_storage_engine::index::ScalarQuery::Equals(Value::Int64(250)));
    assert_eq!(fresh.query_index("id_idx", &q).unwrap(), ds.query_index("id_idx", &q).unwrap());
}

#[test]
fn replacing_and_dropping_an_index() {
    let mut ds = vector_dataset();
    let first = ds.create_index("id", Some("ids"), &IndexParams::BTree).unwrap();
    let second = ds.create_index("id", Some("ids"), &IndexParams::BTree).unwrap();
    assert_ne!(first.uuid, second.uuid);
    assert_eq!(ds.indices().len(), 1);
    ds.drop_index("ids").unwrap();
    assert!(ds.indices().is_empty());
    assert!(matches!(ds.drop_index("ids"), Err(LanceError::IndexNotFound(_))));
    let err = ds.create_index("doc", None, &IndexParams::Vector(VectorIndexParams::ivf_flat(2, MetricType::L2)));
    assert!(matches!(err, Err(LanceError::UnsupportedSchema { .. })));
}

// ── 扫描流 ────────────────────────────────────────────────────────────────────

#[test]
fn scan_stream_moves_through_its_states() {
    let store = memory_store();
    let ds = create(&store, rows(0..25));
    let plan = ds.scan().batch_size(10).plan().unwrap();
    assert_eq!(plan.state(), ScanState::Planning);
    let mut stream = plan.execute().unwrap();
    assert_eq!(stream.state(), ScanState::Executing);
    let sizes: Vec<usize> = stream.by_ref().map(|b| b.unwrap().num_rows()).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(stream.state(), ScanState::Exhausted);
    assert!(stream.next().is_none());
}

#[test]
fn limit_and_offset_apply_after_filtering() {
    let store = memory_store();
    let ds = create(&store, rows(0..100));
    let b = ds.scan().project(&["id"]).filter(Predicate::gt_eq("id", 50i64)).limit(Some(5), 10).try_into_batch().unwrap();
    assert_eq!(int64s(b.column(0)), (60..65).collect::<Vec<_>>());
    let plan = ds.scan().limit(Some(5), 10).plan().unwrap();
    assert!(plan.explain().contains("Limit: 5 offset 10"));
}

#[test]
fn projection_errors_name_the_column() {
    let store = memory_store();
    let ds = create(&store, rows(0..3));
    assert!(ds.scan().project(&["nope"]).plan().is_err());
    let err = ds.scan().filter(Predicate::text_match("id", "x")).plan().unwrap_err();
    assert!(matches!(err, LanceError::UnsupportedSchema { ref column, .. } if column == "id"));
    assert!(matches!(ds.scan().project::<&str>(&[]).plan(), Err(LanceError::InvalidInput(_))));
}
