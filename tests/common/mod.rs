#![allow(dead_code)]

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use lance_storage_engine::store::{StoreError, StoreResult};
use lance_storage_engine::{
    Array, DataType, Dataset, Field, MemoryObjectStore, ObjectStore, RecordBatch, Schema, Value, WriteParams,
};

pub const DIM: u32 = 8;

pub fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("category", DataType::Utf8, true),
        Field::new("score", DataType::Float64, true),
    ]).unwrap())
}

/// id = i，category 轮换 a/b/c（每 7 行一个 NULL），score = i / 2
pub fn rows(ids: Range<i64>) -> RecordBatch {
    let cats: Vec<Value> = ids.clone()
        .map(|i| if i % 7 == 6 { Value::Null } else { Value::Utf8(["a", "b", "c"][(i % 3) as usize].into()) })
        .collect();
    RecordBatch::try_new(schema(), vec![
        Array::from_i64(ids.clone().collect()),
        Array::from_values(&DataType::Utf8, &cats).unwrap(),
        Array::from_f64(ids.map(|i| i as f64 / 2.0).collect()),
    ]).unwrap()
}

pub fn vector_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("doc", DataType::Utf8, true),
        Field::vector("vec", DIM),
    ]).unwrap())
}

/// 带向量与文本的批次；向量由种子决定
pub fn docs(ids: Range<i64>, seed: u64) -> RecordBatch {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = ids.clone().count();
    let flat: Vec<f32> = (0..n * DIM as usize).map(|_| rng.random::<f32>()).collect();
    let words = ["apple", "banana", "cherry", "date", "elder"];
    let texts: Vec<String> = ids.clone()
        .map(|i| format!("{} {}", words[(i % 5) as usize], words[((i / 5) % 5) as usize]))
        .collect();
    RecordBatch::try_new(vector_schema(), vec![
        Array::from_i64(ids.collect()),
        Array::from_strings(&texts),
        Array::from_vectors(DIM as usize, flat).unwrap(),
    ]).unwrap()
}

pub fn memory_store() -> Arc<dyn ObjectStore> {
    Arc::new(MemoryObjectStore::new())
}

pub fn create(store: &Arc<dyn ObjectStore>, batch: RecordBatch) -> Dataset {
    Dataset::write_with_store(store.clone(), "ds", &[batch], &WriteParams::default()).unwrap()
}

pub fn int64s(column: &Array) -> Vec<i64> {
    column.to_values().into_iter()
        .map(|v| match v {
            Value::Int64(i) => i,
            other => panic!("expected Int64, got {other:?}"),
        })
        .collect()
}

pub fn f32s(column: &Array) -> Vec<f32> {
    column.to_values().into_iter()
        .map(|v| match v {
            Value::Float32(f) => f,
            other => panic!("expected Float32, got {other:?}"),
        })
        .collect()
}

pub fn ids_of(ds: &Dataset) -> Vec<i64> {
    let batch = ds.scan().project(&["id"]).try_into_batch().unwrap();
    int64s(batch.column(0))
}

/// 打开开关后，版本文件的发布以 I/O 错误失败
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner:    MemoryObjectStore,
    pub fail: AtomicBool,
}

impl FlakyStore {
    pub fn fail_publish(&self, yes: bool) {
        self.fail.store(yes, Ordering::SeqCst);
    }
}

impl ObjectStore for FlakyStore {
    fn put_if_absent(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        if self.fail.load(Ordering::SeqCst) && path.contains("_versions/") {
            return Err(StoreError::Io { path: path.into(), message: "simulated network partition".into() });
        }
        self.inner.put_if_absent(path, data)
    }
    fn put(&self, path: &str, data: &[u8]) -> StoreResult<()> { self.inner.put(path, data) }
    fn get(&self, path: &str) -> StoreResult<Vec<u8>> { self.inner.get(path) }
    fn get_range(&self, path: &str, range: Range<u64>) -> StoreResult<Vec<u8>> { self.inner.get_range(path, range) }
    fn size(&self, path: &str) -> StoreResult<u64> { self.inner.size(path) }
    fn list(&self, dir: &str) -> StoreResult<Vec<String>> { self.inner.list(dir) }
    fn delete(&self, path: &str) -> StoreResult<()> { self.inner.delete(path) }
}
