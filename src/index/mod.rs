//! 索引子系统
//!
//! 三类索引共用一个带标签的枚举 `IndexData`，对外只有
//! build / query / serialize 三个入口：
//! - **BTree**：有序 (key, 行地址)，回答 Eq / Range / In / IsNull
//! - **Inverted**：词 → roaring posting list，回答全文匹配
//! - **Vector**：IvfFlat / IvfPq 近似最近邻
//!
//! 索引文件：`_indices/<column>-v<构建版本>-<uuid>.idx`
//!
//! ```text
//! MAGIC "LIDX" | kind (u8) | payload | CRC32
//! ```
//!
//! 索引只覆盖构建时存在的 fragment（`IndexMetadata::fragment_bitmap`）。
//! 之后追加的 fragment 由扫描引擎平扫补齐，再与索引结果合并。

pub mod btree;
pub mod inverted;
pub mod vector;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use log::{debug, info};
use parking_lot::RwLock;
use roaring::{RoaringBitmap, RoaringTreemap};
use uuid::Uuid;
use crate::array::Array;
use crate::common::{FieldId, FragmentId, LanceError, Result, RowAddress, VersionNumber};
use crate::field_type::{DataType, Field, Value};
use crate::format::{MetaReader, MetaWriter};
use crate::fragment::{FragmentReader, ROW_ID};
use crate::manifest::Manifest;
use crate::schema::Schema;
use crate::store::{self, ObjectStore, StoreError};

pub use btree::{BTreeIndex, ScalarQuery};
pub use inverted::InvertedIndex;
pub use vector::{CpuVectorIndexBuilder, MetricType, VectorIndex, VectorIndexBuilder, VectorIndexParams};

const MAGIC: &[u8; 4] = b"LIDX";
pub const INDICES_DIR: &str = "_indices";

// ── 类型与参数 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Inverted,
    IvfFlat,
    IvfPq,
}

impl IndexKind {
    pub fn is_vector(self) -> bool { matches!(self, Self::IvfFlat | Self::IvfPq) }

    fn tag(self) -> u8 {
        match self {
            Self::BTree    => 1,
            Self::Inverted => 2,
            Self::IvfFlat  => 3,
            Self::IvfPq    => 4,
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BTree    => "BTREE",
            Self::Inverted => "INVERTED",
            Self::IvfFlat  => "IVF_FLAT",
            Self::IvfPq    => "IVF_PQ",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexParams {
    BTree,
    Inverted,
    Vector(VectorIndexParams),
}

impl IndexParams {
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::BTree    => IndexKind::BTree,
            Self::Inverted => IndexKind::Inverted,
            Self::Vector(p) if p.is_quantized() => IndexKind::IvfPq,
            Self::Vector(_) => IndexKind::IvfFlat,
        }
    }

    /// 检查列类型能否建这种索引
    pub fn check_field(&self, field: &Field) -> Result<()> {
        let ok = match self {
            Self::BTree     => field.data_type.is_orderable(),
            Self::Inverted  => field.data_type == DataType::Utf8,
            Self::Vector(p) => match field.data_type.vector_dim() {
                Some(dim) => !p.is_quantized() || dim % p.num_sub_vectors as usize == 0,
                None      => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(LanceError::unsupported(&field.name, format!(
                "cannot build a {} index on {}", self.kind(), field.data_type)))
        }
    }

    fn write_to(&self, w: &mut MetaWriter) {
        w.u8(self.kind().tag());
        if let Self::Vector(p) = self {
            p.write_to(w);
        }
    }

    fn read_from(r: &mut MetaReader) -> Result<Self> {
        Ok(match r.u8()? {
            1 => Self::BTree,
            2 => Self::Inverted,
            3 | 4 => Self::Vector(VectorIndexParams::read_from(r)?),
            other => return Err(LanceError::corrupt("index metadata", format!("unknown index kind {other}"))),
        })
    }
}

/// Manifest 中登记的索引
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMetadata {
    pub uuid:            String,
    pub name:            String,
    pub field_id:        FieldId,
    pub params:          IndexParams,
    /// 构建时读取的数据集版本
    pub dataset_version: VersionNumber,
    /// 已被索引覆盖的 fragment id
    pub fragment_bitmap: RoaringBitmap,
    /// 相对数据集根目录
    pub path:            String,
}

impl IndexMetadata {
    pub fn kind(&self) -> IndexKind { self.params.kind() }

    pub fn covers(&self, fragment_id: FragmentId) -> bool {
        u32::try_from(fragment_id).is_ok_and(|id| self.fragment_bitmap.contains(id))
    }

    pub(crate) fn write_to(&self, w: &mut MetaWriter) {
        let mut bitmap = Vec::with_capacity(self.fragment_bitmap.serialized_size());
        // 写入 Vec 不会失败
        let _ = self.fragment_bitmap.serialize_into(&mut bitmap);
        w.str(&self.uuid).str(&self.name).i32(self.field_id).u64(self.dataset_version)
            .str(&self.path).bytes(&bitmap);
        self.params.write_to(w);
    }

    pub(crate) fn read_from(r: &mut MetaReader) -> Result<Self> {
        let uuid            = r.str()?;
        let name            = r.str()?;
        let field_id        = r.i32()?;
        let dataset_version = r.u64()?;
        let path            = r.str()?;
        let fragment_bitmap = RoaringBitmap::deserialize_from(r.bytes()?)
            .map_err(|e| LanceError::corrupt("index metadata", format!("fragment bitmap of `{name}`: {e}")))?;
        let params = IndexParams::read_from(r)?;
        Ok(Self { uuid, name, field_id, params, dataset_version, fragment_bitmap, path })
    }
}

// ── 查询 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    Scalar(ScalarQuery),
    Text(String),
    Nearest { query: Vec<f32>, k: usize, nprobes: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutput {
    /// 标量 / 全文：全部命中行
    Rows(RoaringTreemap),
    /// 向量：按 (距离, 行地址) 升序的 top-k
    Ranked(Vec<(RowAddress, f32)>),
}

// ── 索引数据 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum IndexData {
    BTree(BTreeIndex),
    Inverted(InvertedIndex),
    Vector(VectorIndex),
}

impl IndexData {
    /// `column` 与 `row_ids` 逐行对应
    pub fn build(
        params:  &IndexParams,
        field:   &Field,
        row_ids: &[RowAddress],
        column:  &Array,
        builder: &dyn VectorIndexBuilder,
    ) -> Result<Self> {
        params.check_field(field)?;
        if column.len() != row_ids.len() {
            return Err(LanceError::invalid(format!(
                "{} values for {} row addresses", column.len(), row_ids.len())));
        }
        Ok(match params {
            IndexParams::BTree => Self::BTree(BTreeIndex::build(
                &field.data_type, column.to_values().into_iter().zip(row_ids.iter().copied()))),
            IndexParams::Inverted => {
                let values = column.to_values();
                Self::Inverted(InvertedIndex::build(
                    values.iter().map(Value::as_str).zip(row_ids.iter().copied())))
            }
            IndexParams::Vector(p) => {
                // NULL 向量不进入索引
                let live: Vec<usize> = (0..column.len()).filter(|&i| !column.is_null(i)).collect();
                let column = if live.len() == column.len() { column.clone() } else { column.take(&live)? };
                let ids: Vec<RowAddress> = live.iter().map(|&i| row_ids[i]).collect();
                let (dim, flat) = column.vector_values()?;
                Self::Vector(builder.build(p, dim, &ids, &flat)?)
            }
        })
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Self::BTree(_)    => IndexKind::BTree,
            Self::Inverted(_) => IndexKind::Inverted,
            Self::Vector(v) if v.is_quantized() => IndexKind::IvfPq,
            Self::Vector(_)   => IndexKind::IvfFlat,
        }
    }

    pub fn query(&self, query: &IndexQuery) -> Result<IndexOutput> {
        match (self, query) {
            (Self::BTree(b), IndexQuery::Scalar(q))   => Ok(IndexOutput::Rows(b.search(q))),
            (Self::Inverted(i), IndexQuery::Text(t))  => Ok(IndexOutput::Rows(i.search(t))),
            (Self::Vector(v), IndexQuery::Nearest { query, k, nprobes }) =>
                Ok(IndexOutput::Ranked(v.search(query, *k, *nprobes)?)),
            (idx, q) => Err(LanceError::invalid(format!("a {} index cannot answer {q:?}", idx.kind()))),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut w = MetaWriter::new();
        w.raw(MAGIC).u8(self.kind().tag());
        match self {
            Self::BTree(b)    => b.write_to(&mut w)?,
            Self::Inverted(i) => i.write_to(&mut w)?,
            Self::Vector(v)   => v.write_to(&mut w),
        }
        Ok(w.finish_with_crc())
    }

    pub fn deserialize(data: &[u8], path: &str) -> Result<Self> {
        let mut r = MetaReader::with_crc(data, path)?;
        if r.take(MAGIC.len())? != MAGIC {
            return Err(LanceError::corrupt(path, "invalid index file magic"));
        }
        let data = match r.u8()? {
            1 => Self::BTree(BTreeIndex::read_from(&mut r)?),
            2 => Self::Inverted(InvertedIndex::read_from(&mut r)?),
            3 | 4 => Self::Vector(VectorIndex::read_from(&mut r)?),
            other => return Err(LanceError::corrupt(path, format!("unknown index kind {other}"))),
        };
        r.finish()?;
        Ok(data)
    }
}

// ── 构建与加载 ────────────────────────────────────────────────────────────────

fn row_addresses(column: &Array) -> Vec<RowAddress> {
    column.to_values().iter()
        .filter_map(|v| match v { Value::UInt64(a) => Some(*a), _ => None })
        .collect()
}

/// 读取 `manifest` 可见的全部行，构建并写出索引文件；不提交
pub fn build_index(
    store:    &Arc<dyn ObjectStore>,
    base:     &str,
    manifest: &Manifest,
    column:   &str,
    name:     &str,
    params:   &IndexParams,
    builder:  &dyn VectorIndexBuilder,
) -> Result<(IndexMetadata, IndexData)> {
    let field = manifest.schema.require(column)?.clone();
    params.check_field(&field)?;
    let projection = Arc::new(Schema::from_parts(vec![field.clone()], manifest.schema.max_field_id));

    let mut arrays = Vec::with_capacity(manifest.fragments.len());
    let mut row_ids = Vec::new();
    let mut fragment_bitmap = RoaringBitmap::new();
    for frag in manifest.fragments.iter() {
        let reader = FragmentReader::open(store, base, frag, None)?;
        let batch = reader.read_range(&projection, 0..frag.physical_rows, true)?;
        let ids = batch.column_by_name(ROW_ID)
            .ok_or_else(|| LanceError::invalid("row address column missing from fragment read"))?;
        row_ids.extend(row_addresses(ids));
        arrays.push(batch.column(0).clone());
        let id = u32::try_from(frag.id)
            .map_err(|_| LanceError::invalid(format!("fragment id {} does not fit an index bitmap", frag.id)))?;
        fragment_bitmap.insert(id);
    }
    let refs: Vec<&Array> = arrays.iter().collect();
    let values = Array::concat(&field.data_type, &refs)?;

    let data = IndexData::build(params, &field, &row_ids, &values, builder)?;
    let uuid = Uuid::new_v4().to_string();
    let path = format!("{INDICES_DIR}/{column}-v{}-{uuid}.idx", manifest.version);
    let bytes = data.serialize()?;
    store.put(&store::join(base, &path), &bytes)?;
    info!("built {} index `{name}` on `{column}` at v{}: {} rows, {} fragments, builder {}",
          params.kind(), manifest.version, row_ids.len(), fragment_bitmap.len(), builder.name());

    let meta = IndexMetadata {
        uuid,
        name: name.to_string(),
        field_id: field.id,
        params: params.clone(),
        dataset_version: manifest.version,
        fragment_bitmap,
        path,
    };
    Ok((meta, data))
}

pub fn load_index(store: &Arc<dyn ObjectStore>, base: &str, meta: &IndexMetadata) -> Result<IndexData> {
    let full = store::join(base, &meta.path);
    let bytes = match store.get(&full) {
        Ok(b) => b,
        Err(StoreError::NotFound(_)) => return Err(LanceError::IndexNotFound(format!(
            "artifact of index `{}` missing at {}", meta.name, meta.path))),
        Err(e) => return Err(e.into()),
    };
    let data = IndexData::deserialize(&bytes, &full)?;
    if data.kind() != meta.kind() {
        return Err(LanceError::corrupt(&full, format!("holds a {} index, manifest says {}", data.kind(), meta.kind())));
    }
    Ok(data)
}

/// 会话级索引缓存（按 uuid）；加载过程不持锁
#[derive(Debug, Default)]
pub struct IndexCache {
    entries: RwLock<HashMap<String, Arc<IndexData>>>,
}

impl IndexCache {
    pub fn new() -> Self { Self::default() }

    pub fn get_or_load(&self, store: &Arc<dyn ObjectStore>, base: &str, meta: &IndexMetadata) -> Result<Arc<IndexData>> {
        if let Some(hit) = self.entries.read().get(&meta.uuid) {
            return Ok(hit.clone());
        }
        let data = Arc::new(load_index(store, base, meta)?);
        debug!("loaded index `{}` ({}) from {}", meta.name, meta.kind(), meta.path);
        Ok(self.entries.write().entry(meta.uuid.clone()).or_insert(data).clone())
    }

    pub fn insert(&self, uuid: &str, data: Arc<IndexData>) {
        self.entries.write().insert(uuid.to_string(), data);
    }

    pub fn len(&self)      -> usize { self.entries.read().len() }
    pub fn is_empty(&self) -> bool  { self.entries.read().is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::RecordBatch;
    use crate::config::WriteParams;
    use crate::fragment;
    use crate::store::MemoryObjectStore;
    use crate::transaction::{Operation, Transaction};

    fn dataset(store: &Arc<dyn ObjectStore>) -> Manifest {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("doc", DataType::Utf8, true),
            Field::vector("vec", 4),
        ]).unwrap());
        let mut frags = Vec::new();
        for f in 0..2i64 {
            let ids: Vec<i64> = (f * 50..f * 50 + 50).collect();
            let docs: Vec<String> = ids.iter().map(|i| format!("doc {} {}", i, if i % 2 == 0 { "even" } else { "odd" })).collect();
            let vecs: Vec<f32> = ids.iter().flat_map(|&i| [i as f32, 0.0, 0.0, 1.0]).collect();
            let batch = RecordBatch::try_new(schema.clone(), vec![
                Array::from_i64(ids), Array::from_strings(&docs), Array::from_vectors(4, vecs).unwrap(),
            ]).unwrap();
            frags.push(fragment::write_fragment(store, "ds", &batch, &WriteParams::default()).unwrap());
        }
        let txn = Transaction::new(0, Operation::Overwrite { fragments: frags, schema: schema.as_ref().clone() });
        txn.build_manifest(None).unwrap()
    }

    #[test]
    fn btree_artifact_is_written_and_reloaded() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let m = dataset(&store);
        let (meta, data) = build_index(&store, "ds", &m, "id", "id_idx", &IndexParams::BTree, &CpuVectorIndexBuilder).unwrap();
        assert!(meta.path.starts_with("_indices/id-v1-"));
        assert!(meta.covers(0) && meta.covers(1) && !meta.covers(2));
        assert_eq!(load_index(&store, "ds", &meta).unwrap(), data);

        let hits = data.query(&IndexQuery::Scalar(ScalarQuery::Equals(Value::Int64(75)))).unwrap();
        assert_eq!(hits, IndexOutput::Rows([crate::common::row_address(1, 25)].into_iter().collect()));
    }

    #[test]
    fn text_and_vector_indices_answer_their_queries() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let m = dataset(&store);
        let (_, inv) = build_index(&store, "ds", &m, "doc", "doc_idx", &IndexParams::Inverted, &CpuVectorIndexBuilder).unwrap();
        match inv.query(&IndexQuery::Text("ODD 7".into())).unwrap() {
            IndexOutput::Rows(r) => assert_eq!(r.len(), 1),
            other => panic!("unexpected {other:?}"),
        }

        let params = IndexParams::Vector(VectorIndexParams::ivf_flat(2, MetricType::L2));
        let (meta, ann) = build_index(&store, "ds", &m, "vec", "vec_idx", &params, &CpuVectorIndexBuilder).unwrap();
        assert_eq!(meta.kind(), IndexKind::IvfFlat);
        match ann.query(&IndexQuery::Nearest { query: vec![60.2, 0.0, 0.0, 1.0], k: 2, nprobes: 2 }).unwrap() {
            IndexOutput::Ranked(hits) => assert_eq!(hits[0].0, crate::common::row_address(1, 10)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(ann.query(&IndexQuery::Text("x".into())), Err(LanceError::InvalidInput(_))));
    }

    #[test]
    fn wrong_column_type_is_unsupported() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let m = dataset(&store);
        let err = build_index(&store, "ds", &m, "id", "x", &IndexParams::Inverted, &CpuVectorIndexBuilder).unwrap_err();
        assert!(matches!(err, LanceError::UnsupportedSchema { column, .. } if column == "id"));
    }

    #[test]
    fn cache_loads_once_and_reports_missing_artifacts() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let m = dataset(&store);
        let (meta, _) = build_index(&store, "ds", &m, "id", "id_idx", &IndexParams::BTree, &CpuVectorIndexBuilder).unwrap();
        let cache = IndexCache::new();
        let a = cache.get_or_load(&store, "ds", &meta).unwrap();
        store.delete(&store::join("ds", &meta.path)).unwrap();
        let b = cache.get_or_load(&store, "ds", &meta).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(load_index(&store, "ds", &meta), Err(LanceError::IndexNotFound(_))));
    }
}
