//! 数据集
//!
//! `Dataset` 是某个版本的只读快照加上写入入口：每次变更都构造一个
//! `Transaction`，经 `commit_transaction` 发布成新版本后把句柄前移到
//! 该版本。同一目录下的多个句柄互不共享状态，协调完全依赖版本文件的
//! put-if-absent。
//!
//! ```text
//! <root>/_versions/<N>.manifest
//!       /data/<uuid>.lance
//!       /_deletions/<fragment>-<version>-<uuid>.del
//!       /_indices/<column>-v<version>-<uuid>.idx
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use log::{debug, info, warn};
use crate::array::{Array, RecordBatch};
use crate::common::{fragment_of, offset_of, FragmentId, LanceError, Result, RowAddress, VersionNumber, VersionSpec};
use crate::commit::commit_transaction;
use crate::config::{CommitConfig, CompactionOptions, ScanOptions, WriteMode, WriteParams};
use crate::deletion::{DeletionVector, DELETIONS_DIR};
use crate::field_type::Field;
use crate::fragment::{self, Fragment, FragmentReader, DATA_DIR, ROW_ID};
use crate::index::{
    self, CpuVectorIndexBuilder, IndexCache, IndexData, IndexMetadata, IndexOutput, IndexParams, IndexQuery,
    VectorIndexBuilder, INDICES_DIR,
};
use crate::manifest::{self, Manifest, VersionInfo};
use crate::predicate::Predicate;
use crate::scanner::{self, ScanContext, Scanner};
use crate::schema::Schema;
use crate::store::{self, LocalObjectStore, ObjectStore};
use crate::transaction::{Operation, RewriteGroup, Transaction};

/// 一次 compaction 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionMetrics {
    pub fragments_removed: usize,
    pub fragments_added:   usize,
}

/// 一次清理的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub versions_removed: usize,
    pub files_removed:    usize,
}

#[derive(Debug, Clone)]
pub struct Dataset {
    store:         Arc<dyn ObjectStore>,
    base:          String,
    manifest:      Arc<Manifest>,
    cache:         Arc<IndexCache>,
    commit_config: CommitConfig,
    scan_options:  ScanOptions,
}

/// 把追加的批次对齐到数据集 schema（按列名重排，沿用已有 field id）
fn conform(schema: &Schema, batch: &RecordBatch) -> Result<RecordBatch> {
    if batch.num_columns() != schema.len() {
        return Err(LanceError::invalid(format!(
            "appended batch has columns {:?}, dataset has {:?}", batch.schema().field_names(), schema.field_names())));
    }
    let reordered = batch.project(&schema.field_names())?;
    RecordBatch::try_new(Arc::new(schema.clone()), reordered.columns().to_vec())
}

/// 按 fragment 分组，组内偏移升序去重
fn group_by_fragment(addrs: &[RowAddress]) -> BTreeMap<FragmentId, Vec<u32>> {
    let mut groups: BTreeMap<FragmentId, Vec<u32>> = BTreeMap::new();
    for &a in addrs {
        groups.entry(fragment_of(a)).or_default().push(offset_of(a));
    }
    for offsets in groups.values_mut() {
        offsets.sort_unstable();
        offsets.dedup();
    }
    groups
}

impl Dataset {
    // ── 打开 ──────────────────────────────────────────────────────────────────

    /// 打开本地目录中的最新版本
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_store(Arc::new(LocalObjectStore::new(path)), "")
    }

    pub fn open_with_store(store: Arc<dyn ObjectStore>, base: &str) -> Result<Self> {
        let manifest = manifest::read_manifest(&store, base, VersionSpec::Latest)?;
        Ok(Self::from_manifest(store, base, manifest))
    }

    fn from_manifest(store: Arc<dyn ObjectStore>, base: &str, manifest: Manifest) -> Self {
        Self {
            store,
            base:          base.to_string(),
            manifest:      Arc::new(manifest),
            cache:         Arc::new(IndexCache::new()),
            commit_config: CommitConfig::default(),
            scan_options:  ScanOptions::default(),
        }
    }

    /// 同一存储上的另一个版本；索引缓存共享
    pub fn checkout_version(&self, version: VersionNumber) -> Result<Self> {
        let manifest = manifest::read_manifest(&self.store, &self.base, version.into())?;
        Ok(Self { manifest: Arc::new(manifest), ..self.clone() })
    }

    pub fn checkout_latest(&self) -> Result<Self> {
        let manifest = manifest::read_manifest(&self.store, &self.base, VersionSpec::Latest)?;
        Ok(Self { manifest: Arc::new(manifest), ..self.clone() })
    }

    pub fn with_commit_config(mut self, config: CommitConfig) -> Self {
        self.commit_config = config; self
    }

    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.scan_options = options; self
    }

    // ── 写入 ──────────────────────────────────────────────────────────────────

    /// 按 `params.mode` 在本地目录创建 / 追加 / 覆盖
    pub fn write(path: impl AsRef<Path>, batches: &[RecordBatch], params: &WriteParams) -> Result<Self> {
        let uri = path.as_ref().display().to_string();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(path));
        Self::write_impl(store, "", &uri, batches, params)
    }

    pub fn write_with_store(
        store:   Arc<dyn ObjectStore>,
        base:    &str,
        batches: &[RecordBatch],
        params:  &WriteParams,
    ) -> Result<Self> {
        Self::write_impl(store, base, base, batches, params)
    }

    fn write_impl(
        store:   Arc<dyn ObjectStore>,
        base:    &str,
        uri:     &str,
        batches: &[RecordBatch],
        params:  &WriteParams,
    ) -> Result<Self> {
        let first = batches.first()
            .ok_or_else(|| LanceError::invalid("writing a dataset needs at least one batch (it may be empty)"))?;
        let latest = manifest::latest_version(&store, base)?;

        let (read_version, operation, commit) = match (params.mode, latest) {
            (WriteMode::Create, Some(_)) => return Err(LanceError::DatasetAlreadyExists(uri.into())),
            (WriteMode::Append, Some(v)) => {
                let current = manifest::read_manifest(&store, base, v.into())?;
                let conformed = batches.iter()
                    .map(|b| conform(&current.schema, b))
                    .collect::<Result<Vec<_>>>()?;
                let fragments = fragment::write_fragments(&store, base, &conformed, params)?;
                (v, Operation::Append { fragments }, params.commit)
            }
            (mode, latest) => {
                first.schema().validate()?;
                let fragments = fragment::write_fragments(&store, base, batches, params)?;
                let op = Operation::Overwrite { fragments, schema: first.schema().as_ref().clone() };
                // 创建时不重试：输掉竞争意味着别人已经创建了数据集
                let commit = match (mode, latest) {
                    (WriteMode::Overwrite, Some(_)) => params.commit,
                    _ => params.commit.with_max_retries(0),
                };
                (latest.unwrap_or(0), op, commit)
            }
        };

        let creating = read_version == 0;
        let txn = Transaction::new(read_version, operation).with_author(params.author.clone());
        let result = match commit_transaction(&store, base, &txn, &commit) {
            Err(LanceError::CommitConflict { .. }) if creating => return Err(LanceError::DatasetAlreadyExists(uri.into())),
            other => other?,
        };
        Ok(Self::from_manifest(store, base, result.manifest).with_commit_config(params.commit))
    }

    // ── 元数据 ────────────────────────────────────────────────────────────────

    pub fn version(&self)   -> VersionNumber      { self.manifest.version }
    pub fn manifest(&self)  -> &Arc<Manifest>     { &self.manifest }
    pub fn schema(&self)    -> &Schema            { &self.manifest.schema }
    pub fn fragments(&self) -> &[Fragment]        { &self.manifest.fragments }
    pub fn indices(&self)   -> &[IndexMetadata]   { &self.manifest.indices }
    pub fn store(&self)     -> &Arc<dyn ObjectStore> { &self.store }

    pub fn latest_version(&self) -> Result<VersionNumber> {
        manifest::latest_version(&self.store, &self.base)?
            .ok_or(LanceError::VersionNotFound(VersionSpec::Latest))
    }

    /// 存储中仍存在的全部版本，升序
    pub fn versions(&self) -> Result<Vec<VersionInfo>> {
        let mut out = Vec::new();
        for v in manifest::list_versions(&self.store, &self.base)? {
            match manifest::read_manifest(&self.store, &self.base, v.into()) {
                Ok(m) => out.push(VersionInfo::from(&m)),
                // 列出之后被清理
                Err(LanceError::VersionNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    fn context(&self) -> ScanContext {
        ScanContext {
            store:    self.store.clone(),
            base:     self.base.clone(),
            manifest: self.manifest.clone(),
            cache:    self.cache.clone(),
        }
    }

    pub fn scan(&self) -> Scanner {
        Scanner::new(self.context(), &self.scan_options)
    }

    pub fn count_rows(&self, filter: Option<Predicate>) -> Result<u64> {
        match filter {
            Some(p) => self.scan().filter(p).count_rows(),
            None    => Ok(self.manifest.num_rows()),
        }
    }

    /// 按行地址取行，结果按请求顺序排列并以 `_rowid` 结尾；已删除的行不出现
    pub fn take<S: AsRef<str>>(&self, addrs: &[RowAddress], columns: &[S]) -> Result<RecordBatch> {
        let projection = Arc::new(self.manifest.schema.project(columns)?);
        scanner::take_rows(&self.context(), &projection, addrs)
    }

    /// 直接查询某个索引（不做过期补齐）
    pub fn query_index(&self, name: &str, query: &IndexQuery) -> Result<IndexOutput> {
        let meta = self.manifest.index(name)
            .ok_or_else(|| LanceError::IndexNotFound(name.into()))?;
        self.cache.get_or_load(&self.store, &self.base, meta)?.query(query)
    }

    // ── 提交 ──────────────────────────────────────────────────────────────────

    /// 基于当前版本提交一个操作，成功后句柄前移到新版本
    pub fn commit(&mut self, operation: Operation, author: Option<String>) -> Result<VersionNumber> {
        let txn = Transaction::new(self.manifest.version, operation).with_author(author);
        let result = commit_transaction(&self.store, &self.base, &txn, &self.commit_config)?;
        self.manifest = Arc::new(result.manifest);
        Ok(self.manifest.version)
    }

    // ── 数据变更 ──────────────────────────────────────────────────────────────

    pub fn append(&mut self, batches: &[RecordBatch], params: &WriteParams) -> Result<VersionNumber> {
        let conformed = batches.iter()
            .map(|b| conform(&self.manifest.schema, b))
            .collect::<Result<Vec<_>>>()?;
        let fragments = fragment::write_fragments(&self.store, &self.base, &conformed, params)?;
        self.commit(Operation::Append { fragments }, params.author.clone())
    }

    pub fn overwrite(&mut self, batches: &[RecordBatch], params: &WriteParams) -> Result<VersionNumber> {
        let first = batches.first()
            .ok_or_else(|| LanceError::invalid("overwrite needs at least one batch (it may be empty)"))?;
        first.schema().validate()?;
        let fragments = fragment::write_fragments(&self.store, &self.base, batches, params)?;
        let schema = first.schema().as_ref().clone();
        self.commit(Operation::Overwrite { fragments, schema }, params.author.clone())
    }

    /// 删除满足谓词的行，返回删除的行数；没有命中时不产生新版本
    pub fn delete(&mut self, predicate: &Predicate) -> Result<u64> {
        let hits = self.scan()
            .project::<&str>(&[])
            .filter(predicate.clone())
            .with_row_id()
            .try_into_batch()?;
        let addrs = hits.column_by_name(ROW_ID).map(scanner::row_addresses).unwrap_or_default();
        self.delete_addresses(&addrs, predicate.to_string())
    }

    /// 按行地址删除；已删除的行忽略
    pub fn delete_rows(&mut self, addrs: &[RowAddress]) -> Result<u64> {
        self.delete_addresses(addrs, format!("{} row addresses", addrs.len()))
    }

    fn delete_addresses(&mut self, addrs: &[RowAddress], predicate: String) -> Result<u64> {
        let mut updated_fragments = Vec::new();
        let mut deleted_fragment_ids = Vec::new();
        let mut removed = 0u64;
        for (id, offsets) in group_by_fragment(addrs) {
            let frag = self.manifest.fragment(id)
                .ok_or_else(|| LanceError::invalid(format!("fragment {id} is not part of version {}", self.version())))?;
            if let Some(&bad) = offsets.iter().find(|&&o| o as u64 >= frag.physical_rows) {
                return Err(LanceError::invalid(format!(
                    "row offset {bad} out of range for fragment {id} ({} rows)", frag.physical_rows)));
            }
            let existing = fragment::load_deletions(&self.store, &self.base, frag)?;
            let fresh: Vec<u32> = offsets.into_iter().filter(|&o| !existing.contains(o)).collect();
            if fresh.is_empty() {
                continue;
            }
            removed += fresh.len() as u64;
            if existing.len() + fresh.len() as u64 == frag.physical_rows {
                deleted_fragment_ids.push(id);
            } else {
                updated_fragments.push(fragment::delete_rows(&self.store, &self.base, frag, &fresh, self.version())?);
            }
        }
        if removed == 0 {
            debug!("delete `{predicate}` matched no live rows at v{}", self.version());
            return Ok(0);
        }
        info!("deleting {removed} rows: {} fragments updated, {} removed",
              updated_fragments.len(), deleted_fragment_ids.len());
        self.commit(Operation::Delete { updated_fragments, deleted_fragment_ids, predicate }, None)?;
        Ok(removed)
    }

    // ── Schema 演进 ───────────────────────────────────────────────────────────

    /// 只改 schema 的新列，旧行读出为 NULL
    pub fn add_null_columns(&mut self, fields: Vec<Field>) -> Result<VersionNumber> {
        if let Some(f) = fields.iter().find(|f| !f.nullable) {
            return Err(LanceError::unsupported(&f.name, "a column added without data must be nullable"));
        }
        let schema = self.manifest.schema.add_fields(fields)?;
        self.commit(Operation::Project { schema }, None)
    }

    /// 由已有列计算新列：每个 fragment 写出一个只含新列的数据文件
    ///
    /// `compute` 收到 fragment 的全部物理行（含已删除的），须按 `fields`
    /// 的顺序返回等长的列。
    pub fn add_columns<F>(
        &mut self,
        fields:       Vec<Field>,
        read_columns: &[&str],
        compute:      F,
        params:       &WriteParams,
    ) -> Result<VersionNumber>
    where
        F: Fn(&RecordBatch) -> Result<Vec<Array>>,
    {
        if read_columns.is_empty() {
            return Err(LanceError::invalid("computed columns need at least one input column"));
        }
        let old_len = self.manifest.schema.len();
        let schema = self.manifest.schema.add_fields(fields)?;
        let added = Arc::new(Schema::from_parts(schema.fields[old_len..].to_vec(), schema.max_field_id));
        let input = Arc::new(self.manifest.schema.project(read_columns)?);
        let everything = Arc::new(DeletionVector::new());

        let mut merged = Vec::with_capacity(self.manifest.fragments.len());
        for frag in self.manifest.fragments.iter() {
            let reader = FragmentReader::open(&self.store, &self.base, frag, Some(everything.clone()))?;
            let rows = reader.read_range(&input, 0..frag.physical_rows, false)?;
            let columns = compute(&rows)?;
            let batch = RecordBatch::try_new(added.clone(), columns)?;
            merged.push(fragment::add_data_file(&self.store, &self.base, frag, &batch, params)?);
        }
        self.commit(Operation::Merge { fragments: merged, schema }, params.author.clone())
    }

    pub fn drop_columns<S: AsRef<str>>(&mut self, names: &[S]) -> Result<VersionNumber> {
        let schema = self.manifest.schema.drop_fields(names)?;
        if schema.is_empty() {
            return Err(LanceError::invalid("cannot drop every column of a dataset"));
        }
        self.commit(Operation::Project { schema }, None)
    }

    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<VersionNumber> {
        let schema = self.manifest.schema.rename_field(old, new)?;
        self.commit(Operation::Project { schema }, None)
    }

    // ── 索引 ──────────────────────────────────────────────────────────────────

    /// 用 CPU 构建器建索引；`name` 缺省为 `<column>_idx`，同名旧索引被替换
    pub fn create_index(&mut self, column: &str, name: Option<&str>, params: &IndexParams) -> Result<IndexMetadata> {
        self.create_index_with_builder(column, name, params, &CpuVectorIndexBuilder)
    }

    pub fn create_index_with_builder(
        &mut self,
        column:  &str,
        name:    Option<&str>,
        params:  &IndexParams,
        builder: &dyn VectorIndexBuilder,
    ) -> Result<IndexMetadata> {
        let name = name.map(str::to_string).unwrap_or_else(|| format!("{column}_idx"));
        let (meta, data) = index::build_index(&self.store, &self.base, &self.manifest, column, &name, params, builder)?;
        let removed_indices: Vec<IndexMetadata> = self.manifest.index(&name).into_iter().cloned().collect();
        self.commit(Operation::CreateIndex { new_indices: vec![meta.clone()], removed_indices }, None)?;
        self.cache.insert(&meta.uuid, Arc::new(data));
        Ok(meta)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<VersionNumber> {
        let meta = self.manifest.index(name)
            .ok_or_else(|| LanceError::IndexNotFound(name.into()))?
            .clone();
        self.commit(Operation::CreateIndex { new_indices: Vec::new(), removed_indices: vec![meta] }, None)
    }

    /// 已加载（或按需加载）的索引数据
    pub fn load_index(&self, name: &str) -> Result<Arc<IndexData>> {
        let meta = self.manifest.index(name)
            .ok_or_else(|| LanceError::IndexNotFound(name.into()))?;
        self.cache.get_or_load(&self.store, &self.base, meta)
    }

    // ── 维护 ──────────────────────────────────────────────────────────────────

    /// 把当前检出的版本提交为新的最新版本
    pub fn restore(&mut self) -> Result<VersionNumber> {
        let m = self.manifest.clone();
        let op = Operation::Restore {
            version:   m.version,
            schema:    m.schema.clone(),
            fragments: m.fragments.as_ref().clone(),
            indices:   m.indices.clone(),
        };
        let restored = self.commit(op, None)?;
        info!("restored v{} as v{restored}", m.version);
        Ok(restored)
    }

    /// 合并过小的相邻 fragment，并按需物化删除；行的相对顺序不变
    pub fn compact_files(&mut self, options: &CompactionOptions, params: &WriteParams) -> Result<CompactionMetrics> {
        let target = options.target_rows_per_fragment.max(1);
        let needs_rewrite = |f: &Fragment| {
            (f.num_rows() as usize) < target || (options.materialize_deletions && f.num_deleted() > 0)
        };

        let mut candidates: Vec<Vec<Fragment>> = Vec::new();
        let mut run: Vec<Fragment> = Vec::new();
        for frag in self.manifest.fragments.iter() {
            if needs_rewrite(frag) {
                run.push(frag.clone());
            } else if !run.is_empty() {
                candidates.push(std::mem::take(&mut run));
            }
        }
        if !run.is_empty() {
            candidates.push(run);
        }
        // 单个无删除的小 fragment 重写没有收益
        candidates.retain(|g| g.len() > 1 || g.iter().any(|f| f.num_deleted() > 0));
        if candidates.is_empty() {
            debug!("nothing to compact at v{}", self.version());
            return Ok(CompactionMetrics::default());
        }

        let schema = Arc::new(self.manifest.schema.clone());
        let params = params.clone().with_max_rows_per_file(target);
        let mut metrics = CompactionMetrics::default();
        let mut groups = Vec::with_capacity(candidates.len());
        for old_fragments in candidates {
            let mut batches = Vec::with_capacity(old_fragments.len());
            for frag in &old_fragments {
                let reader = FragmentReader::open(&self.store, &self.base, frag, None)?;
                batches.push(reader.read_range(&schema, 0..frag.physical_rows, false)?);
            }
            let new_fragments = fragment::write_fragments(&self.store, &self.base, &batches, &params)?;
            metrics.fragments_removed += old_fragments.len();
            metrics.fragments_added += new_fragments.len();
            groups.push(RewriteGroup { old_fragments, new_fragments });
        }
        self.commit(Operation::Rewrite { groups }, params.author.clone())?;
        info!("compacted v{}: {} fragments rewritten into {}",
              self.version(), metrics.fragments_removed, metrics.fragments_added);
        Ok(metrics)
    }

    /// 删除版本号小于 `keep_from` 的 manifest（最新版本总是保留），以及保留
    /// 版本都不再引用的数据 / 删除 / 索引文件
    ///
    /// 不能与写入者并发运行：尚未提交的新文件同样不被任何 manifest 引用。
    pub fn cleanup_old_versions(&self, keep_from: VersionNumber) -> Result<CleanupStats> {
        let versions = manifest::list_versions(&self.store, &self.base)?;
        let Some(&latest) = versions.last() else { return Ok(CleanupStats::default()) };
        let cutoff = keep_from.min(latest);

        let mut referenced: HashSet<String> = HashSet::new();
        for &v in versions.iter().filter(|&&v| v >= cutoff) {
            let m = manifest::read_manifest(&self.store, &self.base, v.into())?;
            for frag in m.fragments.iter() {
                referenced.extend(frag.paths().map(|p| store::join(&self.base, p)));
            }
            referenced.extend(m.indices.iter().map(|i| store::join(&self.base, &i.path)));
        }

        let mut stats = CleanupStats::default();
        for &v in versions.iter().filter(|&&v| v < cutoff) {
            self.store.delete(&manifest::manifest_path(&self.base, v))?;
            stats.versions_removed += 1;
        }
        for dir in [DATA_DIR, DELETIONS_DIR, INDICES_DIR] {
            for path in self.store.list(&store::join(&self.base, dir))? {
                if !referenced.contains(&path) {
                    self.store.delete(&path)?;
                    stats.files_removed += 1;
                }
            }
        }
        if self.version() < cutoff {
            warn!("cleanup removed v{}, which this handle still points at", self.version());
        }
        info!("cleanup below v{cutoff}: {} versions, {} files removed",
              stats.versions_removed, stats.files_removed);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::{DataType, Value};
    use crate::store::MemoryObjectStore;

    fn batch(ids: std::ops::Range<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]).unwrap());
        let names: Vec<String> = ids.clone().map(|i| format!("row-{i}")).collect();
        RecordBatch::try_new(schema, vec![Array::from_i64(ids.collect()), Array::from_strings(&names)]).unwrap()
    }

    fn create(store: &Arc<dyn ObjectStore>, rows: std::ops::Range<i64>) -> Dataset {
        Dataset::write_with_store(store.clone(), "ds", &[batch(rows)], &WriteParams::default()).unwrap()
    }

    fn ids(ds: &Dataset) -> Vec<i64> {
        let b = ds.scan().project(&["id"]).try_into_batch().unwrap();
        b.column(0).to_values().into_iter()
            .map(|v| match v { Value::Int64(i) => i, other => panic!("unexpected {other:?}") })
            .collect()
    }

    #[test]
    fn create_twice_is_rejected() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let ds = create(&store, 0..5);
        assert_eq!(ds.version(), 1);
        let err = Dataset::write_with_store(store, "ds", &[batch(0..5)], &WriteParams::default()).unwrap_err();
        assert!(matches!(err, LanceError::DatasetAlreadyExists(_)));
    }

    #[test]
    fn append_reorders_columns_by_name() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut ds = create(&store, 0..3);
        let swapped = batch(3..5).project(&["name", "id"]).unwrap();
        ds.append(&[swapped], &WriteParams::default()).unwrap();
        assert_eq!(ids(&ds), vec![0, 1, 2, 3, 4]);
        assert_eq!(ds.fragments().iter().map(|f| f.id).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn delete_whole_fragment_removes_it() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut ds = create(&store, 0..3);
        ds.append(&[batch(3..6)], &WriteParams::default()).unwrap();
        assert_eq!(ds.delete(&Predicate::lt("id", 3i64)).unwrap(), 3);
        assert_eq!(ds.fragments().len(), 1);
        assert_eq!(ids(&ds), vec![3, 4, 5]);
        // 再删一次不产生新版本
        let v = ds.version();
        assert_eq!(ds.delete(&Predicate::lt("id", 3i64)).unwrap(), 0);
        assert_eq!(ds.version(), v);
    }

    #[test]
    fn null_column_must_be_nullable() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut ds = create(&store, 0..3);
        let err = ds.add_null_columns(vec![Field::new("score", DataType::Float64, false)]).unwrap_err();
        assert!(matches!(err, LanceError::UnsupportedSchema { .. }));
        ds.add_null_columns(vec![Field::new("score", DataType::Float64, true)]).unwrap();
        let b = ds.scan().project(&["score"]).try_into_batch().unwrap();
        assert_eq!(b.column(0).null_count(), 3);
    }

    #[test]
    fn take_follows_request_order() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut ds = create(&store, 0..4);
        ds.delete_rows(&[1]).unwrap();
        let b = ds.take(&[3, 1, 0], &["id"]).unwrap();
        assert_eq!(b.column(0).to_values(), vec![Value::Int64(3), Value::Int64(0)]);
        assert_eq!(b.schema().field_names(), vec!["id", ROW_ID]);
    }
}
