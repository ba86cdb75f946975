//! 扫描引擎
//!
//! ```text
//! Scanner ──plan()──► ScanPlan ──execute()──► ScanStream
//! (Planning)                                  Executing ─► Exhausted
//! ```
//!
//! - 普通扫描：按 fragment 顺序逐段读取；带过滤条件时先用页 zone map
//!   排除不可能命中的行段，再逐行求值。
//! - 标量索引：过滤条件中某个合取项有可用索引时，索引给出候选行，
//!   按行偏移读取后再用完整过滤条件复核。
//! - 向量检索：索引覆盖的 fragment 走 ANN，其余 fragment 平扫计算精确
//!   距离，合并后按 (距离, 行地址) 取前 k，输出附带 `_distance` 列。
//!
//! 索引未覆盖的 fragment（构建之后追加的）一律平扫补齐，计划中把索引
//! 标记为 stale 并列出这些 fragment。
//!
//! `ScanStream` 只能消费一次；结束或出错后保持 Exhausted。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use log::{debug, warn};
use crate::array::{Array, RecordBatch};
use crate::common::{fragment_of, offset_of, FragmentId, LanceError, Result, RowAddress, VersionNumber};
use crate::config::ScanOptions;
use crate::field_type::{DataType, Field, Value};
use crate::fragment::{self, Fragment, FragmentReader, ROW_ID};
use crate::index::vector::{top_k, DEFAULT_NPROBES};
use crate::index::{IndexCache, IndexData, IndexKind, IndexMetadata, IndexOutput, IndexParams, IndexQuery, MetricType};
use crate::manifest::Manifest;
use crate::predicate::{Predicate, ZoneStats};
use crate::schema::Schema;
use crate::store::ObjectStore;

/// 向量检索结果的距离列
pub const DISTANCE: &str = "_distance";

pub fn distance_field() -> Field {
    Field::new(DISTANCE, DataType::Float32, false)
}

/// 扫描所需的数据集快照
#[derive(Debug, Clone)]
pub(crate) struct ScanContext {
    pub store:    Arc<dyn ObjectStore>,
    pub base:     String,
    pub manifest: Arc<Manifest>,
    pub cache:    Arc<IndexCache>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Planning,
    Executing,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearestQuery {
    pub column:        String,
    pub query:         Vec<f32>,
    pub k:             usize,
    pub nprobes:       usize,
    /// 取 k × refine_factor 个候选，读原始向量重新计算精确距离
    pub refine_factor: Option<u32>,
    /// None 时沿用索引的度量（无索引时 L2）
    pub metric:        Option<MetricType>,
}

// ── Scanner ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Scanner {
    ctx:         ScanContext,
    projection:  Option<Vec<String>>,
    filter:      Option<Predicate>,
    nearest:     Option<NearestQuery>,
    prefilter:   bool,
    with_row_id: bool,
    limit:       Option<usize>,
    offset:      usize,
    batch_size:  usize,
    use_index:   bool,
}

impl Scanner {
    pub(crate) fn new(ctx: ScanContext, options: &ScanOptions) -> Self {
        Self {
            ctx,
            projection:  None,
            filter:      None,
            nearest:     None,
            prefilter:   false,
            with_row_id: false,
            limit:       None,
            offset:      0,
            batch_size:  options.batch_size.max(1),
            use_index:   true,
        }
    }

    pub fn project<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.projection = Some(columns.iter().map(|c| c.as_ref().to_string()).collect());
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn nearest(mut self, column: &str, query: &[f32], k: usize) -> Self {
        let prev = self.nearest.take();
        self.nearest = Some(NearestQuery {
            column:        column.into(),
            query:         query.to_vec(),
            k,
            nprobes:       prev.as_ref().map(|p| p.nprobes).unwrap_or(DEFAULT_NPROBES),
            refine_factor: prev.as_ref().and_then(|p| p.refine_factor),
            metric:        prev.and_then(|p| p.metric),
        });
        self
    }

    pub fn nprobes(mut self, n: usize) -> Self {
        if let Some(q) = self.nearest.as_mut() { q.nprobes = n.max(1); }
        self
    }

    pub fn refine_factor(mut self, factor: u32) -> Self {
        if let Some(q) = self.nearest.as_mut() { q.refine_factor = Some(factor.max(1)); }
        self
    }

    pub fn distance_metric(mut self, metric: MetricType) -> Self {
        if let Some(q) = self.nearest.as_mut() { q.metric = Some(metric); }
        self
    }

    /// 向量检索前先应用过滤条件（默认在检索之后过滤）
    pub fn prefilter(mut self, yes: bool) -> Self {
        self.prefilter = yes;
        self
    }

    pub fn with_row_id(mut self) -> Self {
        self.with_row_id = true;
        self
    }

    pub fn limit(mut self, limit: Option<usize>, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn use_index(mut self, yes: bool) -> Self {
        self.use_index = yes;
        self
    }

    // ── 规划 ──────────────────────────────────────────────────────────────────

    pub fn plan(&self) -> Result<ScanPlan> {
        let manifest = &self.ctx.manifest;
        let schema = &manifest.schema;

        let output_names: Vec<String> = match &self.projection {
            Some(p) => p.clone(),
            None    => schema.fields.iter().map(|f| f.name.clone()).collect(),
        };
        let output = schema.project(&output_names)?;
        if output.is_empty() && !self.with_row_id && self.nearest.is_none() {
            return Err(LanceError::invalid("scan must produce at least one column"));
        }
        if let Some(f) = &self.filter {
            f.validate(schema)?;
        }
        if let Some(q) = &self.nearest {
            Self::check_nearest(schema, q)?;
        }

        // 读取列 = 输出列 ∪ 过滤列 ∪ 向量列，保持 schema 顺序
        let mut needed: BTreeSet<&str> = output_names.iter().map(String::as_str).collect();
        if let Some(f) = &self.filter {
            needed.extend(f.columns());
        }
        if let Some(q) = &self.nearest {
            needed.insert(q.column.as_str());
        }
        let read_names: Vec<&str> = schema.fields.iter()
            .map(|f| f.name.as_str())
            .filter(|n| needed.contains(n))
            .collect();
        let read = Arc::new(schema.project(&read_names)?);

        let (source, index_usage) = match &self.nearest {
            Some(q) => self.plan_ann(q),
            None    => self.plan_filter(),
        };
        if let Some(u) = index_usage.as_ref().filter(|u| u.is_stale()) {
            warn!("index `{}` on `{}` does not cover fragments {:?}; they are answered by a flat scan",
                  u.name, u.column, u.unindexed_fragments);
        }

        let mut columns = output_names;
        if self.nearest.is_some() {
            columns.push(DISTANCE.into());
        }
        if self.with_row_id {
            columns.push(ROW_ID.into());
        }
        let plan = ScanPlan {
            ctx: self.ctx.clone(),
            output: Arc::new(output),
            read,
            columns,
            filter: self.filter.clone(),
            prefilter: self.prefilter,
            source,
            index_usage,
            with_row_id: self.with_row_id,
            limit: self.limit,
            offset: self.offset,
            batch_size: self.batch_size,
        };
        debug!("scan plan:\n{}", plan.explain());
        Ok(plan)
    }

    fn check_nearest(schema: &Schema, q: &NearestQuery) -> Result<()> {
        let field = schema.require(&q.column)?;
        let Some(dim) = field.data_type.vector_dim() else {
            return Err(LanceError::unsupported(&q.column, format!(
                "nearest-neighbour search needs a float vector column, found {}", field.data_type)));
        };
        if q.query.len() != dim {
            return Err(LanceError::invalid(format!(
                "query vector has dimension {}, column `{}` has {dim}", q.query.len(), q.column)));
        }
        if q.k == 0 {
            return Err(LanceError::invalid("k must be at least 1"));
        }
        Ok(())
    }

    fn usage(&self, meta: &IndexMetadata, column: &str) -> IndexUsage {
        let (indexed, unindexed): (Vec<&Fragment>, Vec<&Fragment>) =
            self.ctx.manifest.fragments.iter().partition(|f| meta.covers(f.id));
        IndexUsage {
            name:                meta.name.clone(),
            kind:                meta.kind(),
            column:              column.to_string(),
            built_at:            meta.dataset_version,
            indexed_fragments:   indexed.iter().map(|f| f.id).collect(),
            unindexed_fragments: unindexed.iter().map(|f| f.id).collect(),
        }
    }

    fn plan_ann(&self, q: &NearestQuery) -> (Source, Option<IndexUsage>) {
        let schema = &self.ctx.manifest.schema;
        let index = schema.field(&q.column).and_then(|field| {
            self.ctx.manifest.indices.iter().find(|i| {
                let metric_ok = match (&i.params, q.metric) {
                    (IndexParams::Vector(p), Some(m)) => p.metric == m,
                    (IndexParams::Vector(_), None)    => true,
                    _ => false,
                };
                self.use_index && i.field_id == field.id && metric_ok
            })
        });
        let metric = q.metric
            .or_else(|| index.and_then(|i| match &i.params {
                IndexParams::Vector(p) => Some(p.metric),
                _ => None,
            }))
            .unwrap_or_default();
        let usage = index.map(|i| self.usage(i, &q.column));
        (Source::Ann { query: q.clone(), metric, index: index.cloned() }, usage)
    }

    fn plan_filter(&self) -> (Source, Option<IndexUsage>) {
        let Some(filter) = self.filter.as_ref().filter(|_| self.use_index) else {
            return (Source::Scan, None);
        };
        let schema = &self.ctx.manifest.schema;
        for conjunct in filter.conjuncts() {
            let Some((column, kind, query)) = conjunct.index_query() else { continue };
            let Some(field) = schema.field(column) else { continue };
            let found = self.ctx.manifest.indices.iter().find(|i| i.field_id == field.id && i.kind() == kind);
            if let Some(meta) = found {
                let usage = self.usage(meta, column);
                return (Source::ScalarIndex { meta: meta.clone(), query }, Some(usage));
            }
        }
        (Source::Scan, None)
    }

    // ── 快捷入口 ──────────────────────────────────────────────────────────────

    pub fn try_into_stream(&self) -> Result<ScanStream> {
        self.plan()?.execute()
    }

    /// 全部结果拼成一个批次
    pub fn try_into_batch(&self) -> Result<RecordBatch> {
        let plan = self.plan()?;
        let schema = plan.output_schema();
        let batches = plan.execute()?.collect::<Result<Vec<_>>>()?;
        RecordBatch::concat(schema, &batches)
    }

    /// 满足过滤条件的行数（忽略投影）
    pub fn count_rows(&self) -> Result<u64> {
        if self.filter.is_none() && self.nearest.is_none() && self.limit.is_none() && self.offset == 0 {
            return Ok(self.ctx.manifest.num_rows());
        }
        let columns: Vec<String> = match &self.filter {
            Some(f) => f.columns().into_iter().map(String::from).collect(),
            None    => Vec::new(),
        };
        let mut counting = self.clone().project(&columns);
        counting.with_row_id = true;
        let mut n = 0u64;
        for batch in counting.try_into_stream()? {
            n += batch?.num_rows() as u64;
        }
        Ok(n)
    }
}

// ── ScanPlan ──────────────────────────────────────────────────────────────────

/// 计划用到的索引及其覆盖情况
#[derive(Debug, Clone, PartialEq)]
pub struct IndexUsage {
    pub name:                String,
    pub kind:                IndexKind,
    pub column:              String,
    pub built_at:            VersionNumber,
    pub indexed_fragments:   Vec<FragmentId>,
    /// 索引构建后新增、需要平扫的 fragment
    pub unindexed_fragments: Vec<FragmentId>,
}

impl IndexUsage {
    pub fn is_stale(&self) -> bool { !self.unindexed_fragments.is_empty() }
}

#[derive(Debug, Clone)]
enum Source {
    Scan,
    ScalarIndex { meta: IndexMetadata, query: IndexQuery },
    Ann { query: NearestQuery, metric: MetricType, index: Option<IndexMetadata> },
}

#[derive(Debug, Clone)]
pub struct ScanPlan {
    ctx:         ScanContext,
    /// 用户可见列（不含派生列）
    output:      Arc<Schema>,
    read:        Arc<Schema>,
    /// 最终输出列名（含 `_distance` / `_rowid`）
    columns:     Vec<String>,
    filter:      Option<Predicate>,
    prefilter:   bool,
    source:      Source,
    index_usage: Option<IndexUsage>,
    with_row_id: bool,
    limit:       Option<usize>,
    offset:      usize,
    batch_size:  usize,
}

impl ScanPlan {
    pub fn state(&self) -> ScanState { ScanState::Planning }

    pub fn version(&self) -> VersionNumber { self.ctx.manifest.version }

    pub fn index_usage(&self) -> Option<&IndexUsage> { self.index_usage.as_ref() }

    pub fn output_schema(&self) -> Arc<Schema> {
        let mut fields = self.output.fields.clone();
        if matches!(self.source, Source::Ann { .. }) {
            fields.push(distance_field());
        }
        if self.with_row_id {
            fields.push(fragment::row_id_field());
        }
        Arc::new(Schema::from_parts(fields, self.output.max_field_id))
    }

    pub fn explain(&self) -> String {
        let m = &self.ctx.manifest;
        let mut s = String::new();
        let _ = writeln!(s, "Scan v{}: {} fragments, {} rows", m.version, m.fragments.len(), m.num_rows());
        let _ = writeln!(s, "  Project: [{}]", self.columns.join(", "));
        if let Some(f) = &self.filter {
            let when = match (&self.source, self.prefilter) {
                (Source::Ann { .. }, true)  => " (prefilter)",
                (Source::Ann { .. }, false) => " (postfilter)",
                _ => "",
            };
            let _ = writeln!(s, "  Filter: {f}{when}");
        }
        match &self.source {
            Source::Scan => {
                let _ = writeln!(s, "  Source: full scan with zone-map pruning");
            }
            Source::ScalarIndex { meta, .. } => {
                let _ = writeln!(s, "  Source: {} index `{}`", meta.kind(), meta.name);
            }
            Source::Ann { query, metric, index } => {
                let via = match index {
                    Some(i) => format!("{} index `{}`", i.kind(), i.name),
                    None    => "flat search".into(),
                };
                let refine = query.refine_factor.map(|r| format!(", refine={r}")).unwrap_or_default();
                let _ = writeln!(s, "  Source: nearest `{}` k={} nprobes={} metric={metric}{refine} via {via}",
                                 query.column, query.k, query.nprobes);
            }
        }
        if let Some(u) = &self.index_usage {
            if u.is_stale() {
                let _ = writeln!(s, "  Stale index `{}` (built at v{}): fragments {:?} unindexed, flat scanned",
                                 u.name, u.built_at, u.unindexed_fragments);
            }
        }
        if self.limit.is_some() || self.offset > 0 {
            let limit = self.limit.map(|l| l.to_string()).unwrap_or_else(|| "all".into());
            let _ = writeln!(s, "  Limit: {limit} offset {}", self.offset);
        }
        s
    }

    // ── 执行 ──────────────────────────────────────────────────────────────────

    pub fn execute(self) -> Result<ScanStream> {
        let executor = match &self.source {
            Source::Scan => {
                let tasks = self.ctx.manifest.fragments.iter()
                    .map(|f| FragmentTask { fragment: f.clone(), rows: RowSelection::All })
                    .collect();
                Executor::Fragments(self.fragment_scan(tasks, self.filter.clone()))
            }
            Source::ScalarIndex { meta, query } => {
                let tasks = self.index_tasks(meta, query)?;
                Executor::Fragments(self.fragment_scan(tasks, self.filter.clone()))
            }
            Source::Ann { query, metric, index } => {
                Executor::Materialized(self.run_ann(query, *metric, index.as_ref())?)
            }
        };
        Ok(ScanStream {
            schema:  self.output_schema(),
            state:   StreamState::Executing(Box::new(executor)),
            limiter: Limiter { skip: self.offset, remaining: self.limit },
        })
    }

    fn fragment_scan(&self, tasks: VecDeque<FragmentTask>, filter: Option<Predicate>) -> FragmentScan {
        FragmentScan {
            store:       self.ctx.store.clone(),
            base:        self.ctx.base.clone(),
            read:        self.read.clone(),
            columns:     self.columns.clone(),
            filter,
            batch_size:  self.batch_size,
            with_row_id: self.with_row_id,
            tasks,
            active:      None,
            pruned:      0,
        }
    }

    /// 覆盖的 fragment 只读索引命中的行，其余 fragment 全量扫描
    fn index_tasks(&self, meta: &IndexMetadata, query: &IndexQuery) -> Result<VecDeque<FragmentTask>> {
        let data = self.ctx.cache.get_or_load(&self.ctx.store, &self.ctx.base, meta)?;
        let IndexOutput::Rows(rows) = data.query(query)? else {
            return Err(LanceError::invalid(format!("index `{}` did not return row matches", meta.name)));
        };
        let mut by_fragment: BTreeMap<FragmentId, Vec<u32>> = BTreeMap::new();
        for addr in rows.iter() {
            by_fragment.entry(fragment_of(addr)).or_default().push(offset_of(addr));
        }
        debug!("index `{}` matched {} rows in {} fragments", meta.name, rows.len(), by_fragment.len());

        let mut tasks = VecDeque::new();
        for f in self.ctx.manifest.fragments.iter() {
            if !meta.covers(f.id) {
                tasks.push_back(FragmentTask { fragment: f.clone(), rows: RowSelection::All });
            } else if let Some(offsets) = by_fragment.remove(&f.id) {
                tasks.push_back(FragmentTask { fragment: f.clone(), rows: RowSelection::Offsets(offsets) });
            }
        }
        Ok(tasks)
    }

    /// 过滤条件命中的全部行地址
    fn matching_rows(&self, filter: &Predicate) -> Result<HashSet<RowAddress>> {
        let names: Vec<&str> = filter.columns().into_iter().collect();
        let read = Arc::new(self.ctx.manifest.schema.project(&names)?);
        let tasks = self.ctx.manifest.fragments.iter()
            .map(|f| FragmentTask { fragment: f.clone(), rows: RowSelection::All })
            .collect();
        let mut scan = FragmentScan {
            read,
            columns: vec![ROW_ID.into()],
            with_row_id: true,
            ..self.fragment_scan(tasks, Some(filter.clone()))
        };
        let mut out = HashSet::new();
        while let Some(batch) = scan.next_batch()? {
            out.extend(row_addresses(batch.column(0)));
        }
        Ok(out)
    }

    fn run_ann(&self, q: &NearestQuery, metric: MetricType, index: Option<&IndexMetadata>) -> Result<VecDeque<RecordBatch>> {
        let ctx = &self.ctx;
        let field = ctx.manifest.schema.require(&q.column)?.clone();
        let allowed = match (&self.filter, self.prefilter) {
            (Some(f), true) => Some(self.matching_rows(f)?),
            _ => None,
        };
        let is_allowed = |addr: &RowAddress| allowed.as_ref().map_or(true, |a| a.contains(addr));
        let fetch_k = q.k * q.refine_factor.unwrap_or(1) as usize;

        let mut candidates: Vec<(RowAddress, f32)> = Vec::new();
        let mut flat: Vec<&Fragment> = Vec::new();
        match index {
            Some(meta) => {
                let data = ctx.cache.get_or_load(&ctx.store, &ctx.base, meta)?;
                let IndexData::Vector(ann) = data.as_ref() else {
                    return Err(LanceError::invalid(format!("index `{}` is not a vector index", meta.name)));
                };
                // 索引中可能有已删除行或已移除 fragment 的行，多取这些数量的候选
                let mut live = HashMap::new();
                let mut live_rows = 0u64;
                for f in ctx.manifest.fragments.iter() {
                    if meta.covers(f.id) {
                        live_rows += f.num_rows();
                        live.insert(f.id, Arc::new(fragment::load_deletions(&ctx.store, &ctx.base, f)?));
                    } else {
                        flat.push(f);
                    }
                }
                let stale_entries = (ann.num_rows() as u64).saturating_sub(live_rows) as usize;
                let search_k = if allowed.is_some() { ann.num_rows() } else { fetch_k + stale_entries };
                for (addr, d) in ann.search(&q.query, search_k, q.nprobes)? {
                    let visible = live.get(&fragment_of(addr)).is_some_and(|dv| !dv.contains(offset_of(addr)));
                    if visible && is_allowed(&addr) {
                        candidates.push((addr, d));
                    }
                }
            }
            None => flat.extend(ctx.manifest.fragments.iter()),
        }

        let vec_schema = Arc::new(Schema::from_parts(vec![field.clone()], ctx.manifest.schema.max_field_id));
        for f in flat {
            let reader = FragmentReader::open(&ctx.store, &ctx.base, f, None)?;
            let mut start = 0u64;
            while start < f.physical_rows {
                let end = (start + self.batch_size as u64).min(f.physical_rows);
                let batch = reader.read_range(&vec_schema, start..end, true)?;
                start = end;
                for (addr, v) in vectors_of(&batch)? {
                    if is_allowed(&addr) {
                        candidates.push((addr, metric.distance(&q.query, &v)));
                    }
                }
            }
        }

        let mut best = top_k(candidates, fetch_k);
        if q.refine_factor.is_some() && !best.is_empty() {
            let addrs: Vec<RowAddress> = best.iter().map(|h| h.0).collect();
            let exact = take_rows(ctx, &vec_schema, &addrs)?;
            best = top_k(vectors_of(&exact)?.into_iter()
                .map(|(addr, v)| (addr, metric.distance(&q.query, &v)))
                .collect(), q.k);
        } else {
            best.truncate(q.k);
        }
        debug!("nearest `{}`: {} results", q.column, best.len());

        let addrs: Vec<RowAddress> = best.iter().map(|h| h.0).collect();
        let distance: HashMap<RowAddress, f32> = best.into_iter().collect();
        let rows = take_rows(ctx, &self.read, &addrs)?;
        let ids = row_addresses(rows.column_by_name(ROW_ID).ok_or_else(|| LanceError::invalid("row addresses missing"))?);
        let dist = Array::from_f32(ids.iter().map(|a| distance.get(a).copied().unwrap_or(f32::INFINITY)).collect());
        let mut rows = rows.with_column(distance_field(), dist)?;
        if let (Some(f), false) = (&self.filter, self.prefilter) {
            let mask = f.evaluate(&rows)?;
            rows = rows.filter(&mask)?;
        }
        let rows = rows.project(&self.columns)?;

        let mut out = VecDeque::new();
        let mut offset = 0;
        while offset < rows.num_rows() {
            let n = self.batch_size.min(rows.num_rows() - offset);
            out.push_back(rows.slice(offset, n)?);
            offset += n;
        }
        Ok(out)
    }
}

pub(crate) fn row_addresses(column: &Array) -> Vec<RowAddress> {
    column.to_values().into_iter()
        .filter_map(|v| match v { Value::UInt64(a) => Some(a), _ => None })
        .collect()
}

/// 批次（首列为向量、末列为 `_rowid`）中的非空向量
fn vectors_of(batch: &RecordBatch) -> Result<Vec<(RowAddress, Vec<f32>)>> {
    let ids = batch.column_by_name(ROW_ID)
        .map(row_addresses)
        .ok_or_else(|| LanceError::invalid("row addresses missing"))?;
    let column = batch.column(0);
    let (dim, flat) = column.vector_values()?;
    Ok(ids.into_iter().enumerate()
        .filter(|(i, _)| !column.is_null(*i))
        .map(|(i, addr)| (addr, flat[i * dim..(i + 1) * dim].to_vec()))
        .collect())
}

/// 按行地址读取，结果保持请求顺序并附带 `_rowid`；已删除的行被跳过
pub(crate) fn take_rows(ctx: &ScanContext, projection: &Arc<Schema>, addrs: &[RowAddress]) -> Result<RecordBatch> {
    let mut groups: BTreeMap<FragmentId, Vec<u32>> = BTreeMap::new();
    for &a in addrs {
        groups.entry(fragment_of(a)).or_default().push(offset_of(a));
    }
    let mut parts = Vec::with_capacity(groups.len());
    for (id, offsets) in groups {
        let frag = ctx.manifest.fragment(id)
            .ok_or_else(|| LanceError::invalid(format!("fragment {id} is not part of version {}", ctx.manifest.version)))?;
        let reader = FragmentReader::open(&ctx.store, &ctx.base, frag, None)?;
        parts.push(reader.take(projection, &offsets, true)?);
    }
    let mut fields = projection.fields.clone();
    fields.push(fragment::row_id_field());
    let schema = Arc::new(Schema::from_parts(fields, projection.max_field_id));
    if parts.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    let all = RecordBatch::concat(schema, &parts)?;
    let position: HashMap<RowAddress, usize> = all.column_by_name(ROW_ID)
        .map(row_addresses)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, a)| (a, i))
        .collect();
    let order: Vec<usize> = addrs.iter().filter_map(|a| position.get(a).copied()).collect();
    all.take(&order)
}

// ── 执行器 ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum RowSelection {
    All,
    /// 升序行偏移
    Offsets(Vec<u32>),
}

#[derive(Debug)]
struct FragmentTask {
    fragment: Fragment,
    rows:     RowSelection,
}

struct ActiveFragment {
    reader: FragmentReader,
    rows:   RowSelection,
    /// All：下一物理行；Offsets：下一个偏移下标
    cursor: usize,
}

struct FragmentScan {
    store:       Arc<dyn ObjectStore>,
    base:        String,
    read:        Arc<Schema>,
    columns:     Vec<String>,
    filter:      Option<Predicate>,
    batch_size:  usize,
    with_row_id: bool,
    tasks:       VecDeque<FragmentTask>,
    active:      Option<ActiveFragment>,
    pruned:      u64,
}

impl FragmentScan {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if self.active.is_none() {
                let Some(task) = self.tasks.pop_front() else {
                    if self.pruned > 0 {
                        debug!("zone maps pruned {} row ranges", self.pruned);
                    }
                    return Ok(None);
                };
                let reader = FragmentReader::open(&self.store, &self.base, &task.fragment, None)?;
                self.active = Some(ActiveFragment { reader, rows: task.rows, cursor: 0 });
            }
            let Some(active) = self.active.as_mut() else { continue };

            let batch = match &active.rows {
                RowSelection::All => {
                    let total = active.reader.physical_rows();
                    let start = active.cursor as u64;
                    if start >= total {
                        self.active = None;
                        continue;
                    }
                    let end = (start + self.batch_size as u64).min(total);
                    active.cursor = end as usize;
                    let range = start..end;
                    if let Some(filter) = &self.filter {
                        let (reader, read) = (&active.reader, &self.read);
                        let stats = |column: &str| {
                            let field = read.field(column)?;
                            reader.zone_maps(field.id, &range).and_then(|pages| ZoneStats::merge(&pages))
                        };
                        if !filter.may_match(&stats) {
                            self.pruned += 1;
                            continue;
                        }
                    }
                    active.reader.read_range(&self.read, range, self.with_row_id)?
                }
                RowSelection::Offsets(offsets) => {
                    if active.cursor >= offsets.len() {
                        self.active = None;
                        continue;
                    }
                    let end = (active.cursor + self.batch_size).min(offsets.len());
                    let batch = active.reader.take(&self.read, &offsets[active.cursor..end], self.with_row_id)?;
                    active.cursor = end;
                    batch
                }
            };

            let batch = match &self.filter {
                Some(f) => {
                    let mask = f.evaluate(&batch)?;
                    if mask.iter().all(|m| *m) { batch } else { batch.filter(&mask)? }
                }
                None => batch,
            };
            if batch.num_rows() > 0 {
                return batch.project(&self.columns).map(Some);
            }
        }
    }
}

enum Executor {
    Fragments(FragmentScan),
    Materialized(VecDeque<RecordBatch>),
}

impl Executor {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        match self {
            Self::Fragments(scan)      => scan.next_batch(),
            Self::Materialized(queue)  => Ok(queue.pop_front()),
        }
    }
}

struct Limiter {
    skip:      usize,
    remaining: Option<usize>,
}

impl Limiter {
    fn done(&self) -> bool { self.remaining == Some(0) }

    fn apply(&mut self, batch: RecordBatch) -> Result<Option<RecordBatch>> {
        let n = batch.num_rows();
        if self.skip >= n {
            self.skip -= n;
            return Ok(None);
        }
        let start = std::mem::take(&mut self.skip);
        let mut len = n - start;
        if let Some(r) = self.remaining.as_mut() {
            len = len.min(*r);
            *r -= len;
        }
        if len == 0 {
            return Ok(None);
        }
        if start == 0 && len == n { Ok(Some(batch)) } else { batch.slice(start, len).map(Some) }
    }
}

enum StreamState {
    Executing(Box<Executor>),
    Exhausted,
}

/// 一次性的结果流
pub struct ScanStream {
    schema:  Arc<Schema>,
    state:   StreamState,
    limiter: Limiter,
}

impl ScanStream {
    pub fn schema(&self) -> &Arc<Schema> { &self.schema }

    pub fn state(&self) -> ScanState {
        match self.state {
            StreamState::Executing(_) => ScanState::Executing,
            StreamState::Exhausted    => ScanState::Exhausted,
        }
    }
}

impl Iterator for ScanStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let StreamState::Executing(exec) = &mut self.state else { return None };
            if self.limiter.done() {
                self.state = StreamState::Exhausted;
                return None;
            }
            let step = match exec.next_batch() {
                Ok(Some(batch)) => self.limiter.apply(batch),
                Ok(None) => {
                    self.state = StreamState::Exhausted;
                    return None;
                }
                Err(e) => Err(e),
            };
            match step {
                Ok(Some(batch)) => return Some(Ok(batch)),
                Ok(None) => continue,
                Err(e) => {
                    self.state = StreamState::Exhausted;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteParams;
    use crate::store::MemoryObjectStore;
    use crate::transaction::{Operation, Transaction};

    fn ids(n: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]).unwrap());
        RecordBatch::try_new(schema, vec![Array::from_i64((0..n).collect())]).unwrap()
    }

    fn values(b: &RecordBatch) -> Vec<Value> { b.column(0).to_values() }

    #[test]
    fn limiter_skips_across_batches() {
        let mut l = Limiter { skip: 5, remaining: Some(4) };
        assert!(l.apply(ids(3)).unwrap().is_none());
        let b = l.apply(ids(4)).unwrap().unwrap();
        assert_eq!(values(&b), vec![Value::Int64(2), Value::Int64(3)]);
        let b = l.apply(ids(10)).unwrap().unwrap();
        assert_eq!(b.num_rows(), 2);
        assert!(l.done());
    }

    #[test]
    fn take_rows_keeps_request_order_across_fragments() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let params = WriteParams::default().with_max_rows_per_file(4);
        let fragments = fragment::write_fragments(&store, "", &[ids(10)], &params).unwrap();
        let schema = ids(0).schema().as_ref().clone();
        let manifest = Transaction::new(0, Operation::Overwrite { fragments, schema: schema.clone() })
            .build_manifest(None)
            .unwrap();
        let ctx = ScanContext {
            store,
            base:     String::new(),
            manifest: Arc::new(manifest),
            cache:    Arc::new(IndexCache::new()),
        };
        let addrs = [crate::common::row_address(2, 1), crate::common::row_address(0, 3), crate::common::row_address(1, 0)];
        let b = take_rows(&ctx, &Arc::new(schema), &addrs).unwrap();
        assert_eq!(values(&b), vec![Value::Int64(9), Value::Int64(3), Value::Int64(4)]);
        assert_eq!(row_addresses(b.column(1)), addrs.to_vec());
        assert!(take_rows(&ctx, &ids(0).schema().clone(), &[crate::common::row_address(9, 0)]).is_err());
    }
}
