//! Fragment：不可变的行集合
//!
//! 一个 fragment 由若干数据文件组成（每个文件覆盖全部行、部分列），
//! 外加可选的删除文件。读取时字段按 field id 在数据文件中查找，
//! 找不到的字段（后加的列）读作全 NULL。

use std::ops::Range;
use std::sync::Arc;
use log::debug;
use uuid::Uuid;
use crate::array::{Array, RecordBatch};
use crate::common::{row_address, FieldId, FragmentId, LanceError, Result, VersionNumber};
use crate::config::WriteParams;
use crate::data_file::{DataFileReader, DataFileWriter, ZoneMap};
use crate::deletion::{self, DeletionFile, DeletionVector};
use crate::field_type::{DataType, Field, Value};
use crate::schema::Schema;
use crate::store::{self, ObjectStore};

pub const DATA_DIR: &str = "data";
/// 行地址列名
pub const ROW_ID: &str = "_rowid";

pub fn row_id_field() -> Field {
    Field::new(ROW_ID, DataType::UInt64, false)
}

// ── 元数据 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    /// 相对数据集根目录
    pub path:      String,
    pub field_ids: Vec<FieldId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub id:            FragmentId,
    pub physical_rows: u64,
    pub files:         Vec<DataFile>,
    pub deletion_file: Option<DeletionFile>,
}

impl Fragment {
    pub fn num_deleted(&self) -> u64 {
        self.deletion_file.as_ref().map(|d| d.num_deleted).unwrap_or(0)
    }

    /// 可见行数
    pub fn num_rows(&self) -> u64 { self.physical_rows - self.num_deleted() }

    pub fn field_ids(&self) -> Vec<FieldId> {
        self.files.iter().flat_map(|f| f.field_ids.iter().copied()).collect()
    }

    /// 引用的全部文件（数据 + 删除）
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
            .chain(self.deletion_file.iter().map(|d| d.path.as_str()))
    }
}

fn unavailable(fragment_id: FragmentId, path: &str, err: LanceError) -> LanceError {
    match err {
        LanceError::Io { message, .. } =>
            LanceError::FragmentUnavailable { fragment_id, path: path.into(), message },
        other => other,
    }
}

// ── 写入 ──────────────────────────────────────────────────────────────────────

/// 单个数据文件 → 一个 fragment（id 为临时值，提交时重新分配）
pub fn write_fragment(
    store:  &Arc<dyn ObjectStore>,
    base:   &str,
    batch:  &RecordBatch,
    params: &WriteParams,
) -> Result<Fragment> {
    let mut frags = write_fragments(store, base, std::slice::from_ref(batch),
                                    &params.clone().with_max_rows_per_file(usize::MAX))?;
    frags.pop().ok_or_else(|| LanceError::invalid("cannot write an empty fragment"))
}

/// 按 `max_rows_per_file` 切分成多个 fragment；空输入返回空列表
pub fn write_fragments(
    store:   &Arc<dyn ObjectStore>,
    base:    &str,
    batches: &[RecordBatch],
    params:  &WriteParams,
) -> Result<Vec<Fragment>> {
    let Some(first) = batches.first() else { return Ok(Vec::new()) };
    let schema = first.schema().clone();
    if let Some(bad) = batches.iter().find(|b| b.schema().fields != schema.fields) {
        return Err(LanceError::invalid(format!(
            "batch schema {:?} differs from {:?}", bad.schema().field_names(), schema.field_names())));
    }

    let max_rows = params.max_rows_per_file.max(1);
    let mut out: Vec<Fragment> = Vec::new();
    let mut writer: Option<DataFileWriter> = None;

    for batch in batches {
        let mut offset = 0;
        while offset < batch.num_rows() {
            let w = writer.get_or_insert_with(||
                DataFileWriter::new(&schema.fields, params.codec, params.max_rows_per_page));
            let room = max_rows - w.num_rows() as usize;
            let n = room.min(batch.num_rows() - offset);
            w.write(&batch.slice(offset, n)?)?;
            offset += n;
            if w.num_rows() as usize >= max_rows {
                if let Some(full) = writer.take() {
                    out.push(finish_file(store, base, full, &schema)?);
                }
            }
        }
    }
    if let Some(w) = writer.filter(|w| w.num_rows() > 0) {
        out.push(finish_file(store, base, w, &schema)?);
    }
    Ok(out)
}

fn finish_file(store: &Arc<dyn ObjectStore>, base: &str, w: DataFileWriter, schema: &Schema) -> Result<Fragment> {
    let physical_rows = w.num_rows();
    let path = format!("{DATA_DIR}/{}.lance", Uuid::new_v4());
    let bytes = w.finish()?;
    store.put(&store::join(base, &path), &bytes)?;
    debug!("wrote {path}: {physical_rows} rows, {} bytes", bytes.len());
    Ok(Fragment {
        id: 0,
        physical_rows,
        files: vec![DataFile { path, field_ids: schema.field_ids() }],
        deletion_file: None,
    })
}

/// 为已有 fragment 追加一个只含新列的数据文件（行数必须一致）
pub fn add_data_file(
    store:    &Arc<dyn ObjectStore>,
    base:     &str,
    fragment: &Fragment,
    batch:    &RecordBatch,
    params:   &WriteParams,
) -> Result<Fragment> {
    if batch.num_rows() as u64 != fragment.physical_rows {
        return Err(LanceError::invalid(format!(
            "fragment {} has {} rows, new columns have {}", fragment.id, fragment.physical_rows, batch.num_rows())));
    }
    let mut w = DataFileWriter::new(&batch.schema().fields, params.codec, params.max_rows_per_page);
    w.write(batch)?;
    let mut written = finish_file(store, base, w, batch.schema())?;
    let mut updated = fragment.clone();
    updated.files.append(&mut written.files);
    Ok(updated)
}

// ── 删除 ──────────────────────────────────────────────────────────────────────

/// 删除指定行偏移，返回新的 fragment 元数据；原数据文件不变
pub fn delete_rows(
    store:        &Arc<dyn ObjectStore>,
    base:         &str,
    fragment:     &Fragment,
    offsets:      &[u32],
    read_version: VersionNumber,
) -> Result<Fragment> {
    if let Some(&bad) = offsets.iter().find(|&&o| o as u64 >= fragment.physical_rows) {
        return Err(LanceError::invalid(format!(
            "row offset {bad} out of range for fragment {} ({} rows)", fragment.id, fragment.physical_rows)));
    }
    let mut dv = load_deletions(store, base, fragment)?;
    let before = dv.len();
    dv.union_with(&DeletionVector::from_offsets(offsets.iter().copied()));
    if dv.len() == before {
        return Ok(fragment.clone());
    }
    let file = deletion::write_deletion_file(store, base, fragment.id, read_version, &dv)?;
    debug!("fragment {}: {} rows deleted in total", fragment.id, dv.len());
    Ok(Fragment { deletion_file: Some(file), ..fragment.clone() })
}

pub fn load_deletions(store: &Arc<dyn ObjectStore>, base: &str, fragment: &Fragment) -> Result<DeletionVector> {
    match &fragment.deletion_file {
        Some(file) => deletion::read_deletion_file(store, base, file)
            .map_err(|e| unavailable(fragment.id, &file.path, e)),
        None => Ok(DeletionVector::new()),
    }
}

// ── 读取 ──────────────────────────────────────────────────────────────────────

/// 打开后的 fragment：数据文件 footer 已加载，页按需解码
#[derive(Debug)]
pub struct FragmentReader {
    fragment: Fragment,
    readers:  Vec<DataFileReader>,
    deletion: Arc<DeletionVector>,
}

impl FragmentReader {
    /// `deletion = None` 时读取 fragment 自身的删除文件
    pub fn open(
        store:    &Arc<dyn ObjectStore>,
        base:     &str,
        fragment: &Fragment,
        deletion: Option<Arc<DeletionVector>>,
    ) -> Result<Self> {
        let mut readers = Vec::with_capacity(fragment.files.len());
        for file in &fragment.files {
            let full = store::join(base, &file.path);
            let r = DataFileReader::open(store.clone(), &full).map_err(|e| unavailable(fragment.id, &file.path, e))?;
            if r.num_rows() != fragment.physical_rows {
                return Err(LanceError::corrupt(&file.path, format!(
                    "file has {} rows, fragment {} has {}", r.num_rows(), fragment.id, fragment.physical_rows)));
            }
            readers.push(r);
        }
        let deletion = match deletion {
            Some(d) => d,
            None    => Arc::new(load_deletions(store, base, fragment)?),
        };
        Ok(Self { fragment: fragment.clone(), readers, deletion })
    }

    pub fn fragment(&self)   -> &Fragment       { &self.fragment }
    pub fn deletion(&self)   -> &DeletionVector { &self.deletion }
    pub fn physical_rows(&self) -> u64          { self.fragment.physical_rows }

    /// 后写入的文件优先（Merge 可能覆盖同一 field id）
    fn reader_for(&self, field_id: FieldId) -> Option<&DataFileReader> {
        self.readers.iter().rev().find(|r| r.column(field_id).is_some())
    }

    fn locate_err(&self, field: &Field, e: LanceError) -> LanceError {
        match self.reader_for(field.id) {
            Some(r) => unavailable(self.fragment.id, r.path(), e),
            None    => e,
        }
    }

    fn column_range(&self, field: &Field, rows: Range<u64>) -> Result<Array> {
        match self.reader_for(field.id) {
            Some(r) => r.read_range(field, rows).map_err(|e| self.locate_err(field, e)),
            None    => Ok(Array::new_null(&field.data_type, (rows.end - rows.start) as usize)),
        }
    }

    fn column_take(&self, field: &Field, rows: &[u64]) -> Result<Array> {
        match self.reader_for(field.id) {
            Some(r) => r.take(field, rows).map_err(|e| self.locate_err(field, e)),
            None    => Ok(Array::new_null(&field.data_type, rows.len())),
        }
    }

    fn assemble(&self, projection: &Arc<Schema>, columns: Vec<Array>, offsets: &[u32], with_row_id: bool) -> Result<RecordBatch> {
        let batch = RecordBatch::try_new(projection.clone(), columns)?;
        if !with_row_id {
            return Ok(batch);
        }
        let ids: Vec<u64> = offsets.iter().map(|&o| row_address(self.fragment.id, o)).collect();
        batch.with_column(row_id_field(), Array::from_u64(ids))
    }

    /// 读取物理行区间并剔除已删除行；可能返回 0 行
    pub fn read_range(&self, projection: &Arc<Schema>, rows: Range<u64>, with_row_id: bool) -> Result<RecordBatch> {
        let end = rows.end.min(self.physical_rows());
        let rows = rows.start.min(end)..end;
        let columns = projection.fields.iter()
            .map(|f| self.column_range(f, rows.clone()))
            .collect::<Result<Vec<_>>>()?;
        let offsets: Vec<u32> = (rows.start as u32..rows.end as u32).collect();
        let batch = self.assemble(projection, columns, &offsets, with_row_id)?;
        if self.deletion.is_empty() {
            return Ok(batch);
        }
        let mask: Vec<bool> = offsets.iter().map(|&o| !self.deletion.contains(o)).collect();
        batch.filter(&mask)
    }

    /// 按行偏移随机读取；已删除的行被跳过，其余保持请求顺序
    pub fn take(&self, projection: &Arc<Schema>, offsets: &[u32], with_row_id: bool) -> Result<RecordBatch> {
        if let Some(&bad) = offsets.iter().find(|&&o| o as u64 >= self.physical_rows()) {
            return Err(LanceError::invalid(format!(
                "row offset {bad} out of range for fragment {}", self.fragment.id)));
        }
        let live: Vec<u32> = offsets.iter().copied().filter(|&o| !self.deletion.contains(o)).collect();
        let rows: Vec<u64> = live.iter().map(|&o| o as u64).collect();
        let columns = projection.fields.iter()
            .map(|f| self.column_take(f, &rows))
            .collect::<Result<Vec<_>>>()?;
        self.assemble(projection, columns, &live, with_row_id)
    }

    /// 覆盖行区间的页 zone map 及其行数；任一页缺少统计时返回 None
    pub fn zone_maps(&self, field_id: FieldId, rows: &Range<u64>) -> Option<Vec<(ZoneMap, u32)>> {
        let Some(reader) = self.reader_for(field_id) else {
            // 未存储的列整段为 NULL
            let n = (rows.end.min(self.physical_rows()) - rows.start.min(self.physical_rows())) as u32;
            return Some(vec![(ZoneMap { min: Value::Null, max: Value::Null, null_count: n }, n)]);
        };
        let col = reader.column(field_id)?;
        col.pages[col.pages_in(rows)].iter()
            .map(|p| p.zone_map.clone().map(|z| (z, p.num_rows)))
            .collect()
    }
}

/// 惰性、有限、可重启的批次序列
#[derive(Debug, Clone)]
pub struct FragmentBatches {
    reader:      Arc<FragmentReader>,
    projection:  Arc<Schema>,
    batch_size:  usize,
    with_row_id: bool,
}

pub fn read_fragment(
    store:       &Arc<dyn ObjectStore>,
    base:        &str,
    fragment:    &Fragment,
    projection:  Arc<Schema>,
    deletion:    Option<Arc<DeletionVector>>,
    batch_size:  usize,
    with_row_id: bool,
) -> Result<FragmentBatches> {
    let reader = FragmentReader::open(store, base, fragment, deletion)?;
    Ok(FragmentBatches { reader: Arc::new(reader), projection, batch_size: batch_size.max(1), with_row_id })
}

impl FragmentBatches {
    /// 每次调用都从头开始
    pub fn iter(&self) -> FragmentBatchIter {
        FragmentBatchIter { batches: self.clone(), next_row: 0, failed: false }
    }
}

impl IntoIterator for &FragmentBatches {
    type Item = Result<RecordBatch>;
    type IntoIter = FragmentBatchIter;
    fn into_iter(self) -> Self::IntoIter { self.iter() }
}

pub struct FragmentBatchIter {
    batches:  FragmentBatches,
    next_row: u64,
    failed:   bool,
}

impl Iterator for FragmentBatchIter {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let b = &self.batches;
        while !self.failed && self.next_row < b.reader.physical_rows() {
            let start = self.next_row;
            let end = (start + b.batch_size as u64).min(b.reader.physical_rows());
            self.next_row = end;
            match b.reader.read_range(&b.projection, start..end, b.with_row_id) {
                Ok(batch) if batch.num_rows() == 0 => continue,
                Ok(batch) => return Some(Ok(batch)),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;

    fn setup(rows: i64) -> (Arc<dyn ObjectStore>, Arc<Schema>, Fragment) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]).unwrap());
        let batch = RecordBatch::try_new(schema.clone(), vec![Array::from_i64((0..rows).collect())]).unwrap();
        let params = WriteParams::default().with_max_rows_per_page(4);
        let frag = write_fragment(&store, "ds", &batch, &params).unwrap();
        (store, schema, frag)
    }

    fn ids(batches: &FragmentBatches) -> Vec<i64> {
        batches.iter()
            .flat_map(|b| b.unwrap().column(0).to_values())
            .map(|v| v.as_i64().unwrap())
            .collect()
    }

    #[test]
    fn deleting_rows_keeps_order_of_the_rest() {
        let (store, schema, frag) = setup(10);
        let frag = delete_rows(&store, "ds", &frag, &[3, 7], 1).unwrap();
        assert_eq!(frag.num_rows(), 8);
        let batches = read_fragment(&store, "ds", &frag, schema, None, 3, false).unwrap();
        assert_eq!(ids(&batches), vec![0, 1, 2, 4, 5, 6, 8, 9]);
        // 可重启
        assert_eq!(ids(&batches), vec![0, 1, 2, 4, 5, 6, 8, 9]);
    }

    #[test]
    fn deletions_accumulate_and_reject_bad_offsets() {
        let (store, _, frag) = setup(10);
        let f1 = delete_rows(&store, "ds", &frag, &[1], 1).unwrap();
        let f2 = delete_rows(&store, "ds", &f1, &[1, 2], 2).unwrap();
        assert_eq!(f2.num_deleted(), 2);
        assert_ne!(f1.deletion_file, f2.deletion_file);
        assert!(matches!(delete_rows(&store, "ds", &f2, &[10], 3), Err(LanceError::InvalidInput(_))));
    }

    #[test]
    fn caller_supplied_deletion_view_wins() {
        let (store, schema, frag) = setup(6);
        let view = Arc::new(DeletionVector::from_offsets([0, 5]));
        let batches = read_fragment(&store, "ds", &frag, schema, Some(view), 100, true).unwrap();
        let batch = batches.iter().next().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.column_by_name(ROW_ID).unwrap().value(0), Value::UInt64(row_address(frag.id, 1)));
    }

    #[test]
    fn missing_data_file_is_unavailable() {
        let (store, schema, frag) = setup(4);
        store.delete(&store::join("ds", &frag.files[0].path)).unwrap();
        match read_fragment(&store, "ds", &frag, schema, None, 10, false) {
            Err(LanceError::FragmentUnavailable { path, .. }) => assert_eq!(path, frag.files[0].path),
            other => panic!("expected FragmentUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn unknown_field_reads_as_nulls() {
        let (store, _, frag) = setup(5);
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]).unwrap()
            .add_fields(vec![Field::new("extra", DataType::Utf8, true)]).unwrap());
        let reader = FragmentReader::open(&store, "ds", &frag, None).unwrap();
        let batch = reader.take(&schema, &[4, 0], false).unwrap();
        assert_eq!(batch.row(0), vec![Value::Int64(4), Value::Null]);
    }

    #[test]
    fn write_fragments_splits_by_file_size() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]).unwrap());
        let batches: Vec<RecordBatch> = (0..3)
            .map(|i| RecordBatch::try_new(schema.clone(), vec![Array::from_i32((i * 7..i * 7 + 7).collect())]).unwrap())
            .collect();
        let params = WriteParams::default().with_max_rows_per_file(10);
        let frags = write_fragments(&store, "", &batches, &params).unwrap();
        assert_eq!(frags.iter().map(|f| f.physical_rows).collect::<Vec<_>>(), vec![10, 10, 1]);
    }
}
