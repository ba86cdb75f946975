//! 数据文件读写（一个 fragment 的一组列）
//!
//! 文件格式：
//! ```text
//! ┌────────────────────────────────────┐
//! │  MAGIC  (8 bytes) "LANCEDF\0"      │
//! │  Version(4 bytes) = 1              │
//! ├────────────────────────────────────┤
//! │  DATA REGION                       │
//! │    [Pages field 0]                 │ ← codec 编码的自描述页
//! │    [Pages field 1]                 │
//! │    ...                             │
//! ├────────────────────────────────────┤
//! │  FOOTER                            │
//! │    num_rows, columns               │
//! │      field_id, data_type, pages    │
//! │        offset, length, rows, zone  │
//! │    Footer CRC32  (4 bytes)         │
//! │    Footer length (4 bytes)         │
//! │    MAGIC         (8 bytes)         │
//! └────────────────────────────────────┘
//! ```
//!
//! 列以 field id 标识，rename / drop 列无需重写数据。

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use parking_lot::Mutex;
use crate::array::{Array, RecordBatch};
use crate::codec;
use crate::common::{FieldId, LanceError, Result};
use crate::config::CodecConfig;
use crate::field_type::{DataType, Field, Value};
use crate::format::{MetaReader, MetaWriter};
use crate::store::ObjectStore;

const MAGIC: &[u8; 8] = b"LANCEDF\0";
const VERSION: u32     = 1;
const HEADER_LEN: u64  = 12;
const TAIL_LEN: u64    = 16;

// ── Footer 结构 ───────────────────────────────────────────────────────────────

/// 页级统计，用于扫描时剪枝
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneMap {
    /// 全为 NULL 时 min / max 均为 `Value::Null`
    pub min:        Value,
    pub max:        Value,
    pub null_count: u32,
}

impl ZoneMap {
    fn compute(array: &Array) -> Option<Self> {
        if !array.data_type().is_orderable() {
            return None;
        }
        let mut min = Value::Null;
        let mut max = Value::Null;
        for v in array.to_values().into_iter().filter(|v| !v.is_null()) {
            if min.is_null() || v.total_cmp(&min).is_lt() { min = v.clone(); }
            if max.is_null() || v.total_cmp(&max).is_gt() { max = v; }
        }
        Some(Self { min, max, null_count: array.null_count() as u32 })
    }

    pub fn all_null(&self, num_rows: u32) -> bool { self.null_count == num_rows }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageMeta {
    pub offset:    u64,
    pub length:    u64,
    /// 页内首行在文件中的行号
    pub first_row: u64,
    pub num_rows:  u32,
    pub zone_map:  Option<ZoneMap>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub field_id:  FieldId,
    pub data_type: DataType,
    pub pages:     Vec<PageMeta>,
}

impl ColumnMeta {
    /// 与行区间 `rows` 相交的页下标
    pub fn pages_in(&self, rows: &Range<u64>) -> Range<usize> {
        let start = self.pages.partition_point(|p| p.first_row + p.num_rows as u64 <= rows.start);
        let end = self.pages.partition_point(|p| p.first_row < rows.end);
        start..end.max(start)
    }

    /// 包含第 `row` 行的页下标（二分查找）
    pub fn page_of(&self, row: u64) -> Option<usize> {
        let pos = self.pages.partition_point(|p| p.first_row <= row);
        let idx = pos.checked_sub(1)?;
        let p = &self.pages[idx];
        (row < p.first_row + p.num_rows as u64).then_some(idx)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFileFooter {
    pub num_rows: u64,
    pub columns:  Vec<ColumnMeta>,
}

impl DataFileFooter {
    fn serialize(&self) -> Vec<u8> {
        let mut w = MetaWriter::new();
        w.u64(self.num_rows).u32(self.columns.len() as u32);
        for col in &self.columns {
            w.i32(col.field_id).data_type(&col.data_type).u32(col.pages.len() as u32);
            for p in &col.pages {
                w.u64(p.offset).u64(p.length).u64(p.first_row).u32(p.num_rows);
                match &p.zone_map {
                    Some(z) => { w.u8(1).value(&z.min).value(&z.max).u32(z.null_count); }
                    None    => { w.u8(0); }
                }
            }
        }
        w.finish()
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = MetaReader::new(data, "data file footer");
        let num_rows = r.u64()?;
        let n_cols = r.len_prefix(4)?;
        let mut columns = Vec::with_capacity(n_cols);
        for _ in 0..n_cols {
            let field_id  = r.i32()?;
            let data_type = r.data_type()?;
            let n_pages   = r.len_prefix(29)?;
            let mut pages = Vec::with_capacity(n_pages);
            for _ in 0..n_pages {
                let offset    = r.u64()?;
                let length    = r.u64()?;
                let first_row = r.u64()?;
                let num_rows  = r.u32()?;
                let zone_map = match r.u8()? {
                    0 => None,
                    _ => Some(ZoneMap { min: r.value()?, max: r.value()?, null_count: r.u32()? }),
                };
                pages.push(PageMeta { offset, length, first_row, num_rows, zone_map });
            }
            columns.push(ColumnMeta { field_id, data_type, pages });
        }
        r.finish()?;
        Ok(Self { num_rows, columns })
    }
}

// ── DataFileWriter ────────────────────────────────────────────────────────────

struct ColumnWriter {
    field:        Field,
    pending:      Vec<Array>,
    pending_rows: usize,
    next_row:     u64,
    pages:        Vec<PageMeta>,
    /// 本列的页字节（offset 相对列起点，finish 时再平移）
    data:         Vec<u8>,
}

impl ColumnWriter {
    fn new(field: Field) -> Self {
        Self { field, pending: Vec::new(), pending_rows: 0, next_row: 0, pages: Vec::new(), data: Vec::new() }
    }

    fn add(&mut self, array: &Array, page_rows: usize, codec: &CodecConfig) -> Result<()> {
        self.pending_rows += array.len();
        self.pending.push(array.clone());
        while self.pending_rows >= page_rows {
            let parts: Vec<&Array> = self.pending.iter().collect();
            let all = Array::concat(&self.field.data_type, &parts)?;
            let page = all.slice(0, page_rows)?;
            let rest = all.slice(page_rows, all.len() - page_rows)?;
            self.pending_rows = rest.len();
            self.pending = vec![rest];
            self.flush_page(&page, codec)?;
        }
        Ok(())
    }

    fn flush_page(&mut self, page: &Array, codec: &CodecConfig) -> Result<()> {
        let bytes = codec::encode(page, &self.field, codec)?;
        self.pages.push(PageMeta {
            offset:    self.data.len() as u64,
            length:    bytes.len() as u64,
            first_row: self.next_row,
            num_rows:  page.len() as u32,
            zone_map:  ZoneMap::compute(page),
        });
        self.next_row += page.len() as u64;
        self.data.extend_from_slice(&bytes);
        Ok(())
    }

    fn finish(mut self, codec: &CodecConfig) -> Result<(ColumnMeta, Vec<u8>)> {
        if self.pending_rows > 0 {
            let parts: Vec<&Array> = self.pending.iter().collect();
            let rest = Array::concat(&self.field.data_type, &parts)?;
            self.flush_page(&rest, codec)?;
        }
        let meta = ColumnMeta { field_id: self.field.id, data_type: self.field.data_type.clone(), pages: self.pages };
        Ok((meta, self.data))
    }
}

pub struct DataFileWriter {
    columns:   Vec<ColumnWriter>,
    codec:     CodecConfig,
    page_rows: usize,
    num_rows:  u64,
}

impl DataFileWriter {
    /// `fields` 必须带有 Schema 分配的 field id
    pub fn new(fields: &[Field], codec: CodecConfig, max_rows_per_page: usize) -> Self {
        Self {
            columns:   fields.iter().cloned().map(ColumnWriter::new).collect(),
            codec,
            page_rows: max_rows_per_page.max(1),
            num_rows:  0,
        }
    }

    /// 追加一批；列顺序与 `new` 时的字段一致
    pub fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_columns() != self.columns.len() {
            return Err(LanceError::invalid(format!(
                "batch has {} columns, writer expects {}", batch.num_columns(), self.columns.len())));
        }
        for (cw, array) in self.columns.iter_mut().zip(batch.columns()) {
            cw.add(array, self.page_rows, &self.codec)?;
        }
        self.num_rows += batch.num_rows() as u64;
        Ok(())
    }

    pub fn num_rows(&self) -> u64 { self.num_rows }

    /// 完成写入，返回整个文件的字节
    pub fn finish(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());

        let mut metas = Vec::with_capacity(self.columns.len());
        for cw in self.columns {
            let (mut meta, data) = cw.finish(&self.codec)?;
            let base = out.len() as u64;
            meta.pages.iter_mut().for_each(|p| p.offset += base);
            out.extend_from_slice(&data);
            metas.push(meta);
        }

        let footer = DataFileFooter { num_rows: self.num_rows, columns: metas }.serialize();
        let crc = crc32fast::hash(&footer);
        out.extend_from_slice(&footer);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(footer.len() as u32).to_le_bytes());
        out.extend_from_slice(MAGIC);
        Ok(out)
    }
}

// ── DataFileReader ────────────────────────────────────────────────────────────

/// 按需读取页；只解析 footer，页在访问时才取回并解码
pub struct DataFileReader {
    store:  Arc<dyn ObjectStore>,
    path:   String,
    footer: DataFileFooter,
    /// 每列最近一次解码的页
    cache:  Mutex<HashMap<FieldId, (usize, Arc<Array>)>>,
}

impl std::fmt::Debug for DataFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileReader").field("path", &self.path).field("footer", &self.footer).finish()
    }
}

impl DataFileReader {
    pub fn open(store: Arc<dyn ObjectStore>, path: &str) -> Result<Self> {
        let size = store.size(path)?;
        if size < HEADER_LEN + TAIL_LEN {
            return Err(LanceError::corrupt(path, "file too small"));
        }
        let tail = store.get_range(path, size - TAIL_LEN..size)?;
        if &tail[8..16] != MAGIC {
            return Err(LanceError::corrupt(path, "invalid data file magic"));
        }
        let footer_crc = LittleEndian::read_u32(&tail[0..4]);
        let footer_len = LittleEndian::read_u32(&tail[4..8]) as u64;
        if footer_len > size - HEADER_LEN - TAIL_LEN {
            return Err(LanceError::corrupt(path, "footer length exceeds file"));
        }
        let footer_start = size - TAIL_LEN - footer_len;
        let footer_bytes = store.get_range(path, footer_start..size - TAIL_LEN)?;
        if crc32fast::hash(&footer_bytes) != footer_crc {
            return Err(LanceError::corrupt(path, "footer checksum mismatch"));
        }
        let footer = DataFileFooter::deserialize(&footer_bytes).map_err(|e| e.within(path))?;
        if let Some(bad) = footer.columns.iter().flat_map(|c| &c.pages)
            .find(|p| p.offset < HEADER_LEN || p.offset + p.length > footer_start)
        {
            return Err(LanceError::corrupt(path, format!("page at {} lies outside data region", bad.offset)));
        }
        Ok(Self { store, path: path.to_string(), footer, cache: Mutex::new(HashMap::new()) })
    }

    pub fn path(&self)     -> &str            { &self.path }
    pub fn num_rows(&self) -> u64             { self.footer.num_rows }
    pub fn footer(&self)   -> &DataFileFooter { &self.footer }

    pub fn column(&self, field_id: FieldId) -> Option<&ColumnMeta> {
        self.footer.columns.iter().find(|c| c.field_id == field_id)
    }

    fn column_for(&self, field: &Field) -> Result<&ColumnMeta> {
        let col = self.column(field.id).ok_or_else(|| LanceError::corrupt(&self.path, format!(
            "field id {} (`{}`) not stored in this file", field.id, field.name)))?;
        if col.data_type != field.data_type {
            return Err(LanceError::corrupt(&self.path, format!(
                "column `{}` stored as {} but schema says {}", field.name, col.data_type, field.data_type)));
        }
        Ok(col)
    }

    /// 读取并解码一页（带单页缓存）
    pub fn read_page(&self, field: &Field, page_idx: usize) -> Result<Arc<Array>> {
        if let Some((idx, arr)) = self.cache.lock().get(&field.id) {
            if *idx == page_idx {
                return Ok(arr.clone());
            }
        }
        let col = self.column_for(field)?;
        let meta = col.pages.get(page_idx).ok_or_else(|| LanceError::corrupt(&self.path, format!(
            "column `{}` has no page {page_idx}", field.name)))?;
        let bytes = self.store.get_range(&self.path, meta.offset..meta.offset + meta.length)?;
        let array = Arc::new(codec::decode(&bytes, field).map_err(|e| e.within(&self.path))?);
        if array.len() != meta.num_rows as usize {
            return Err(LanceError::corrupt(&self.path, format!(
                "page {page_idx} of `{}` has {} rows, footer says {}", field.name, array.len(), meta.num_rows)));
        }
        debug!("decoded page {page_idx} of `{}` in {}", field.name, self.path);
        self.cache.lock().insert(field.id, (page_idx, array.clone()));
        Ok(array)
    }

    /// 读取行区间 `rows`（文件内行号）
    pub fn read_range(&self, field: &Field, rows: Range<u64>) -> Result<Array> {
        if rows.end > self.num_rows() || rows.start > rows.end {
            return Err(LanceError::invalid(format!(
                "row range {}..{} outside file of {} rows", rows.start, rows.end, self.num_rows())));
        }
        let col = self.column_for(field)?;
        let mut parts = Vec::new();
        for idx in col.pages_in(&rows) {
            let meta  = &col.pages[idx];
            let page  = self.read_page(field, idx)?;
            let start = rows.start.max(meta.first_row) - meta.first_row;
            let end   = rows.end.min(meta.first_row + meta.num_rows as u64) - meta.first_row;
            parts.push(page.slice(start as usize, (end - start) as usize)?);
        }
        let refs: Vec<&Array> = parts.iter().collect();
        Array::concat(&field.data_type, &refs)
    }

    /// 按行号随机读取，输出顺序与 `rows` 一致；每个被触及的页只解码一次
    pub fn take(&self, field: &Field, rows: &[u64]) -> Result<Array> {
        let col = self.column_for(field)?;
        let mut by_page: Vec<(usize, usize, usize)> = Vec::with_capacity(rows.len());
        for (pos, &row) in rows.iter().enumerate() {
            let page = col.page_of(row).ok_or_else(|| LanceError::invalid(format!(
                "row {row} outside file of {} rows", self.num_rows())))?;
            by_page.push((page, (row - col.pages[page].first_row) as usize, pos));
        }
        by_page.sort_unstable();

        let mut gathered: Vec<Option<Array>> = vec![None; rows.len()];
        for group in by_page.chunk_by(|a, b| a.0 == b.0) {
            let page = self.read_page(field, group[0].0)?;
            let local: Vec<usize> = group.iter().map(|g| g.1).collect();
            let picked = page.take(&local)?;
            for (i, g) in group.iter().enumerate() {
                gathered[g.2] = Some(picked.slice(i, 1)?);
            }
        }
        let parts: Vec<&Array> = gathered.iter().flatten().collect();
        Array::concat(&field.data_type, &parts)
    }

    /// 一页的 zone map（无统计时 None）
    pub fn zone_map(&self, field_id: FieldId, page_idx: usize) -> Option<&ZoneMap> {
        self.column(field_id)?.pages.get(page_idx)?.zone_map.as_ref()
    }
}
