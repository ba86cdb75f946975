//! BTree 标量索引
//!
//! 有序的 (key, 行地址) 条目按 `BTREE_PAGE_SIZE` 分页，另有一张稀疏的
//! 页边界表（每页 min/max/起始条目）。查询先在页边界表上二分确定候选页，
//! 再在页内二分定位；NULL 键单独存放在 `nulls` 中。

use std::ops::Bound;
use roaring::RoaringTreemap;
use crate::common::{LanceError, Result, RowAddress};
use crate::field_type::{DataType, Value};
use crate::format::{MetaReader, MetaWriter};
use std::cmp::Ordering;

pub const BTREE_PAGE_SIZE: usize = 4096;

/// 标量索引可回答的谓词
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarQuery {
    Equals(Value),
    Range { lower: Bound<Value>, upper: Bound<Value> },
    IsIn(Vec<Value>),
    IsNull,
}

#[derive(Debug, Clone, PartialEq)]
struct PageBoundary {
    min:   Value,
    max:   Value,
    start: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BTreeIndex {
    data_type: DataType,
    entries:   Vec<(Value, RowAddress)>,
    lookup:    Vec<PageBoundary>,
    nulls:     RoaringTreemap,
}

fn below_lower(key: &Value, lower: &Bound<&Value>) -> bool {
    match lower {
        Bound::Included(l) => key.total_cmp(l) == Ordering::Less,
        Bound::Excluded(l) => key.total_cmp(l) != Ordering::Greater,
        Bound::Unbounded   => false,
    }
}

fn within_upper(key: &Value, upper: &Bound<&Value>) -> bool {
    match upper {
        Bound::Included(u) => key.total_cmp(u) != Ordering::Greater,
        Bound::Excluded(u) => key.total_cmp(u) == Ordering::Less,
        Bound::Unbounded   => true,
    }
}

impl BTreeIndex {
    pub fn build(data_type: &DataType, values: impl IntoIterator<Item = (Value, RowAddress)>) -> Self {
        let mut nulls = RoaringTreemap::new();
        let mut entries: Vec<(Value, RowAddress)> = Vec::new();
        for (v, addr) in values {
            if v.is_null() { nulls.insert(addr); } else { entries.push((v, addr)); }
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let lookup = entries.chunks(BTREE_PAGE_SIZE).enumerate()
            .map(|(i, page)| PageBoundary {
                min:   page[0].0.clone(),
                max:   page[page.len() - 1].0.clone(),
                start: i * BTREE_PAGE_SIZE,
            })
            .collect();
        Self { data_type: data_type.clone(), entries, lookup, nulls }
    }

    pub fn data_type(&self) -> &DataType { &self.data_type }
    pub fn num_entries(&self) -> usize { self.entries.len() + self.nulls.len() as usize }
    pub fn num_pages(&self) -> usize { self.lookup.len() }

    pub fn search(&self, query: &ScalarQuery) -> RoaringTreemap {
        match query {
            ScalarQuery::IsNull => self.nulls.clone(),
            ScalarQuery::Equals(v) => self.range(Bound::Included(v), Bound::Included(v)),
            ScalarQuery::Range { lower, upper } => self.range(lower.as_ref(), upper.as_ref()),
            ScalarQuery::IsIn(vs) => vs.iter()
                .map(|v| self.range(Bound::Included(v), Bound::Included(v)))
                .fold(RoaringTreemap::new(), |acc, r| acc | r),
        }
    }

    fn range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> RoaringTreemap {
        let null_bound = |b: &Bound<&Value>| matches!(b, Bound::Included(v) | Bound::Excluded(v) if v.is_null());
        if null_bound(&lower) || null_bound(&upper) {
            return RoaringTreemap::new();
        }
        // 候选页：max ≥ lower 且 min ≤ upper
        let first = self.lookup.partition_point(|p| below_lower(&p.max, &lower));
        let last = self.lookup.partition_point(|p| within_upper(&p.min, &upper));
        if first >= last {
            return RoaringTreemap::new();
        }
        let from = self.lookup[first].start;
        let to = self.lookup.get(last).map(|p| p.start).unwrap_or(self.entries.len());
        let slice = &self.entries[from..to];
        let lo = slice.partition_point(|(k, _)| below_lower(k, &lower));
        let hi = slice.partition_point(|(k, _)| within_upper(k, &upper));
        if lo >= hi {
            return RoaringTreemap::new();
        }
        slice[lo..hi].iter().map(|(_, addr)| *addr).collect()
    }

    // ── 序列化 ────────────────────────────────────────────────────────────────

    pub(crate) fn write_to(&self, w: &mut MetaWriter) -> Result<()> {
        w.data_type(&self.data_type).u32(self.entries.len() as u32);
        for (k, addr) in &self.entries {
            w.value(k).u64(*addr);
        }
        let mut nulls = Vec::with_capacity(self.nulls.serialized_size());
        self.nulls.serialize_into(&mut nulls)
            .map_err(|e| LanceError::invalid(format!("serializing null rows: {e}")))?;
        w.bytes(&nulls);
        Ok(())
    }

    pub(crate) fn read_from(r: &mut MetaReader) -> Result<Self> {
        let data_type = r.data_type()?;
        let n = r.len_prefix(9)?;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            entries.push((r.value()?, r.u64()?));
        }
        let nulls = RoaringTreemap::deserialize_from(r.bytes()?)
            .map_err(|e| LanceError::corrupt("btree null rows", e.to_string()))?;
        // 页边界表由条目重建
        let mut index = Self::build(&data_type, entries);
        index.nulls = nulls;
        Ok(index)
    }
}
