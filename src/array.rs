//! 内存列式批次（引擎对外交换的列格式）
//!
//! ```text
//! Array
//! ├─ validity  : Option<bitmap>   bit=1 表示非空
//! ├─ offsets   : Vec<u32>         Utf8 / Binary / List，长度 len+1
//! ├─ values    : Vec<u8>          定长值 / Boolean 位图 / 变长字节
//! └─ children  : Vec<Array>       List、FixedSizeList 1 个；Struct 每字段 1 个
//! ```

use std::sync::Arc;
use byteorder::{ByteOrder, LittleEndian};
use crate::common::{LanceError, Result};
use crate::field_type::{DataType, Field, Value};
use crate::schema::Schema;

// ── 位图工具 ──────────────────────────────────────────────────────────────────

pub(crate) fn bitmap_len(bits: usize) -> usize { bits.div_ceil(8) }

pub(crate) fn get_bit(bitmap: &[u8], i: usize) -> bool {
    bitmap[i / 8] & (1 << (i % 8)) != 0
}

pub(crate) fn set_bit(bitmap: &mut [u8], i: usize) {
    bitmap[i / 8] |= 1 << (i % 8);
}

fn bitmap_from_iter(len: usize, bits: impl Iterator<Item = bool>) -> Vec<u8> {
    let mut out = vec![0u8; bitmap_len(len)];
    for (i, b) in bits.enumerate() {
        if b { set_bit(&mut out, i); }
    }
    out
}

// ── Array ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    data_type: DataType,
    len:       usize,
    validity:  Option<Vec<u8>>,
    offsets:   Vec<u32>,
    values:    Vec<u8>,
    children:  Vec<Array>,
}

impl Array {
    /// 由原始缓冲区构建，并校验各缓冲区尺寸一致
    pub fn try_new(
        data_type: DataType,
        len:       usize,
        validity:  Option<Vec<u8>>,
        offsets:   Vec<u32>,
        values:    Vec<u8>,
        children:  Vec<Array>,
    ) -> Result<Self> {
        let array = Self { data_type, len, validity, offsets, values, children };
        array.validate()?;
        Ok(array)
    }

    pub fn new_empty(data_type: &DataType) -> Self {
        let offsets = if has_offsets(data_type) { vec![0] } else { vec![] };
        let children = match data_type {
            DataType::List(c) | DataType::FixedSizeList(c, _) => vec![Self::new_empty(&c.data_type)],
            DataType::Struct(fs) => fs.iter().map(|f| Self::new_empty(&f.data_type)).collect(),
            _ => vec![],
        };
        Self { data_type: data_type.clone(), len: 0, validity: None, offsets, values: vec![], children }
    }

    /// 全部为 NULL 的数组（新增列在旧 fragment 上的读取结果）
    pub fn new_null(data_type: &DataType, len: usize) -> Self {
        let validity = Some(vec![0u8; bitmap_len(len)]);
        let (offsets, values, children) = match data_type {
            DataType::Boolean => (vec![], vec![0u8; bitmap_len(len)], vec![]),
            DataType::Utf8 | DataType::Binary => (vec![0u32; len + 1], vec![], vec![]),
            DataType::List(c) => (vec![0u32; len + 1], vec![], vec![Self::new_empty(&c.data_type)]),
            DataType::FixedSizeList(c, n) =>
                (vec![], vec![], vec![Self::new_null(&c.data_type, len * *n as usize)]),
            DataType::Struct(fs) =>
                (vec![], vec![], fs.iter().map(|f| Self::new_null(&f.data_type, len)).collect()),
            dt => (vec![], vec![0u8; len * dt.fixed_width().unwrap_or(0)], vec![]),
        };
        Self { data_type: data_type.clone(), len, validity, offsets, values, children }
    }

    // ── 访问器 ────────────────────────────────────────────────────────────────

    pub fn data_type(&self) -> &DataType   { &self.data_type }
    pub fn len(&self)       -> usize       { self.len }
    pub fn is_empty(&self)  -> bool        { self.len == 0 }
    pub fn validity(&self)  -> Option<&[u8]> { self.validity.as_deref() }
    pub fn offsets(&self)   -> &[u32]      { &self.offsets }
    pub fn values(&self)    -> &[u8]       { &self.values }
    pub fn children(&self)  -> &[Array]    { &self.children }

    pub fn is_null(&self, i: usize) -> bool {
        self.validity.as_ref().map(|bm| !get_bit(bm, i)).unwrap_or(false)
    }

    pub fn null_count(&self) -> usize {
        match &self.validity {
            Some(bm) => (0..self.len).filter(|&i| !get_bit(bm, i)).count(),
            None     => 0,
        }
    }

    /// 第 i 行的值
    pub fn value(&self, i: usize) -> Value {
        if self.is_null(i) {
            return Value::Null;
        }
        match &self.data_type {
            DataType::Boolean => Value::Boolean(get_bit(&self.values, i)),
            DataType::Utf8 => {
                let (s, e) = self.value_range(i);
                Value::Utf8(String::from_utf8_lossy(&self.values[s..e]).into_owned())
            }
            DataType::Binary => {
                let (s, e) = self.value_range(i);
                Value::Binary(self.values[s..e].to_vec())
            }
            DataType::List(_) => {
                let (s, e) = self.value_range(i);
                Value::List((s..e).map(|j| self.children[0].value(j)).collect())
            }
            DataType::FixedSizeList(_, n) => {
                let n = *n as usize;
                Value::List((i * n..(i + 1) * n).map(|j| self.children[0].value(j)).collect())
            }
            DataType::Struct(_) => Value::Struct(self.children.iter().map(|c| c.value(i)).collect()),
            dt => {
                let w = dt.fixed_width().unwrap_or(0);
                read_fixed(dt, &self.values[i * w..(i + 1) * w])
            }
        }
    }

    pub fn to_values(&self) -> Vec<Value> {
        (0..self.len).map(|i| self.value(i)).collect()
    }

    fn value_range(&self, i: usize) -> (usize, usize) {
        (self.offsets[i] as usize, self.offsets[i + 1] as usize)
    }

    // ── 构建 ──────────────────────────────────────────────────────────────────

    /// 由行值构建；值的类型必须与 `data_type` 一致（Null 除外）
    pub fn from_values(data_type: &DataType, values: &[Value]) -> Result<Self> {
        let len = values.len();
        let validity = values.iter().any(Value::is_null)
            .then(|| bitmap_from_iter(len, values.iter().map(|v| !v.is_null())));
        let mismatch = |v: &Value| LanceError::invalid(
            format!("value {v} does not match column type {data_type}"));

        let mut offsets  = Vec::new();
        let mut buf      = Vec::new();
        let mut children = Vec::new();

        match data_type {
            DataType::Boolean => {
                buf = vec![0u8; bitmap_len(len)];
                for (i, v) in values.iter().enumerate() {
                    match v {
                        Value::Boolean(true)  => set_bit(&mut buf, i),
                        Value::Boolean(false) | Value::Null => {}
                        other => return Err(mismatch(other)),
                    }
                }
            }
            DataType::Utf8 | DataType::Binary => {
                offsets.push(0u32);
                for v in values {
                    match (data_type, v) {
                        (_, Value::Null) => {}
                        (DataType::Utf8, Value::Utf8(s))     => buf.extend_from_slice(s.as_bytes()),
                        (DataType::Binary, Value::Binary(b)) => buf.extend_from_slice(b),
                        (_, other) => return Err(mismatch(other)),
                    }
                    offsets.push(offset_u32(buf.len())?);
                }
            }
            DataType::List(child) => {
                offsets.push(0u32);
                let mut flat = Vec::new();
                for v in values {
                    match v {
                        Value::Null => {}
                        Value::List(items) => flat.extend(items.iter().cloned()),
                        other => return Err(mismatch(other)),
                    }
                    offsets.push(offset_u32(flat.len())?);
                }
                children.push(Self::from_values(&child.data_type, &flat)?);
            }
            DataType::FixedSizeList(child, n) => {
                let n = *n as usize;
                let mut flat = Vec::with_capacity(len * n);
                for v in values {
                    match v {
                        Value::Null => flat.extend(std::iter::repeat(Value::Null).take(n)),
                        Value::List(items) if items.len() == n => flat.extend(items.iter().cloned()),
                        other => return Err(mismatch(other)),
                    }
                }
                children.push(Self::from_values(&child.data_type, &flat)?);
            }
            DataType::Struct(fields) => {
                let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(len); fields.len()];
                for v in values {
                    match v {
                        Value::Null => columns.iter_mut().for_each(|c| c.push(Value::Null)),
                        Value::Struct(items) if items.len() == fields.len() => {
                            for (c, item) in columns.iter_mut().zip(items) {
                                c.push(item.clone());
                            }
                        }
                        other => return Err(mismatch(other)),
                    }
                }
                for (f, col) in fields.iter().zip(&columns) {
                    children.push(Self::from_values(&f.data_type, col)?);
                }
            }
            dt => {
                let w = dt.fixed_width().unwrap_or(0);
                buf.reserve(len * w);
                for v in values {
                    if !push_fixed(&mut buf, dt, v) {
                        return Err(mismatch(v));
                    }
                }
            }
        }

        Self::try_new(data_type.clone(), len, validity, offsets, buf, children)
    }

    pub fn from_i32(values: Vec<i32>) -> Self {
        let mut buf = vec![0u8; values.len() * 4];
        LittleEndian::write_i32_into(&values, &mut buf);
        Self::fixed(DataType::Int32, values.len(), buf)
    }

    pub fn from_i64(values: Vec<i64>) -> Self {
        let mut buf = vec![0u8; values.len() * 8];
        LittleEndian::write_i64_into(&values, &mut buf);
        Self::fixed(DataType::Int64, values.len(), buf)
    }

    pub fn from_u64(values: Vec<u64>) -> Self {
        let mut buf = vec![0u8; values.len() * 8];
        LittleEndian::write_u64_into(&values, &mut buf);
        Self::fixed(DataType::UInt64, values.len(), buf)
    }

    pub fn from_f32(values: Vec<f32>) -> Self {
        let mut buf = vec![0u8; values.len() * 4];
        LittleEndian::write_f32_into(&values, &mut buf);
        Self::fixed(DataType::Float32, values.len(), buf)
    }

    pub fn from_f64(values: Vec<f64>) -> Self {
        let mut buf = vec![0u8; values.len() * 8];
        LittleEndian::write_f64_into(&values, &mut buf);
        Self::fixed(DataType::Float64, values.len(), buf)
    }

    pub fn from_bools(values: Vec<bool>) -> Self {
        let len = values.len();
        Self::fixed(DataType::Boolean, len, bitmap_from_iter(len, values.into_iter()))
    }

    pub fn from_strings<S: AsRef<str>>(values: &[S]) -> Self {
        let mut offsets = Vec::with_capacity(values.len() + 1);
        let mut data    = Vec::new();
        offsets.push(0u32);
        for s in values {
            data.extend_from_slice(s.as_ref().as_bytes());
            offsets.push(data.len() as u32);
        }
        Self {
            data_type: DataType::Utf8, len: values.len(),
            validity: None, offsets, values: data, children: vec![],
        }
    }

    /// `FixedSizeList<Float32, dim>`，`flat.len()` 必须是 dim 的整数倍
    pub fn from_vectors(dim: usize, flat: Vec<f32>) -> Result<Self> {
        if dim == 0 || flat.len() % dim != 0 {
            return Err(LanceError::invalid(format!(
                "{} floats cannot be split into vectors of dim {dim}", flat.len())));
        }
        let len   = flat.len() / dim;
        let child = Self::from_f32(flat);
        let item  = Field::new("item", DataType::Float32, true);
        Self::try_new(
            DataType::FixedSizeList(Box::new(item), dim as u32),
            len, None, vec![], vec![], vec![child],
        )
    }

    fn fixed(data_type: DataType, len: usize, values: Vec<u8>) -> Self {
        Self { data_type, len, validity: None, offsets: vec![], values, children: vec![] }
    }

    // ── 类型化读取 ────────────────────────────────────────────────────────────

    /// Float32 数组的原始值（NULL 槽位为 0.0）
    pub fn f32_values(&self) -> Result<Vec<f32>> {
        if self.data_type != DataType::Float32 {
            return Err(LanceError::invalid(format!("expected float32, got {}", self.data_type)));
        }
        let mut out = vec![0f32; self.len];
        LittleEndian::read_f32_into(&self.values, &mut out);
        Ok(out)
    }

    /// 向量列展开为 (dim, 扁平 f32)
    pub fn vector_values(&self) -> Result<(usize, Vec<f32>)> {
        let dim = self.data_type.vector_dim().ok_or_else(|| LanceError::invalid(
            format!("expected fixed_size_list<float32>, got {}", self.data_type)))?;
        Ok((dim, self.children[0].f32_values()?))
    }

    // ── 变换 ──────────────────────────────────────────────────────────────────

    /// 按下标取行；越界返回 InvalidInput
    pub fn take(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len) {
            return Err(LanceError::invalid(format!("take index {bad} out of bounds (len {})", self.len)));
        }
        Ok(self.take_unchecked(indices))
    }

    fn take_unchecked(&self, indices: &[usize]) -> Self {
        let len = indices.len();
        let validity = self.validity.as_ref()
            .map(|bm| bitmap_from_iter(len, indices.iter().map(|&i| get_bit(bm, i))));

        let mut offsets  = Vec::new();
        let mut values   = Vec::new();
        let mut children = Vec::new();

        match &self.data_type {
            DataType::Boolean => {
                values = bitmap_from_iter(len, indices.iter().map(|&i| get_bit(&self.values, i)));
            }
            DataType::Utf8 | DataType::Binary => {
                offsets.push(0u32);
                for &i in indices {
                    let (s, e) = self.value_range(i);
                    values.extend_from_slice(&self.values[s..e]);
                    offsets.push(values.len() as u32);
                }
            }
            DataType::List(_) => {
                offsets.push(0u32);
                let mut child_idx = Vec::new();
                for &i in indices {
                    let (s, e) = self.value_range(i);
                    child_idx.extend(s..e);
                    offsets.push(child_idx.len() as u32);
                }
                children.push(self.children[0].take_unchecked(&child_idx));
            }
            DataType::FixedSizeList(_, n) => {
                let n = *n as usize;
                let child_idx: Vec<usize> = indices.iter().flat_map(|&i| i * n..(i + 1) * n).collect();
                children.push(self.children[0].take_unchecked(&child_idx));
            }
            DataType::Struct(_) => {
                children = self.children.iter().map(|c| c.take_unchecked(indices)).collect();
            }
            dt => {
                let w = dt.fixed_width().unwrap_or(0);
                values.reserve(len * w);
                for &i in indices {
                    values.extend_from_slice(&self.values[i * w..(i + 1) * w]);
                }
            }
        }
        Self { data_type: self.data_type.clone(), len, validity, offsets, values, children }
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        let idx: Vec<usize> = (offset..offset + len).collect();
        self.take(&idx)
    }

    pub fn filter(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.len {
            return Err(LanceError::invalid(format!(
                "filter mask length {} != array length {}", mask.len(), self.len)));
        }
        let idx: Vec<usize> = mask.iter().enumerate().filter(|(_, &m)| m).map(|(i, _)| i).collect();
        Ok(self.take_unchecked(&idx))
    }

    /// 拼接同类型数组
    pub fn concat(data_type: &DataType, arrays: &[&Array]) -> Result<Self> {
        if let Some(bad) = arrays.iter().find(|a| &a.data_type != data_type) {
            return Err(LanceError::invalid(format!(
                "cannot concat {} into {data_type}", bad.data_type)));
        }
        if arrays.is_empty() {
            return Ok(Self::new_empty(data_type));
        }
        let len: usize = arrays.iter().map(|a| a.len).sum();
        let validity = arrays.iter().any(|a| a.validity.is_some()).then(|| {
            bitmap_from_iter(len, arrays.iter().flat_map(|a| (0..a.len).map(move |i| !a.is_null(i))))
        });

        let mut offsets  = Vec::new();
        let mut values   = Vec::new();
        let mut children = Vec::new();

        match data_type {
            DataType::Boolean => {
                values = bitmap_from_iter(
                    len,
                    arrays.iter().flat_map(|a| (0..a.len).map(move |i| get_bit(&a.values, i))),
                );
            }
            DataType::Utf8 | DataType::Binary | DataType::List(_) => {
                offsets.push(0u32);
                let mut base = 0u32;
                for a in arrays {
                    let start = a.offsets[0];
                    offsets.extend(a.offsets[1..].iter().map(|o| o - start + base));
                    base += a.offsets[a.len] - start;
                    if data_type.is_var_width() {
                        values.extend_from_slice(&a.values[start as usize..a.offsets[a.len] as usize]);
                    }
                }
                if let DataType::List(c) = data_type {
                    let parts = arrays.iter()
                        .map(|a| a.children[0].slice(a.offsets[0] as usize, (a.offsets[a.len] - a.offsets[0]) as usize))
                        .collect::<Result<Vec<_>>>()?;
                    children.push(Self::concat(&c.data_type, &parts.iter().collect::<Vec<_>>())?);
                }
            }
            DataType::FixedSizeList(c, _) => {
                let parts: Vec<&Array> = arrays.iter().map(|a| &a.children[0]).collect();
                children.push(Self::concat(&c.data_type, &parts)?);
            }
            DataType::Struct(fields) => {
                for (i, f) in fields.iter().enumerate() {
                    let parts: Vec<&Array> = arrays.iter().map(|a| &a.children[i]).collect();
                    children.push(Self::concat(&f.data_type, &parts)?);
                }
            }
            _ => {
                for a in arrays {
                    values.extend_from_slice(&a.values);
                }
            }
        }
        Self::try_new(data_type.clone(), len, validity, offsets, values, children)
    }

    // ── 校验 ──────────────────────────────────────────────────────────────────

    fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(LanceError::invalid(format!("{} array: {msg}", self.data_type)));
        let len = self.len;

        if let Some(bm) = &self.validity {
            if bm.len() != bitmap_len(len) {
                return bad(format!("validity has {} bytes, expected {}", bm.len(), bitmap_len(len)));
            }
        }
        if has_offsets(&self.data_type) {
            if self.offsets.len() != len + 1 {
                return bad(format!("{} offsets for {len} values", self.offsets.len()));
            }
            if self.offsets.windows(2).any(|w| w[0] > w[1]) {
                return bad("offsets are not monotonic".into());
            }
        } else if !self.offsets.is_empty() {
            return bad("unexpected offsets buffer".into());
        }

        match &self.data_type {
            DataType::Boolean => {
                if self.values.len() != bitmap_len(len) {
                    return bad(format!("{} value bytes for {len} bits", self.values.len()));
                }
            }
            DataType::Utf8 | DataType::Binary => {
                if self.offsets[len] as usize != self.values.len() {
                    return bad("last offset does not match data length".into());
                }
                if self.data_type == DataType::Utf8 {
                    for i in 0..len {
                        let (s, e) = self.value_range(i);
                        if std::str::from_utf8(&self.values[s..e]).is_err() {
                            return bad(format!("value {i} is not valid utf-8"));
                        }
                    }
                }
            }
            DataType::List(c) => {
                if self.children.len() != 1 || self.children[0].data_type != c.data_type {
                    return bad("list child type mismatch".into());
                }
                if self.offsets[len] as usize > self.children[0].len {
                    return bad("list offsets exceed child length".into());
                }
            }
            DataType::FixedSizeList(c, n) => {
                if self.children.len() != 1 || self.children[0].data_type != c.data_type {
                    return bad("fixed_size_list child type mismatch".into());
                }
                if self.children[0].len != len * *n as usize {
                    return bad(format!("child has {} values, expected {}", self.children[0].len, len * *n as usize));
                }
            }
            DataType::Struct(fields) => {
                if self.children.len() != fields.len() {
                    return bad("struct child count mismatch".into());
                }
                for (f, c) in fields.iter().zip(&self.children) {
                    if c.data_type != f.data_type || c.len != len {
                        return bad(format!("struct child `{}` mismatch", f.name));
                    }
                }
            }
            dt => {
                let w = dt.fixed_width().unwrap_or(0);
                if self.values.len() != len * w {
                    return bad(format!("{} value bytes, expected {}", self.values.len(), len * w));
                }
            }
        }
        Ok(())
    }
}

fn has_offsets(dt: &DataType) -> bool {
    matches!(dt, DataType::Utf8 | DataType::Binary | DataType::List(_))
}

fn offset_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| LanceError::invalid("array exceeds 4GiB of offsets"))
}

fn push_fixed(out: &mut Vec<u8>, dt: &DataType, v: &Value) -> bool {
    match (dt, v) {
        (dt, Value::Null) => out.extend(std::iter::repeat(0u8).take(dt.fixed_width().unwrap_or(0))),
        (DataType::Int8, Value::Int8(x))       => out.push(*x as u8),
        (DataType::Int16, Value::Int16(x))     => out.extend_from_slice(&x.to_le_bytes()),
        (DataType::Int32, Value::Int32(x))     => out.extend_from_slice(&x.to_le_bytes()),
        (DataType::Date32, Value::Date32(x))   => out.extend_from_slice(&x.to_le_bytes()),
        (DataType::Int64, Value::Int64(x))     => out.extend_from_slice(&x.to_le_bytes()),
        (DataType::UInt32, Value::UInt32(x))   => out.extend_from_slice(&x.to_le_bytes()),
        (DataType::UInt64, Value::UInt64(x))   => out.extend_from_slice(&x.to_le_bytes()),
        (DataType::Float32, Value::Float32(x)) => out.extend_from_slice(&x.to_le_bytes()),
        (DataType::Float64, Value::Float64(x)) => out.extend_from_slice(&x.to_le_bytes()),
        _ => return false,
    }
    true
}

fn read_fixed(dt: &DataType, b: &[u8]) -> Value {
    match dt {
        DataType::Int8    => Value::Int8(b[0] as i8),
        DataType::Int16   => Value::Int16(LittleEndian::read_i16(b)),
        DataType::Int32   => Value::Int32(LittleEndian::read_i32(b)),
        DataType::Date32  => Value::Date32(LittleEndian::read_i32(b)),
        DataType::Int64   => Value::Int64(LittleEndian::read_i64(b)),
        DataType::UInt32  => Value::UInt32(LittleEndian::read_u32(b)),
        DataType::UInt64  => Value::UInt64(LittleEndian::read_u64(b)),
        DataType::Float32 => Value::Float32(LittleEndian::read_f32(b)),
        DataType::Float64 => Value::Float64(LittleEndian::read_f64(b)),
        _ => Value::Null,
    }
}

// ── RecordBatch ───────────────────────────────────────────────────────────────

/// 一组等长列 + Schema
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    schema:   Arc<Schema>,
    columns:  Vec<Array>,
    num_rows: usize,
}

impl RecordBatch {
    pub fn try_new(schema: Arc<Schema>, columns: Vec<Array>) -> Result<Self> {
        if schema.len() != columns.len() {
            return Err(LanceError::invalid(format!(
                "schema has {} fields but {} columns were given", schema.len(), columns.len())));
        }
        let num_rows = columns.first().map(Array::len).unwrap_or(0);
        for (f, c) in schema.fields.iter().zip(&columns) {
            if c.data_type() != &f.data_type {
                return Err(LanceError::unsupported(&f.name, format!(
                    "array type {} does not match field type {}", c.data_type(), f.data_type)));
            }
            if c.len() != num_rows {
                return Err(LanceError::invalid(format!(
                    "column `{}` has {} rows, expected {num_rows}", f.name, c.len())));
            }
            if !f.nullable && c.null_count() > 0 {
                return Err(LanceError::invalid(format!("non-nullable column `{}` contains nulls", f.name)));
            }
        }
        Ok(Self { schema, columns, num_rows })
    }

    pub fn new_empty(schema: Arc<Schema>) -> Self {
        let columns = schema.fields.iter().map(|f| Array::new_empty(&f.data_type)).collect();
        Self { schema, columns, num_rows: 0 }
    }

    pub fn schema(&self)      -> &Arc<Schema> { &self.schema }
    pub fn num_rows(&self)    -> usize        { self.num_rows }
    pub fn num_columns(&self) -> usize        { self.columns.len() }
    pub fn columns(&self)     -> &[Array]     { &self.columns }
    pub fn column(&self, i: usize) -> &Array  { &self.columns[i] }

    pub fn column_by_name(&self, name: &str) -> Option<&Array> {
        self.schema.index_of(name).map(|i| &self.columns[i])
    }

    pub fn row(&self, i: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.value(i)).collect()
    }

    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let schema = self.schema.project(names)?;
        let columns = names.iter()
            .map(|n| self.schema.index_of(n.as_ref()).map(|i| self.columns[i].clone()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| LanceError::invalid("projection column missing"))?;
        Ok(Self { schema: Arc::new(schema), columns, num_rows: self.num_rows })
    }

    /// 追加一列（`_rowid` / `_distance` 等派生列）
    pub fn with_column(&self, field: Field, array: Array) -> Result<Self> {
        let mut fields = self.schema.fields.clone();
        fields.push(field);
        let schema = Schema::from_parts(fields, self.schema.max_field_id);
        let mut columns = self.columns.clone();
        columns.push(array);
        Self::try_new(Arc::new(schema), columns)
    }

    pub fn take(&self, indices: &[usize]) -> Result<Self> {
        let columns = self.columns.iter().map(|c| c.take(indices)).collect::<Result<Vec<_>>>()?;
        Ok(Self { schema: self.schema.clone(), columns, num_rows: indices.len() })
    }

    pub fn filter(&self, mask: &[bool]) -> Result<Self> {
        let columns = self.columns.iter().map(|c| c.filter(mask)).collect::<Result<Vec<_>>>()?;
        let num_rows = mask.iter().filter(|m| **m).count();
        Ok(Self { schema: self.schema.clone(), columns, num_rows })
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        let columns = self.columns.iter().map(|c| c.slice(offset, len)).collect::<Result<Vec<_>>>()?;
        Ok(Self { schema: self.schema.clone(), columns, num_rows: len })
    }

    pub fn concat(schema: Arc<Schema>, batches: &[RecordBatch]) -> Result<Self> {
        let columns = schema.fields.iter()
            .enumerate()
            .map(|(i, f)| {
                let parts: Vec<&Array> = batches.iter().map(|b| &b.columns[i]).collect();
                Array::concat(&f.data_type, &parts)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::try_new(schema, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_type() -> DataType {
        DataType::List(Box::new(Field::new("item", DataType::Int32, true)))
    }

    #[test]
    fn from_values_round_trips_through_value() {
        let vals = vec![
            Value::List(vec![Value::Int32(1), Value::Null]),
            Value::Null,
            Value::List(vec![]),
        ];
        let arr = Array::from_values(&list_type(), &vals).unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.null_count(), 1);
        assert_eq!(arr.to_values(), vals);
    }

    #[test]
    fn take_and_concat_preserve_values() {
        let a = Array::from_strings(&["a", "bb", ""]);
        let b = Array::from_values(&DataType::Utf8, &[Value::Null, Value::Utf8("z".into())]).unwrap();
        let all = Array::concat(&DataType::Utf8, &[&a, &b]).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all.value(3), Value::Null);

        let t = all.take(&[4, 1, 2]).unwrap();
        assert_eq!(t.to_values(), vec![
            Value::Utf8("z".into()), Value::Utf8("bb".into()), Value::Utf8("".into()),
        ]);
        assert!(all.take(&[9]).is_err());
    }

    #[test]
    fn concat_sliced_lists() {
        let vals: Vec<Value> = (0..4)
            .map(|i| Value::List((0..i).map(Value::Int32).collect()))
            .collect();
        let arr = Array::from_values(&list_type(), &vals).unwrap();
        let tail = arr.slice(2, 2).unwrap();
        let joined = Array::concat(&list_type(), &[&tail, &tail]).unwrap();
        assert_eq!(joined.value(3), vals[3]);
        assert_eq!(joined.children()[0].len(), 10);
    }

    #[test]
    fn vectors_and_filter() {
        let arr = Array::from_vectors(2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let kept = arr.filter(&[true, false, true]).unwrap();
        let (dim, flat) = kept.vector_values().unwrap();
        assert_eq!(dim, 2);
        assert_eq!(flat, vec![1.0, 2.0, 5.0, 6.0]);
        assert!(Array::from_vectors(4, vec![1.0; 6]).is_err());
    }

    #[test]
    fn batch_rejects_type_mismatch_and_nulls_in_required_column() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]).unwrap());
        let err = RecordBatch::try_new(schema.clone(), vec![Array::from_i32(vec![1])]);
        assert!(matches!(err, Err(LanceError::UnsupportedSchema { .. })));

        let nulls = Array::from_values(&DataType::Int64, &[Value::Null]).unwrap();
        assert!(RecordBatch::try_new(schema, vec![nulls]).is_err());
    }

    #[test]
    fn null_array_of_struct() {
        let dt = DataType::Struct(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Utf8, true),
        ]);
        let arr = Array::new_null(&dt, 3);
        assert_eq!(arr.null_count(), 3);
        assert_eq!(arr.value(1), Value::Null);
        assert!(Array::try_new(dt, 3, arr.validity().map(|v| v.to_vec()), vec![], vec![], arr.children().to_vec()).is_ok());
    }
}
