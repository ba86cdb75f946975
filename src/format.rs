//! 元数据二进制格式工具（页头 / 文件 Footer / Manifest / 索引文件共用）
//!
//! 全部小端；变长字段以 u32 长度前缀。读越界统一报 `CorruptData`。

use byteorder::{ByteOrder, LittleEndian};
use crate::common::{LanceError, Result};
use crate::field_type::{DataType, Field, Value};
use crate::schema::Schema;

// ── 写 ────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct MetaWriter {
    buf: Vec<u8>,
}

impl MetaWriter {
    pub fn new() -> Self { Self::default() }

    pub fn u8(&mut self, v: u8)   -> &mut Self { self.buf.push(v); self }
    pub fn u16(&mut self, v: u16) -> &mut Self { self.buf.extend_from_slice(&v.to_le_bytes()); self }
    pub fn u32(&mut self, v: u32) -> &mut Self { self.buf.extend_from_slice(&v.to_le_bytes()); self }
    pub fn i32(&mut self, v: i32) -> &mut Self { self.buf.extend_from_slice(&v.to_le_bytes()); self }
    pub fn u64(&mut self, v: u64) -> &mut Self { self.buf.extend_from_slice(&v.to_le_bytes()); self }
    pub fn f32(&mut self, v: f32) -> &mut Self { self.buf.extend_from_slice(&v.to_le_bytes()); self }
    pub fn bool(&mut self, v: bool) -> &mut Self { self.u8(v as u8) }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn str(&mut self, v: &str) -> &mut Self { self.bytes(v.as_bytes()) }

    pub fn opt_str(&mut self, v: Option<&str>) -> &mut Self {
        match v {
            Some(s) => { self.u8(1); self.str(s) }
            None    => self.u8(0),
        }
    }

    pub fn f32_slice(&mut self, v: &[f32]) -> &mut Self {
        self.u32(v.len() as u32);
        let start = self.buf.len();
        self.buf.resize(start + v.len() * 4, 0);
        LittleEndian::write_f32_into(v, &mut self.buf[start..]);
        self
    }

    pub fn u64_slice(&mut self, v: &[u64]) -> &mut Self {
        self.u32(v.len() as u32);
        for x in v { self.u64(*x); }
        self
    }

    pub fn data_type(&mut self, dt: &DataType) -> &mut Self {
        self.u8(type_tag(dt));
        match dt {
            DataType::List(child) => { self.field(child); }
            DataType::FixedSizeList(child, n) => { self.u32(*n); self.field(child); }
            DataType::Struct(children) => {
                self.u32(children.len() as u32);
                for c in children { self.field(c); }
            }
            _ => {}
        }
        self
    }

    pub fn field(&mut self, f: &Field) -> &mut Self {
        self.str(&f.name).i32(f.id).bool(f.nullable).data_type(&f.data_type)
    }

    pub fn schema(&mut self, s: &Schema) -> &mut Self {
        self.i32(s.max_field_id).u32(s.fields.len() as u32);
        for f in &s.fields { self.field(f); }
        self
    }

    /// 标量值（索引键 / zone map 使用；嵌套值不支持）
    pub fn value(&mut self, v: &Value) -> &mut Self {
        match v {
            Value::Null       => self.u8(0),
            Value::Boolean(x) => self.u8(1).bool(*x),
            Value::Int8(x)    => self.u8(2).u8(*x as u8),
            Value::Int16(x)   => self.u8(3).u16(*x as u16),
            Value::Int32(x)   => self.u8(4).i32(*x),
            Value::Int64(x)   => self.u8(5).u64(*x as u64),
            Value::UInt32(x)  => self.u8(6).u32(*x),
            Value::UInt64(x)  => self.u8(7).u64(*x),
            Value::Float32(x) => self.u8(8).f32(*x),
            Value::Float64(x) => self.u8(9).u64(x.to_bits()),
            Value::Date32(x)  => self.u8(10).i32(*x),
            Value::Utf8(s)    => self.u8(11).str(s),
            Value::Binary(b)  => self.u8(12).bytes(b),
            Value::List(_) | Value::Struct(_) => self.u8(0),
        }
    }

    pub fn finish(self) -> Vec<u8> { self.buf }

    /// 追加 CRC32 后返回
    pub fn finish_with_crc(self) -> Vec<u8> {
        let mut buf = self.buf;
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }
}

fn type_tag(dt: &DataType) -> u8 {
    match dt {
        DataType::Boolean          => 1,
        DataType::Int8             => 2,
        DataType::Int16            => 3,
        DataType::Int32            => 4,
        DataType::Int64            => 5,
        DataType::UInt32           => 6,
        DataType::UInt64           => 7,
        DataType::Float32          => 8,
        DataType::Float64          => 9,
        DataType::Date32           => 10,
        DataType::Utf8             => 11,
        DataType::Binary           => 12,
        DataType::List(_)          => 13,
        DataType::FixedSizeList(..) => 14,
        DataType::Struct(_)        => 15,
    }
}

// ── 读 ────────────────────────────────────────────────────────────────────────

pub(crate) struct MetaReader<'a> {
    data: &'a [u8],
    pos:  usize,
    what: &'a str,
}

impl<'a> MetaReader<'a> {
    pub fn new(data: &'a [u8], what: &'a str) -> Self {
        Self { data, pos: 0, what }
    }

    /// 校验末尾 CRC32，返回去掉 CRC 的 reader
    pub fn with_crc(data: &'a [u8], what: &'a str) -> Result<Self> {
        if data.len() < 4 {
            return Err(LanceError::corrupt(what, "too short for checksum"));
        }
        let body = &data[..data.len() - 4];
        let stored = LittleEndian::read_u32(&data[data.len() - 4..]);
        if crc32fast::hash(body) != stored {
            return Err(LanceError::corrupt(what, "checksum mismatch"));
        }
        Ok(Self::new(body, what))
    }

    pub fn remaining(&self) -> usize { self.data.len() - self.pos }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(LanceError::corrupt(self.what, format!(
                "truncated: need {n} bytes at offset {}, {} left", self.pos, self.remaining())));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self)  -> Result<u8>  { Ok(self.take(1)?[0]) }
    pub fn u16(&mut self) -> Result<u16> { Ok(LittleEndian::read_u16(self.take(2)?)) }
    pub fn u32(&mut self) -> Result<u32> { Ok(LittleEndian::read_u32(self.take(4)?)) }
    pub fn i32(&mut self) -> Result<i32> { Ok(LittleEndian::read_i32(self.take(4)?)) }
    pub fn u64(&mut self) -> Result<u64> { Ok(LittleEndian::read_u64(self.take(8)?)) }
    pub fn f32(&mut self) -> Result<f32> { Ok(LittleEndian::read_f32(self.take(4)?)) }
    pub fn bool(&mut self) -> Result<bool> { Ok(self.u8()? != 0) }

    /// 读取长度前缀；长度超过剩余字节视为损坏，避免巨量分配
    pub fn len_prefix(&mut self, elem_size: usize) -> Result<usize> {
        let n = self.u32()? as usize;
        if n.saturating_mul(elem_size.max(1)) > self.remaining() {
            return Err(LanceError::corrupt(self.what, format!("length {n} exceeds remaining bytes")));
        }
        Ok(n)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.len_prefix(1)?;
        self.take(n)
    }

    pub fn str(&mut self) -> Result<String> {
        let b = self.bytes()?;
        String::from_utf8(b.to_vec())
            .map_err(|_| LanceError::corrupt(self.what, "string is not valid utf-8"))
    }

    pub fn opt_str(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.str()?)),
        }
    }

    pub fn f32_vec(&mut self) -> Result<Vec<f32>> {
        let n = self.len_prefix(4)?;
        let raw = self.take(n * 4)?;
        let mut out = vec![0f32; n];
        LittleEndian::read_f32_into(raw, &mut out);
        Ok(out)
    }

    pub fn u64_vec(&mut self) -> Result<Vec<u64>> {
        let n = self.len_prefix(8)?;
        (0..n).map(|_| self.u64()).collect()
    }

    pub fn data_type(&mut self) -> Result<DataType> {
        let tag = self.u8()?;
        Ok(match tag {
            1  => DataType::Boolean,
            2  => DataType::Int8,
            3  => DataType::Int16,
            4  => DataType::Int32,
            5  => DataType::Int64,
            6  => DataType::UInt32,
            7  => DataType::UInt64,
            8  => DataType::Float32,
            9  => DataType::Float64,
            10 => DataType::Date32,
            11 => DataType::Utf8,
            12 => DataType::Binary,
            13 => DataType::List(Box::new(self.field()?)),
            14 => {
                let n = self.u32()?;
                DataType::FixedSizeList(Box::new(self.field()?), n)
            }
            15 => {
                let n = self.len_prefix(1)?;
                DataType::Struct((0..n).map(|_| self.field()).collect::<Result<_>>()?)
            }
            other => return Err(LanceError::corrupt(self.what, format!("unknown type tag {other}"))),
        })
    }

    pub fn field(&mut self) -> Result<Field> {
        let name      = self.str()?;
        let id        = self.i32()?;
        let nullable  = self.bool()?;
        let data_type = self.data_type()?;
        Ok(Field { name, data_type, nullable, id })
    }

    pub fn schema(&mut self) -> Result<Schema> {
        let max_field_id = self.i32()?;
        let n = self.len_prefix(1)?;
        let fields = (0..n).map(|_| self.field()).collect::<Result<Vec<_>>>()?;
        Ok(Schema::from_parts(fields, max_field_id))
    }

    pub fn value(&mut self) -> Result<Value> {
        Ok(match self.u8()? {
            0  => Value::Null,
            1  => Value::Boolean(self.bool()?),
            2  => Value::Int8(self.u8()? as i8),
            3  => Value::Int16(self.u16()? as i16),
            4  => Value::Int32(self.i32()?),
            5  => Value::Int64(self.u64()? as i64),
            6  => Value::UInt32(self.u32()?),
            7  => Value::UInt64(self.u64()?),
            8  => Value::Float32(self.f32()?),
            9  => Value::Float64(f64::from_bits(self.u64()?)),
            10 => Value::Date32(self.i32()?),
            11 => Value::Utf8(self.str()?),
            12 => Value::Binary(self.bytes()?.to_vec()),
            other => return Err(LanceError::corrupt(self.what, format!("unknown value tag {other}"))),
        })
    }

    /// 确认已读完全部字节
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(LanceError::corrupt(self.what, format!("{} trailing bytes", self.remaining())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_survives_binary_form() {
        let schema = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::vector("emb", 8),
            Field::new("meta", DataType::Struct(vec![
                Field::new("tags", DataType::List(Box::new(Field::new("item", DataType::Utf8, true))), true),
                Field::new("score", DataType::Float64, true),
            ]), true),
        ]).unwrap();

        let mut w = MetaWriter::new();
        w.schema(&schema).value(&Value::Utf8("k".into())).value(&Value::Float64(-0.5));
        let bytes = w.finish_with_crc();

        let mut r = MetaReader::with_crc(&bytes, "test").unwrap();
        assert_eq!(r.schema().unwrap(), schema);
        assert_eq!(r.value().unwrap(), Value::Utf8("k".into()));
        assert_eq!(r.value().unwrap(), Value::Float64(-0.5));
        r.finish().unwrap();
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut w = MetaWriter::new();
        w.str("hello");
        let mut bytes = w.finish_with_crc();
        bytes[5] ^= 0xFF;
        assert!(matches!(MetaReader::with_crc(&bytes, "t"), Err(LanceError::CorruptData { .. })));
    }

    #[test]
    fn oversized_length_prefix_is_corrupt() {
        let mut w = MetaWriter::new();
        w.u32(1_000_000);
        let bytes = w.finish();
        let mut r = MetaReader::new(&bytes, "t");
        assert!(r.bytes().is_err());
    }
}
