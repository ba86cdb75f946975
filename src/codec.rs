//! 列编解码：Array ⇄ 页字节
//!
//! 负载是一棵缓冲区树，每个节点按顺序写出：
//!
//! ```text
//! has_validity (u8) [validity buffer]
//! [offsets buffer]              仅 List；Utf8/Binary 的 offsets 随值缓冲区一起编码
//! [values buffer]               Boolean 位图 / 定长值 / 变长值
//! child_count (u8) { child_len (u32) node }*
//! ```
//!
//! 每个缓冲区 = encoding tag (u8) + u32 长度前缀的编码字节。

use byteorder::{ByteOrder, LittleEndian};
use crate::array::{bitmap_len, Array};
use crate::common::{LanceError, Result};
use crate::config::CodecConfig;
use crate::encoding::{self, Buffer, BufferKind, Decoded};
use crate::field_type::{DataType, EncodingType, Field};
use crate::format::{MetaReader, MetaWriter};
use crate::page::{PageBuilder, PageDecoder};

const WHAT: &str = "page payload";

/// 将数组编码为自描述页
pub fn encode(array: &Array, field: &Field, config: &CodecConfig) -> Result<Vec<u8>> {
    if array.data_type() != &field.data_type {
        return Err(LanceError::unsupported(&field.name, format!(
            "array type {} does not match field type {}", array.data_type(), field.data_type)));
    }
    let mut w = MetaWriter::new();
    encode_node(&mut w, array, config.encoding).map_err(|e| name_column(e, &field.name))?;
    let payload = w.finish();
    PageBuilder::new(field.data_type.clone(), config.compression).build(array.len(), &payload)
}

/// 解码页；页内记录的类型必须与 `field` 一致
pub fn decode(data: &[u8], field: &Field) -> Result<Array> {
    let location = format!("column `{}`", field.name);
    let page = PageDecoder::decode(data).map_err(|e| e.within(&location))?;
    if page.header.data_type != field.data_type {
        return Err(LanceError::corrupt(location, format!(
            "page holds {} but field is {}", page.header.data_type, field.data_type)));
    }
    let mut r = MetaReader::new(&page.payload, WHAT);
    let array = decode_node(&mut r, &field.data_type, page.header.num_rows as usize)
        .and_then(|a| r.finish().map(|_| a))
        .map_err(|e| e.within(&location))?;
    Ok(array)
}

fn name_column(err: LanceError, column: &str) -> LanceError {
    match err {
        LanceError::UnsupportedSchema { column: c, message } if c.is_empty() =>
            LanceError::UnsupportedSchema { column: column.into(), message },
        other => other,
    }
}

// ── 编码 ──────────────────────────────────────────────────────────────────────

fn write_buffer(w: &mut MetaWriter, buf: Buffer<'_>, enc: EncodingType) -> Result<()> {
    let bytes = encoding::encode(buf, enc)?;
    w.u8(enc.tag()).bytes(&bytes);
    Ok(())
}

/// 强制编码只作用于值缓冲区；validity / offsets 固定策略
fn write_values(w: &mut MetaWriter, buf: Buffer<'_>, dt: &DataType, forced: Option<EncodingType>) -> Result<()> {
    let enc = match forced {
        Some(enc) if !encoding::supports(enc, &buf) =>
            return Err(LanceError::unsupported("", format!("{enc:?} encoding cannot be used for {dt}"))),
        Some(enc) => enc,
        None      => encoding::choose(&buf, dt.is_integer()),
    };
    write_buffer(w, buf, enc)
}

fn encode_node(w: &mut MetaWriter, array: &Array, forced: Option<EncodingType>) -> Result<()> {
    match array.validity() {
        Some(bm) => {
            w.u8(1);
            let buf = Buffer::Fixed { data: bm, width: 1 };
            write_buffer(w, buf, encoding::choose(&buf, false))?;
        }
        None => { w.u8(0); }
    }

    let dt = array.data_type();
    match dt {
        DataType::Utf8 | DataType::Binary => {
            let buf = Buffer::Var { offsets: array.offsets(), data: array.values() };
            write_values(w, buf, dt, forced)?;
        }
        DataType::List(_) => {
            let mut raw = vec![0u8; array.offsets().len() * 4];
            LittleEndian::write_u32_into(array.offsets(), &mut raw);
            write_buffer(w, Buffer::Fixed { data: &raw, width: 4 }, EncodingType::DeltaBinary)?;
        }
        DataType::Boolean => {
            write_values(w, Buffer::Fixed { data: array.values(), width: 1 }, dt, forced)?;
        }
        DataType::FixedSizeList(..) | DataType::Struct(_) => {}
        _ => {
            let width = dt.fixed_width()
                .ok_or_else(|| LanceError::unsupported("", format!("no physical layout for {dt}")))?;
            write_values(w, Buffer::Fixed { data: array.values(), width }, dt, forced)?;
        }
    }

    w.u8(array.children().len() as u8);
    for child in array.children() {
        let len = u32::try_from(child.len())
            .map_err(|_| LanceError::invalid("child array exceeds u32 rows"))?;
        w.u32(len);
        encode_node(w, child, forced)?;
    }
    Ok(())
}

// ── 解码 ──────────────────────────────────────────────────────────────────────

fn read_buffer(r: &mut MetaReader<'_>, kind: BufferKind, count: usize) -> Result<Decoded> {
    let tag = r.u8()?;
    let enc = EncodingType::from_tag(tag)
        .ok_or_else(|| LanceError::corrupt(WHAT, format!("unknown encoding tag {tag}")))?;
    let bytes = r.bytes()?;
    encoding::decode(bytes, enc, kind, count)
}

fn read_fixed(r: &mut MetaReader<'_>, width: usize, count: usize) -> Result<Vec<u8>> {
    match read_buffer(r, BufferKind::Fixed { width }, count)? {
        Decoded::Fixed(v) => Ok(v),
        Decoded::Var { .. } => Err(LanceError::corrupt(WHAT, "expected fixed-width buffer")),
    }
}

fn child_types(dt: &DataType) -> Vec<&DataType> {
    match dt {
        DataType::List(c) | DataType::FixedSizeList(c, _) => vec![&c.data_type],
        DataType::Struct(fs) => fs.iter().map(|f| &f.data_type).collect(),
        _ => vec![],
    }
}

fn decode_node(r: &mut MetaReader<'_>, dt: &DataType, len: usize) -> Result<Array> {
    let validity = match r.u8()? {
        0 => None,
        1 => Some(read_fixed(r, 1, bitmap_len(len))?),
        other => return Err(LanceError::corrupt(WHAT, format!("bad validity flag {other}"))),
    };

    let mut offsets = Vec::new();
    let mut values  = Vec::new();
    match dt {
        DataType::Utf8 | DataType::Binary => match read_buffer(r, BufferKind::Var, len)? {
            Decoded::Var { offsets: o, data } => { offsets = o; values = data; }
            Decoded::Fixed(_) => return Err(LanceError::corrupt(WHAT, "expected variable-width buffer")),
        },
        DataType::List(_) => {
            let count = len.checked_add(1)
                .ok_or_else(|| LanceError::corrupt(WHAT, "row count overflow"))?;
            let raw = read_fixed(r, 4, count)?;
            offsets = vec![0u32; count];
            LittleEndian::read_u32_into(&raw, &mut offsets);
        }
        DataType::Boolean => values = read_fixed(r, 1, bitmap_len(len))?,
        DataType::FixedSizeList(..) | DataType::Struct(_) => {}
        other => {
            let width = other.fixed_width()
                .ok_or_else(|| LanceError::corrupt(WHAT, format!("no physical layout for {other}")))?;
            values = read_fixed(r, width, len)?;
        }
    }

    let expected = child_types(dt);
    let n_children = r.u8()? as usize;
    if n_children != expected.len() {
        return Err(LanceError::corrupt(WHAT, format!(
            "{dt} node has {n_children} children, expected {}", expected.len())));
    }
    let mut children = Vec::with_capacity(n_children);
    for child_dt in expected {
        let child_len = r.u32()? as usize;
        children.push(decode_node(r, child_dt, child_len)?);
    }

    Array::try_new(dt.clone(), len, validity, offsets, values, children)
        .map_err(|e| LanceError::corrupt(WHAT, e.to_string()))
}
