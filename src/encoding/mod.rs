//! 缓冲区编码
//!
//! 支持四种编码：
//! - **Plain**：定长原样写出；变长为 (u32 len, bytes) 序列
//! - **RunLength**：(u32 count, value) 对，适合低基数定长值 / 位图
//! - **DeltaBinary**：整数相邻差值 zig-zag + LEB128 varint，offsets / 有序 ID 列
//! - **Dictionary**：变长值去重，字典 + u32 码
//!
//! 所有编码都是无损的：decode(encode(x)) 与 x 逐字节相同。

use std::collections::HashMap;
use byteorder::{ByteOrder, LittleEndian};
use crate::common::{LanceError, Result};
use crate::field_type::EncodingType;

const WHAT: &str = "encoded buffer";

/// 待编码缓冲区
#[derive(Debug, Clone, Copy)]
pub enum Buffer<'a> {
    /// 定长值，每个 `width` 字节
    Fixed { data: &'a [u8], width: usize },
    /// 变长值，`offsets.len() == count + 1`
    Var { offsets: &'a [u32], data: &'a [u8] },
}

/// 解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Fixed(Vec<u8>),
    Var { offsets: Vec<u32>, data: Vec<u8> },
}

/// 解码时需要的缓冲区形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Fixed { width: usize },
    Var,
}

// ── 统一编/解码入口 ───────────────────────────────────────────────────────────

/// 编码是否适用于该缓冲区
pub fn supports(enc: EncodingType, buf: &Buffer<'_>) -> bool {
    match (enc, buf) {
        (EncodingType::Plain, _)                          => true,
        (EncodingType::RunLength, Buffer::Fixed { width, .. }) => *width > 0,
        (EncodingType::DeltaBinary, Buffer::Fixed { width, .. }) => matches!(width, 1 | 2 | 4 | 8),
        (EncodingType::Dictionary, Buffer::Var { .. })    => true,
        _ => false,
    }
}

pub fn encode(buf: Buffer<'_>, enc: EncodingType) -> Result<Vec<u8>> {
    if !supports(enc, &buf) {
        return Err(LanceError::unsupported("", format!("{enc:?} cannot encode this buffer")));
    }
    match (enc, buf) {
        (EncodingType::Plain, Buffer::Fixed { data, .. })      => Ok(data.to_vec()),
        (EncodingType::Plain, Buffer::Var { offsets, data })   => Ok(plain::encode_var(offsets, data)),
        (EncodingType::RunLength, Buffer::Fixed { data, width }) => Ok(rle::encode(data, width)),
        (EncodingType::DeltaBinary, Buffer::Fixed { data, width }) => Ok(delta::encode(data, width)),
        (EncodingType::Dictionary, Buffer::Var { offsets, data }) => Ok(dict::encode(offsets, data)),
        (enc, _) => Err(LanceError::unsupported("", format!("{enc:?} cannot encode this buffer"))),
    }
}

pub fn decode(data: &[u8], enc: EncodingType, kind: BufferKind, count: usize) -> Result<Decoded> {
    match (enc, kind) {
        (EncodingType::Plain, BufferKind::Fixed { width }) => {
            if data.len() != count * width {
                return Err(LanceError::corrupt(WHAT, format!(
                    "plain buffer has {} bytes, expected {}", data.len(), count * width)));
            }
            Ok(Decoded::Fixed(data.to_vec()))
        }
        (EncodingType::Plain, BufferKind::Var) => plain::decode_var(data, count),
        (EncodingType::RunLength, BufferKind::Fixed { width }) =>
            rle::decode(data, width, count).map(Decoded::Fixed),
        (EncodingType::DeltaBinary, BufferKind::Fixed { width }) =>
            delta::decode(data, width, count).map(Decoded::Fixed),
        (EncodingType::Dictionary, BufferKind::Var) => dict::decode(data, count),
        (enc, kind) => Err(LanceError::corrupt(WHAT, format!("{enc:?} is not valid for {kind:?}"))),
    }
}

/// 自动选择编码：比较候选编码的实际大小
pub fn choose(buf: &Buffer<'_>, is_integer: bool) -> EncodingType {
    match buf {
        Buffer::Fixed { data, width } => {
            let plain_len = data.len();
            let mut best = (EncodingType::Plain, plain_len);
            if *width > 0 {
                let rle_len = rle::encoded_len(data, *width);
                if rle_len < best.1 { best = (EncodingType::RunLength, rle_len); }
            }
            if is_integer && matches!(width, 1 | 2 | 4 | 8) {
                let delta_len = delta::encoded_len(data, *width);
                if delta_len < best.1 { best = (EncodingType::DeltaBinary, delta_len); }
            }
            best.0
        }
        Buffer::Var { offsets, data } => {
            let count = offsets.len().saturating_sub(1);
            let distinct = (0..count)
                .map(|i| &data[offsets[i] as usize..offsets[i + 1] as usize])
                .collect::<std::collections::HashSet<_>>()
                .len();
            if count >= 8 && distinct * 2 <= count {
                EncodingType::Dictionary
            } else {
                EncodingType::Plain
            }
        }
    }
}

// ── varint ────────────────────────────────────────────────────────────────────

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 { v >>= 7; n += 1; }
    n
}

fn get_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut out = 0u64;
    for shift in (0..64).step_by(7) {
        let b = *data.get(*pos)
            .ok_or_else(|| LanceError::corrupt(WHAT, "truncated varint"))?;
        *pos += 1;
        out |= ((b & 0x7F) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(out);
        }
    }
    Err(LanceError::corrupt(WHAT, "varint longer than 10 bytes"))
}

fn read_u32_at(data: &[u8], pos: usize) -> Result<u32> {
    data.get(pos..pos + 4)
        .map(LittleEndian::read_u32)
        .ok_or_else(|| LanceError::corrupt(WHAT, format!("truncated at offset {pos}")))
}

// ── Plain ─────────────────────────────────────────────────────────────────────
mod plain {
    use super::*;

    pub fn encode_var(offsets: &[u32], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + offsets.len() * 4);
        for w in offsets.windows(2) {
            let v = &data[w[0] as usize..w[1] as usize];
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
        out
    }

    pub fn decode_var(data: &[u8], count: usize) -> Result<Decoded> {
        if count.saturating_mul(4) > data.len() {
            return Err(LanceError::corrupt(WHAT, format!("{count} values cannot fit in {} bytes", data.len())));
        }
        let mut offsets = Vec::with_capacity(count + 1);
        let mut values  = Vec::new();
        let mut pos     = 0usize;
        offsets.push(0u32);
        for _ in 0..count {
            let len = read_u32_at(data, pos)? as usize;
            pos += 4;
            let v = data.get(pos..pos + len)
                .ok_or_else(|| LanceError::corrupt(WHAT, "plain value overruns buffer"))?;
            values.extend_from_slice(v);
            offsets.push(values.len() as u32);
            pos += len;
        }
        if pos != data.len() {
            return Err(LanceError::corrupt(WHAT, "trailing bytes after plain values"));
        }
        Ok(Decoded::Var { offsets, data: values })
    }
}

// ── Run-Length Encoding ───────────────────────────────────────────────────────
mod rle {
    use super::*;

    fn runs(data: &[u8], width: usize) -> impl Iterator<Item = (u32, &[u8])> {
        let mut chunks = data.chunks_exact(width).peekable();
        std::iter::from_fn(move || {
            let cur = chunks.next()?;
            let mut run: u32 = 1;
            while chunks.peek() == Some(&cur) {
                chunks.next();
                run += 1;
            }
            Some((run, cur))
        })
    }

    pub fn encoded_len(data: &[u8], width: usize) -> usize {
        runs(data, width).count() * (4 + width)
    }

    pub fn encode(data: &[u8], width: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for (run, v) in runs(data, width) {
            out.extend_from_slice(&run.to_le_bytes());
            out.extend_from_slice(v);
        }
        out
    }

    pub fn decode(data: &[u8], width: usize, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            let run = read_u32_at(data, pos)? as usize;
            let v = data.get(pos + 4..pos + 4 + width)
                .ok_or_else(|| LanceError::corrupt(WHAT, "truncated run value"))?;
            pos += 4 + width;
            if out.len() / width.max(1) + run > count {
                return Err(LanceError::corrupt(WHAT, "runs exceed value count"));
            }
            for _ in 0..run { out.extend_from_slice(v); }
        }
        if out.len() != count * width {
            return Err(LanceError::corrupt(WHAT, format!(
                "rle produced {} values, expected {count}", out.len() / width.max(1))));
        }
        Ok(out)
    }
}

// ── Delta Binary ──────────────────────────────────────────────────────────────
mod delta {
    use super::*;

    fn read_int(b: &[u8], width: usize) -> i64 {
        match width {
            1 => b[0] as i8 as i64,
            2 => LittleEndian::read_i16(b) as i64,
            4 => LittleEndian::read_i32(b) as i64,
            _ => LittleEndian::read_i64(b),
        }
    }

    fn write_int(out: &mut Vec<u8>, v: i64, width: usize) {
        out.extend_from_slice(&v.to_le_bytes()[..width]);
    }

    fn zigzag(v: i64) -> u64   { ((v << 1) ^ (v >> 63)) as u64 }
    fn unzigzag(v: u64) -> i64 { ((v >> 1) as i64) ^ -((v & 1) as i64) }

    fn deltas(data: &[u8], width: usize) -> impl Iterator<Item = u64> + '_ {
        let mut prev = 0i64;
        data.chunks_exact(width).map(move |c| {
            let x = read_int(c, width);
            let d = x.wrapping_sub(prev);
            prev = x;
            zigzag(d)
        })
    }

    pub fn encoded_len(data: &[u8], width: usize) -> usize {
        deltas(data, width).map(varint_len).sum()
    }

    pub fn encode(data: &[u8], width: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() / 2);
        for d in deltas(data, width) {
            put_varint(&mut out, d);
        }
        out
    }

    pub fn decode(data: &[u8], width: usize, count: usize) -> Result<Vec<u8>> {
        // 每个 varint 至少 1 字节
        if count > data.len() {
            return Err(LanceError::corrupt(WHAT, format!("{count} deltas cannot fit in {} bytes", data.len())));
        }
        let mut out  = Vec::with_capacity(count * width);
        let mut pos  = 0usize;
        let mut prev = 0i64;
        for _ in 0..count {
            let d = unzigzag(get_varint(data, &mut pos)?);
            prev = prev.wrapping_add(d);
            write_int(&mut out, prev, width);
        }
        if pos != data.len() {
            return Err(LanceError::corrupt(WHAT, "trailing bytes after delta values"));
        }
        Ok(out)
    }
}

// ── Dictionary ────────────────────────────────────────────────────────────────
mod dict {
    use super::*;

    pub fn encode(offsets: &[u32], data: &[u8]) -> Vec<u8> {
        let mut dict: Vec<&[u8]>              = Vec::new();
        let mut lookup: HashMap<&[u8], u32>   = HashMap::new();
        let mut codes: Vec<u32>               = Vec::with_capacity(offsets.len());

        for w in offsets.windows(2) {
            let key = &data[w[0] as usize..w[1] as usize];
            let code = *lookup.entry(key).or_insert_with(|| {
                dict.push(key);
                (dict.len() - 1) as u32
            });
            codes.push(code);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&(dict.len() as u32).to_le_bytes());
        for entry in &dict {
            out.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            out.extend_from_slice(entry);
        }
        for c in &codes {
            out.extend_from_slice(&c.to_le_bytes());
        }
        out
    }

    pub fn decode(data: &[u8], count: usize) -> Result<Decoded> {
        let dict_len = read_u32_at(data, 0)? as usize;
        let mut pos  = 4usize;
        let mut dict: Vec<&[u8]> = Vec::with_capacity(dict_len.min(data.len()));

        for _ in 0..dict_len {
            let slen = read_u32_at(data, pos)? as usize;
            pos += 4;
            let entry = data.get(pos..pos + slen)
                .ok_or_else(|| LanceError::corrupt(WHAT, "dictionary entry overruns buffer"))?;
            dict.push(entry);
            pos += slen;
        }

        let mut offsets = Vec::with_capacity(count.min(data.len()) + 1);
        let mut values  = Vec::new();
        offsets.push(0u32);
        for _ in 0..count {
            let code = read_u32_at(data, pos)? as usize;
            pos += 4;
            let entry = dict.get(code)
                .ok_or_else(|| LanceError::corrupt(WHAT, format!("dictionary code {code} out of range")))?;
            values.extend_from_slice(entry);
            offsets.push(values.len() as u32);
        }
        if pos != data.len() {
            return Err(LanceError::corrupt(WHAT, "trailing bytes after dictionary codes"));
        }
        Ok(Decoded::Var { offsets, data: values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn i64_bytes(v: &[i64]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    #[rstest]
    #[case::plain(EncodingType::Plain)]
    #[case::rle(EncodingType::RunLength)]
    #[case::delta(EncodingType::DeltaBinary)]
    fn fixed_width_is_lossless(#[case] enc: EncodingType) {
        let data = i64_bytes(&[5, 5, 5, i64::MIN, i64::MAX, -1, 0, 0]);
        let buf = Buffer::Fixed { data: &data, width: 8 };
        let encoded = encode(buf, enc).unwrap();
        let decoded = decode(&encoded, enc, BufferKind::Fixed { width: 8 }, 8).unwrap();
        assert_eq!(decoded, Decoded::Fixed(data));
    }

    #[rstest]
    #[case::plain(EncodingType::Plain)]
    #[case::dict(EncodingType::Dictionary)]
    fn var_width_is_lossless(#[case] enc: EncodingType) {
        let data = b"aabbaa".to_vec();
        let offsets = vec![0u32, 2, 4, 4, 6];
        let encoded = encode(Buffer::Var { offsets: &offsets, data: &data }, enc).unwrap();
        let decoded = decode(&encoded, enc, BufferKind::Var, 4).unwrap();
        assert_eq!(decoded, Decoded::Var { offsets, data });
    }

    #[test]
    fn delta_shrinks_sorted_ids() {
        let data = i64_bytes(&(1_000_000..1_001_000).collect::<Vec<_>>());
        let buf = Buffer::Fixed { data: &data, width: 8 };
        assert_eq!(choose(&buf, true), EncodingType::DeltaBinary);
        assert!(encode(buf, EncodingType::DeltaBinary).unwrap().len() < data.len() / 4);
    }

    #[test]
    fn dictionary_rejected_for_fixed_width() {
        let data = [0u8; 8];
        assert!(!supports(EncodingType::Dictionary, &Buffer::Fixed { data: &data, width: 4 }));
        assert!(encode(Buffer::Fixed { data: &data, width: 4 }, EncodingType::Dictionary).is_err());
    }

    #[test]
    fn truncated_input_is_corrupt() {
        let data = i64_bytes(&[1, 300, 70000]);
        let encoded = encode(Buffer::Fixed { data: &data, width: 8 }, EncodingType::DeltaBinary).unwrap();
        let err = decode(&encoded[..encoded.len() - 1], EncodingType::DeltaBinary, BufferKind::Fixed { width: 8 }, 3);
        assert!(matches!(err, Err(LanceError::CorruptData { .. })));

        let err = decode(&[9, 0, 0, 0], EncodingType::Dictionary, BufferKind::Var, 1);
        assert!(matches!(err, Err(LanceError::CorruptData { .. })));
    }
}
