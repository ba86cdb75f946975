//! Data Page 框架
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ num_rows         (u32 LE)        │
//! │ compression      (u8)            │
//! │ uncompressed_len (u32 LE)        │
//! │ data_type        (递归类型描述)   │
//! │ payload          (compressed)    │  缓冲区树，见 codec.rs
//! │ CRC32            (u32 LE)        │  覆盖前面全部字节
//! └──────────────────────────────────┘
//! ```
//!
//! 页是自描述的：不依赖外部元数据即可校验并解出负载。

use crate::common::{LanceError, Result};
use crate::compression;
use crate::field_type::{CompressionType, DataType};
use crate::format::{MetaReader, MetaWriter};

const WHAT: &str = "page";

#[derive(Debug, Clone, PartialEq)]
pub struct PageHeader {
    pub num_rows:         u32,
    pub compression:      CompressionType,
    pub uncompressed_len: u32,
    pub data_type:        DataType,
}

// ── PageBuilder ───────────────────────────────────────────────────────────────

pub struct PageBuilder {
    data_type:   DataType,
    compression: CompressionType,
}

impl PageBuilder {
    pub fn new(data_type: DataType, compression: CompressionType) -> Self {
        Self { data_type, compression }
    }

    /// 压缩负载 → 加 header + CRC
    pub fn build(self, num_rows: usize, payload: &[u8]) -> Result<Vec<u8>> {
        let num_rows = u32::try_from(num_rows)
            .map_err(|_| LanceError::invalid(format!("page of {num_rows} rows is too large")))?;
        let uncompressed_len = u32::try_from(payload.len())
            .map_err(|_| LanceError::invalid("page payload exceeds 4 GiB"))?;
        let compressed = compression::compress(payload, self.compression)?;

        let mut w = MetaWriter::new();
        w.u32(num_rows)
            .u8(self.compression.tag())
            .u32(uncompressed_len)
            .data_type(&self.data_type)
            .raw(&compressed);
        Ok(w.finish_with_crc())
    }
}

// ── PageDecoder ───────────────────────────────────────────────────────────────

pub struct PageDecoder {
    pub header:  PageHeader,
    /// 解压后的负载
    pub payload: Vec<u8>,
}

impl PageDecoder {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = MetaReader::with_crc(data, WHAT)?;
        let num_rows = r.u32()?;
        let comp_tag = r.u8()?;
        let compression = CompressionType::from_tag(comp_tag)
            .ok_or_else(|| LanceError::corrupt(WHAT, format!("unknown compression tag {comp_tag}")))?;
        let uncompressed_len = r.u32()?;
        let data_type = r.data_type()?;
        let compressed = r.take(r.remaining())?;
        let payload = compression::decompress(compressed, compression, uncompressed_len as usize)?;
        Ok(Self {
            header: PageHeader { num_rows, compression, uncompressed_len, data_type },
            payload,
        })
    }
}
