//! 压缩/解压（LZ4 / None）

use crate::common::{LanceError, Result};
use crate::field_type::CompressionType;

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| LanceError::invalid(format!("lz4 compression failed: {e}"))),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let out = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4  => {
            let size = i32::try_from(uncompressed_len)
                .map_err(|_| LanceError::corrupt("lz4 block", "uncompressed size out of range"))?;
            lz4::block::decompress(data, Some(size))
                .map_err(|e| LanceError::corrupt("lz4 block", e.to_string()))?
        }
    };
    if out.len() != uncompressed_len {
        return Err(LanceError::corrupt("page payload", format!(
            "decompressed {} bytes, header says {uncompressed_len}", out.len())));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trip_and_bad_length() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        let c = compress(&data, CompressionType::Lz4).unwrap();
        assert!(c.len() < data.len());
        assert_eq!(decompress(&c, CompressionType::Lz4, data.len()).unwrap(), data);
        assert!(decompress(&c, CompressionType::Lz4, data.len() + 1).is_err());
    }
}
