use crate::core::error::{Error, ErrorKind, Result};
use serde::{Serialize, Deserialize};

/// Compressed block storage for encoded entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedBlock {
    pub data: Vec<u8>,
    pub original_size: usize,
    pub compression: CompressionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionType {
    #[default]
    None,
    LZ4,      // Fast compression, ratio 2-3x
    Zstd,     // Better ratio, slower
    Snappy,   // Balanced
}

impl CompressionType {
    pub fn tag(&self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::LZ4 => 1,
            CompressionType::Zstd => 2,
            CompressionType::Snappy => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::LZ4),
            2 => Ok(CompressionType::Zstd),
            3 => Ok(CompressionType::Snappy),
            other => Err(Error::new(ErrorKind::Parse, format!("unknown compression tag {}", other))),
        }
    }
}

impl CompressedBlock {
    pub fn compress(data: &[u8], compression: CompressionType) -> Result<Self> {
        let compressed = match compression {
            CompressionType::None => data.to_vec(),

            CompressionType::LZ4 => {
                lz4::block::compress(data, None, false)?
            }

            CompressionType::Zstd => {
                zstd::encode_all(data, 3)?  // Level 3 is balanced
            }

            CompressionType::Snappy => {
                use snap::raw::Encoder;
                let mut encoder = Encoder::new();
                encoder.compress_vec(data)
                    .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?
            }
        };

        Ok(CompressedBlock {
            data: compressed,
            original_size: data.len(),
            compression,
        })
    }

    pub fn decompress(&self) -> Result<Vec<u8>> {
        match self.compression {
            CompressionType::None => Ok(self.data.clone()),

            CompressionType::LZ4 => {
                lz4::block::decompress(&self.data, Some(self.original_size as i32))
                    .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))
            }

            CompressionType::Zstd => {
                zstd::decode_all(&self.data[..])
                    .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))
            }

            CompressionType::Snappy => {
                use snap::raw::Decoder;
                let mut decoder = Decoder::new();
                decoder.decompress_vec(&self.data)
                    .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))
            }
        }
    }

    /// Frame as `tag | original size (u32 BE) | payload`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let original_size = u32::try_from(self.original_size).map_err(|_| {
            Error::new(ErrorKind::InvalidArgument, format!("block of {} bytes is too large to frame", self.original_size))
        })?;
        let mut out = Vec::with_capacity(self.data.len() + 5);
        out.push(self.compression.tag());
        out.extend_from_slice(&original_size.to_be_bytes());
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 5 {
            return Err(Error::new(ErrorKind::Parse, "truncated compressed block".to_string()));
        }
        let compression = CompressionType::from_tag(bytes[0])?;
        let original_size = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        Ok(CompressedBlock {
            data: bytes[5..].to_vec(),
            original_size,
            compression,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_codec_restores_input() {
        let data = b"dn: cn=a,dc=example,dc=com cn: a cn: a cn: a cn: a".repeat(8);
        for compression in [
            CompressionType::None,
            CompressionType::LZ4,
            CompressionType::Zstd,
            CompressionType::Snappy,
        ] {
            let block = CompressedBlock::compress(&data, compression).unwrap();
            let framed = CompressedBlock::from_bytes(&block.to_bytes().unwrap()).unwrap();
            assert_eq!(framed.decompress().unwrap(), data, "{:?}", compression);
        }
    }

    #[test]
    fn oversized_block_is_not_framed() {
        let block = CompressedBlock {
            data: Vec::new(),
            original_size: u32::MAX as usize + 1,
            compression: CompressionType::Zstd,
        };
        assert_eq!(block.to_bytes().unwrap_err().kind, ErrorKind::InvalidArgument);

        let block = CompressedBlock { original_size: u32::MAX as usize, ..block };
        let framed = CompressedBlock::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(framed.original_size, u32::MAX as usize);
    }
}
