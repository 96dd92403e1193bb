use std::sync::Arc;
use crate::codec::compress::{CompressedBlock, CompressionType};
use crate::codec::crypto::CryptoSuite;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};

const FORMAT_VERSION: u8 = 1;
const FLAG_ENCRYPTED: u8 = 0x01;

/// Serializes entries for id2entry: bincode, then compression, then optional encryption
#[derive(Clone, Default)]
pub struct EntryCodec {
    pub compression: CompressionType,
    pub crypto: Option<Arc<CryptoSuite>>,
}

impl EntryCodec {
    pub fn new(compression: CompressionType, crypto: Option<Arc<CryptoSuite>>) -> Self {
        EntryCodec { compression, crypto }
    }

    pub fn encode(&self, entry: &Entry) -> Result<Vec<u8>> {
        let raw = bincode::serialize(entry)?;
        let payload = CompressedBlock::compress(&raw, self.compression)?.to_bytes()?;

        let mut out = Vec::with_capacity(payload.len() + 2);
        out.push(FORMAT_VERSION);
        match &self.crypto {
            Some(crypto) => {
                out.push(FLAG_ENCRYPTED);
                out.extend_from_slice(&crypto.encrypt(&payload)?);
            }
            None => {
                out.push(0);
                out.extend_from_slice(&payload);
            }
        }
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Entry> {
        if bytes.len() < 2 || bytes[0] != FORMAT_VERSION {
            return Err(Error::new(ErrorKind::Parse, "unsupported entry encoding".to_string()));
        }

        let payload = if bytes[1] & FLAG_ENCRYPTED != 0 {
            let crypto = self.crypto.as_ref().ok_or_else(|| {
                Error::new(ErrorKind::InvalidState, "entry is encrypted but no cipher key is configured".to_string())
            })?;
            crypto.decrypt(&bytes[2..])?
        } else {
            bytes[2..].to_vec()
        };

        let raw = CompressedBlock::from_bytes(&payload)?.decompress()?;
        Ok(bincode::deserialize(&raw)?)
    }
}
