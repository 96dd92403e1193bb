use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use uuid::Uuid;
use crate::core::error::{Error, ErrorKind, Result};

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing of stored records
pub struct CryptoSuite {
    cipher: Aes256Gcm,
}

impl CryptoSuite {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            Error::new(ErrorKind::InvalidArgument, format!("cipher key must be 32 bytes, got {}", key.len()))
        })?;
        Ok(CryptoSuite { cipher })
    }

    /// Key given as 64 hex characters
    pub fn from_hex(hex: &str) -> Result<Self> {
        Self::new(&decode_hex(hex)?)
    }

    /// Output is `nonce | ciphertext`
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce_source = Uuid::new_v4();
        let nonce_bytes = &nonce_source.as_bytes()[..NONCE_LEN];
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(nonce_bytes), plain)
            .map_err(|_| Error::new(ErrorKind::Internal, "encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(Error::new(ErrorKind::Parse, "truncated encrypted record".to_string()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Error::new(ErrorKind::Parse, "unable to decrypt record".to_string()))
    }
}

pub fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::InvalidArgument, "odd hex length".to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::new(ErrorKind::InvalidArgument, format!("invalid hex '{}'", hex)))
        })
        .collect()
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
