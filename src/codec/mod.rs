pub mod compress;
pub mod varint;
pub mod dn_key;
pub mod crypto;
pub mod entry_codec;
