pub mod types;
pub mod error;
pub mod config;
pub mod dn;
pub mod entry;
pub mod matching;
pub mod filter;
pub mod cache;
pub mod operation;
