pub mod sizing;
pub mod buffer_pool;
pub mod collector;
pub mod cursor;
pub mod chunk;
pub mod dn_validation;
pub mod source;
pub mod strategy;
pub mod progress;
pub mod suffix;
pub mod importer;
