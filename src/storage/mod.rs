pub mod tree;
pub mod btree;
pub mod snapshot;
pub mod layout;
pub mod file_lock;
