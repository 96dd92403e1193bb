pub mod entry_id_set;
pub mod indexer;
pub mod index_buffer;
pub mod attribute_index;
pub mod index_filter;
pub mod vlv_index;
pub mod dn2id;
pub mod id2entry;
pub mod id2count;
pub mod dn2uri;
pub mod state;
