pub mod root_container;
pub mod entry_container;
pub mod search;
pub mod inspect;
pub mod verify;
pub mod local_backend;
