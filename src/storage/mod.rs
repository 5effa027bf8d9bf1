//! Storage module for peer and marker persistence

pub mod marker;
pub mod persistence;

pub use marker::{FileMarkerStore, MarkerStore};
pub use persistence::{load_json, save_json, write_atomic, StorageError};
