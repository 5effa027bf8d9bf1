//! Indexing hand-off
//!
//! The networking layer pushes received transaction hashes into an
//! [`IndexDispatch`]; one task feeds them to an [`Indexer`] and records
//! each finished hash as the last-processed marker so indexing resumes
//! where it stopped after a restart.

pub mod dispatch;

pub use dispatch::{IndexDispatch, IndexError, Indexer, LogIndexer, TxHash};
