//! Face index: name tries, generations and face-record sources.
//!
//! - [`trie`] - Compressed trie from name strings to face handles
//! - [`store`] - Immutable generations and the hot-swapping store
//! - [`loader`] - JSON face-record sources
//! - [`types`] - Face records, names and descriptors

pub mod loader;
pub mod store;
pub mod trie;
pub mod types;

pub use store::{Generation, IndexError, IndexStore};
pub use trie::{DuplicatePolicy, FaceTrie};
pub use types::*;
