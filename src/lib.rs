//! # fontresolve - per-user font name resolution service
//!
//! A daemon keeps an index of installed font faces in memory and answers
//! "which files provide the font named X" for every process of the user,
//! over a local socket or named pipe.
//!
//! ## Architecture
//!
//! - [`index`] - Compressed name tries, generations and the hot-swapping store
//! - [`query`] - Name lookup policy (family first, outline-aware fallbacks)
//! - [`server`] - Query server, blocking client and client-side cache
//! - [`daemon`] - Process supervisor: reloads, signals, start/stop
//! - [`utils`] - Configuration, per-user paths and the shared version counter
//!
//! ## Quick Start
//!
//! ```ignore
//! use fontresolve::index::{FaceRecord, IndexStore, NameClass};
//! use fontresolve::query::QueryResolver;
//! use fontresolve::utils::VersionSegment;
//! use std::sync::Arc;
//!
//! let store = Arc::new(IndexStore::new(VersionSegment::create()?));
//! store.load(vec![FaceRecord::new("C:\\Windows\\Fonts\\arial.ttf", 0)
//!     .with_name(NameClass::Family, "Arial")])?;
//!
//! let resolver = QueryResolver::new(store);
//! for face in resolver.resolve("Arial") {
//!     println!("{}#{}", face.path, face.face_index);
//! }
//! ```
//!
//! ## Cache invalidation
//!
//! Every successful reload bumps a 4-byte counter in a shared memory mapping.
//! Client caches compare it with the value they last saw and forget every
//! remembered name when it changes, so a name is never skipped across a
//! reload.

pub mod daemon;
pub mod index;
pub mod query;
pub mod server;
pub mod utils;
