//! Active generation management
//!
//! A [`Generation`] is an immutable snapshot: the face records plus one trie
//! per name class whose payloads index into those records. [`IndexStore`]
//! builds a new generation completely before taking the write lock, swaps
//! the `Arc` and bumps the shared version counter, so queries never wait on
//! trie construction and a failed reload leaves the active generation alone.

use crate::index::trie::{DuplicatePolicy, FaceTrie};
use crate::index::types::{FaceId, FaceRecord, NameClass};
use crate::utils::version_segment::VersionSegment;
use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::info;

/// Errors that abort a reload
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("face {path}#{face_index} appears more than once")]
    DuplicateFace { path: String, face_index: u32 },

    #[error("face record {position} has an empty path")]
    EmptyPath { position: usize },

    #[error("too many face records: {count}")]
    TooManyFaces { count: usize },

    #[error("failed to publish index version: {0}")]
    Version(#[from] std::io::Error),
}

/// Duplicate handling for every name class
///
/// Distinct faces legitimately share family names, and full and PostScript
/// names collide across differently pathed copies of a font. All of them
/// must be returned, so every trie appends.
pub const NAME_DUPLICATE_POLICY: DuplicatePolicy = DuplicatePolicy::Append;

/// One immutable, fully built snapshot of the face index
#[derive(Debug)]
pub struct Generation {
    version: u32,
    faces: Vec<FaceRecord>,
    family: FaceTrie,
    full_name: FaceTrie,
    postscript: FaceTrie,
}

impl Generation {
    /// A generation with no faces
    pub fn empty(version: u32) -> Self {
        Self {
            version,
            faces: Vec::new(),
            family: FaceTrie::new(NAME_DUPLICATE_POLICY),
            full_name: FaceTrie::new(NAME_DUPLICATE_POLICY),
            postscript: FaceTrie::new(NAME_DUPLICATE_POLICY),
        }
    }

    /// Validate `records` and build the three name tries
    pub fn build(mut records: Vec<FaceRecord>) -> Result<Self, IndexError> {
        if records.len() > u32::MAX as usize {
            return Err(IndexError::TooManyFaces {
                count: records.len(),
            });
        }

        {
            let mut seen = FxHashSet::default();
            for (position, record) in records.iter().enumerate() {
                if record.path.is_empty() {
                    return Err(IndexError::EmptyPath { position });
                }
                if !seen.insert(record.key()) {
                    return Err(IndexError::DuplicateFace {
                        path: record.path.clone(),
                        face_index: record.face_index,
                    });
                }
            }
        }

        for record in &mut records {
            record.dedup_names();
        }

        let (family, (full_name, postscript)) = rayon::join(
            || build_trie(&records, NameClass::Family),
            || {
                rayon::join(
                    || build_trie(&records, NameClass::FullName),
                    || build_trie(&records, NameClass::PostScriptName),
                )
            },
        );

        Ok(Self {
            version: 0,
            faces: records,
            family,
            full_name,
            postscript,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn faces(&self) -> &[FaceRecord] {
        &self.faces
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Resolve a handle produced by this generation's tries
    pub fn face(&self, id: FaceId) -> &FaceRecord {
        &self.faces[id.index()]
    }

    pub fn trie(&self, class: NameClass) -> &FaceTrie {
        match class {
            NameClass::Family => &self.family,
            NameClass::FullName => &self.full_name,
            NameClass::PostScriptName => &self.postscript,
        }
    }
}

fn build_trie(records: &[FaceRecord], class: NameClass) -> FaceTrie {
    let mut trie = FaceTrie::new(NAME_DUPLICATE_POLICY);
    for (i, record) in records.iter().enumerate() {
        let id = FaceId(i as u32);
        for name in record.names_of(class) {
            // Empty names cannot be looked up and are never indexed
            if !name.is_empty() {
                trie.add_entry(name, id);
            }
        }
    }
    trie
}

/// Holds the active generation and publishes its version to other processes
#[derive(Debug)]
pub struct IndexStore {
    active: RwLock<Arc<Generation>>,
    segment: VersionSegment,
    /// Serializes reloads so generation versions follow the counter
    reload: Mutex<()>,
}

impl IndexStore {
    /// Create a store with an empty generation at the segment's current version
    pub fn new(segment: VersionSegment) -> Self {
        let version = segment.load();
        Self {
            active: RwLock::new(Arc::new(Generation::empty(version))),
            segment,
            reload: Mutex::new(()),
        }
    }

    /// Build a new generation from `records` and make it active.
    ///
    /// Returns the new version. On error the active generation is unchanged
    /// and the version is not bumped.
    pub fn load(&self, records: Vec<FaceRecord>) -> Result<u32, IndexError> {
        let _reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);

        let mut generation = Generation::build(records)?;
        let faces = generation.face_count();
        let names = (
            generation.family.len(),
            generation.full_name.len(),
            generation.postscript.len(),
        );

        let (old, new) = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            let old = self.segment.load();
            let new = self.segment.bump()?;
            generation.version = new;
            *active = Arc::new(generation);
            (old, new)
        };

        info!(
            version = new,
            faces,
            family_names = names.0,
            full_names = names.1,
            postscript_names = names.2,
            "index generation loaded"
        );
        info!("index version bumped {} -> {}", old, new);
        Ok(new)
    }

    /// Pin the currently active generation
    ///
    /// The read lock is held only while cloning the handle.
    pub fn active(&self) -> Arc<Generation> {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Current value of the shared version counter
    pub fn version(&self) -> u32 {
        self.segment.load()
    }

    pub fn segment(&self) -> &VersionSegment {
        &self.segment
    }
}
