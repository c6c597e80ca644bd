//! Client-side query cache
//!
//! A client process remembers which names it already resolved so repeated
//! lookups skip the round-trip. The remembered set is valid for one epoch:
//! whenever the daemon's shared version counter differs from the value the
//! cache last saw, the set is cleared and the new value adopted.

use crate::index::types::FaceDescriptor;
use crate::server::client::FontClient;
use crate::utils::version_segment::{default_segment_path, VersionSegment};
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Epoch {
    /// None until the first comparison, so any counter value starts an epoch
    last_known: Option<u32>,
    names: FxHashSet<String>,
}

impl Epoch {
    fn sync(&mut self, current: u32) {
        if self.last_known != Some(current) {
            if !self.names.is_empty() {
                debug!(
                    "index version changed {:?} -> {}, dropping {} cached names",
                    self.last_known,
                    current,
                    self.names.len()
                );
            }
            self.names.clear();
            self.last_known = Some(current);
        }
    }
}

/// Names already resolved in the current index epoch
#[derive(Debug)]
pub struct ClientCache {
    segment: OnceLock<VersionSegment>,
    /// Where to look for the segment until it has been mapped
    segment_path: Option<PathBuf>,
    epoch: Mutex<Epoch>,
}

impl ClientCache {
    /// Attach to the per-user version segment
    ///
    /// If the daemon has not created it yet, every lookup retries the
    /// mapping, so the cache switches on once the daemon is up.
    pub fn open() -> Self {
        Self::open_at(default_segment_path())
    }

    /// Attach to the segment at `path`, now or on a later lookup
    pub fn open_at(path: impl Into<PathBuf>) -> Self {
        let cache = Self {
            segment: OnceLock::new(),
            segment_path: Some(path.into()),
            epoch: Mutex::new(Epoch::default()),
        };
        if cache.segment().is_none() {
            debug!("query cache idle until the version segment exists");
        }
        cache
    }

    /// Use `segment` directly; `None` disables the cache for good
    pub fn with_segment(segment: Option<VersionSegment>) -> Self {
        let cell = OnceLock::new();
        if let Some(segment) = segment {
            let _ = cell.set(segment);
        }
        Self {
            segment: cell,
            segment_path: None,
            epoch: Mutex::new(Epoch::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.segment().is_some()
    }

    fn segment(&self) -> Option<&VersionSegment> {
        if let Some(segment) = self.segment.get() {
            return Some(segment);
        }
        let path = self.segment_path.as_ref()?;
        match VersionSegment::open_at(path) {
            Ok(segment) => Some(self.segment.get_or_init(|| segment)),
            Err(e) => {
                trace!("version segment {} not available: {}", path.display(), e);
                None
            }
        }
    }

    /// Whether `name` needs a round-trip to the server
    pub fn should_query(&self, name: &str) -> bool {
        let Some(segment) = self.segment() else {
            return true;
        };
        let current = segment.load();

        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        epoch.sync(current);
        !epoch.names.contains(name)
    }

    /// Remember that `name` was resolved
    pub fn record(&self, name: &str) {
        let Some(segment) = self.segment() else {
            return;
        };
        let current = segment.load();

        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        epoch.sync(current);
        epoch.names.insert(name.to_string());
    }
}

/// Result of [`FontAgent::query`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Already resolved in this epoch; nothing was sent
    Cached,
    /// Fresh answer from the server (empty for names that resolve to nothing)
    Resolved(Vec<FaceDescriptor>),
    /// The server could not be reached or misbehaved
    Unavailable,
}

/// Client-side lookup flow used inside font-loading processes
#[derive(Debug)]
pub struct FontAgent {
    cache: ClientCache,
    endpoint: PathBuf,
}

impl FontAgent {
    pub fn new(cache: ClientCache, endpoint: impl Into<PathBuf>) -> Self {
        Self {
            cache,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Resolve `name` unless it was already resolved in this epoch
    ///
    /// A leading `@` (vertical-writing variant) is ignored. Empty names
    /// resolve to nothing without contacting the server.
    pub fn query(&self, name: &str) -> QueryOutcome {
        let name = name.strip_prefix('@').unwrap_or(name);
        if name.is_empty() {
            return QueryOutcome::Resolved(Vec::new());
        }
        if !self.cache.should_query(name) {
            return QueryOutcome::Cached;
        }

        let faces = FontClient::connect(&self.endpoint).and_then(|mut client| client.query(name));
        match faces {
            Ok(faces) => {
                self.cache.record(name);
                QueryOutcome::Resolved(faces)
            }
            Err(e) => {
                debug!("query for {:?} failed: {}", name, e);
                QueryOutcome::Unavailable
            }
        }
    }

    /// Tell the server which font files were just loaded
    pub fn feedback(&self, paths: Vec<String>) {
        if paths.is_empty() {
            return;
        }
        let sent = FontClient::connect(&self.endpoint).and_then(|mut client| client.feedback(paths));
        if let Err(e) = sent {
            debug!("feedback not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_and_cache(dir: &tempfile::TempDir) -> (VersionSegment, ClientCache) {
        let path = dir.path().join("test.version");
        let writer = VersionSegment::create_at(&path).unwrap();
        let reader = VersionSegment::open_at(&path).unwrap();
        (writer, ClientCache::with_segment(Some(reader)))
    }

    #[test]
    fn test_record_then_skip() {
        let dir = tempfile::tempdir().unwrap();
        let (_writer, cache) = writer_and_cache(&dir);

        assert!(cache.should_query("Arial"));
        cache.record("Arial");
        assert!(!cache.should_query("Arial"));
        assert!(cache.should_query("Times New Roman"));
    }

    #[test]
    fn test_version_bump_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, cache) = writer_and_cache(&dir);

        cache.record("Arial");
        cache.record("Meiryo");
        assert!(!cache.should_query("Arial"));

        writer.bump().unwrap();
        assert!(cache.should_query("Arial"));
        // The whole set went, not just the name asked about
        assert!(cache.should_query("Meiryo"));

        cache.record("Arial");
        assert!(!cache.should_query("Arial"));
    }

    #[test]
    fn test_bump_between_query_and_record_starts_new_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, cache) = writer_and_cache(&dir);

        assert!(cache.should_query("Arial"));
        writer.bump().unwrap();
        cache.record("Arial");
        // Recorded under the new version, so it holds until the next bump
        assert!(!cache.should_query("Arial"));
        writer.bump().unwrap();
        assert!(cache.should_query("Arial"));
    }

    #[test]
    fn test_cache_attaches_once_segment_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.version");

        // Client starts before the daemon
        let cache = ClientCache::open_at(&path);
        assert!(!cache.is_enabled());
        cache.record("Arial");
        assert!(cache.should_query("Arial"));

        let writer = VersionSegment::create_at(&path).unwrap();
        assert!(cache.is_enabled());
        cache.record("Arial");
        assert!(!cache.should_query("Arial"));

        writer.bump().unwrap();
        assert!(cache.should_query("Arial"));
    }

    #[test]
    fn test_disabled_cache_always_queries() {
        let cache = ClientCache::with_segment(None);
        assert!(!cache.is_enabled());
        cache.record("Arial");
        assert!(cache.should_query("Arial"));
    }

    #[test]
    fn test_agent_without_server() {
        let dir = tempfile::tempdir().unwrap();
        let (_writer, cache) = writer_and_cache(&dir);
        let agent = FontAgent::new(cache, dir.path().join("nobody.sock"));

        assert_eq!(agent.query("Arial"), QueryOutcome::Unavailable);
        // Failures are not remembered
        assert!(agent.cache().should_query("Arial"));

        assert_eq!(agent.query("@"), QueryOutcome::Resolved(Vec::new()));
        assert_eq!(agent.query(""), QueryOutcome::Resolved(Vec::new()));
        agent.feedback(vec!["a.ttf".to_string()]);
    }
}
