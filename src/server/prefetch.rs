//! Recently loaded font paths
//!
//! Clients report the files they actually loaded through the feedback
//! channel. The most recent ones are remembered across daemon restarts in a
//! newline-delimited file, oldest first.

use crate::server::daemon::FeedbackHandler;
use anyhow::{Context, Result};
use lru::LruCache;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Bounded most-recently-used list of font paths
#[derive(Debug)]
pub struct Prefetch {
    /// None when the capacity is zero
    lru: Option<Mutex<LruCache<String, ()>>>,
    path: Option<PathBuf>,
}

impl Prefetch {
    pub fn new(capacity: usize, path: Option<PathBuf>) -> Self {
        Self {
            lru: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            path,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lru.is_some()
    }

    /// Mark `path` as just used; returns true if it was not already tracked
    pub fn touch(&self, path: &str) -> bool {
        let Some(lru) = &self.lru else {
            return false;
        };
        if path.is_empty() {
            return false;
        }

        let mut lru = lru.lock().unwrap_or_else(PoisonError::into_inner);
        if lru.get(path).is_some() {
            return false;
        }
        lru.put(path.to_string(), ());
        true
    }

    /// Tracked paths, most recent first
    pub fn snapshot(&self) -> Vec<String> {
        match &self.lru {
            Some(lru) => lru
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(path, _)| path.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Read the persisted list; a missing file is not an error
    pub fn load(&self) -> Result<usize> {
        let Some(path) = self.path.as_deref().filter(|_| self.is_enabled()) else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read prefetch list {}", path.display()))?;
        let mut added = 0;
        // Oldest first, so the last line ends up most recent
        for line in content.lines() {
            if self.touch(line.trim_end_matches('\r')) {
                added += 1;
            }
        }

        info!("restored {} prefetch entries from {}", added, path.display());
        Ok(added)
    }

    /// Persist the list, oldest first
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref().filter(|_| self.is_enabled()) else {
            return Ok(());
        };
        write_list(path, &self.snapshot())
    }
}

fn write_list(path: &Path, most_recent_first: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut content = String::new();
    for entry in most_recent_first.iter().rev() {
        content.push_str(entry);
        content.push('\n');
    }
    fs::write(path, content)
        .with_context(|| format!("Failed to write prefetch list {}", path.display()))?;

    debug!("saved {} prefetch entries", most_recent_first.len());
    Ok(())
}

impl FeedbackHandler for Prefetch {
    fn handle_feedback(&self, paths: &[String]) {
        for path in paths {
            self.touch(path);
        }
    }
}
