//! Cache garbage collection.
//!
//! A sweep walks both cache namespaces and deletes entries past the
//! configured lifetime, plus any request record whose rendition is gone.
//! Request entries age by access time (a record being followed is a reason
//! to keep it), renditions by modification time.
//!
//! Sweeps are triggered probabilistically from the pipeline after a
//! response, or explicitly from the CLI. A lock file keeps concurrent
//! sweeps from duplicating work; a lock older than a day is presumed
//! abandoned and ignored.

use crate::config::{GcConfig, ProxyConfig};
use log::{debug, info, warn};
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

/// Pause briefly after examining this many entries, so a large sweep does
/// not monopolize the disk.
const BREATHE_EVERY: usize = 5000;
const BREATHE_PAUSE: Duration = Duration::from_millis(10);

/// A lock file older than this belongs to a sweep that died; ignore it.
const LOCK_ABANDON: Duration = Duration::from_secs(86_400);

const LOCK_FILE: &str = "sweep.lock";

/// Roll the dice for a post-response sweep.
///
/// Tolerates configs that skipped validation: a zero divisor never sweeps
/// and a probability above the divisor always does.
pub fn should_sweep(config: &GcConfig) -> bool {
    if config.probability == 0 || config.divisor == 0 {
        return false;
    }
    rand::thread_rng().gen_ratio(config.probability.min(config.divisor), config.divisor)
}

/// Counts from one sweep, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone)]
pub struct GarbageCollector {
    cache_dir: PathBuf,
    rendered_dir: PathBuf,
    request_dir: PathBuf,
    max_lifetime: Duration,
    lock_abandon: Duration,
}

impl GarbageCollector {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            rendered_dir: config.rendered_cache_dir(),
            request_dir: config.request_cache_dir(),
            max_lifetime: Duration::from_secs(config.gc.max_lifetime),
            lock_abandon: LOCK_ABANDON,
        }
    }

    /// Override the abandoned-lock threshold. Std cannot backdate file
    /// timestamps, so tests shrink the threshold instead.
    #[cfg(test)]
    fn with_lock_abandon(mut self, threshold: Duration) -> Self {
        self.lock_abandon = threshold;
        self
    }

    /// Run one sweep over both namespaces.
    ///
    /// Returns `None` when another sweep holds the lock. IO errors from
    /// individual entries are logged and skipped; only failures to walk a
    /// namespace abort the sweep (with the lock released).
    pub fn sweep(&self) -> io::Result<Option<SweepStats>> {
        if self.is_running() {
            debug!("garbage collection already running, skipping");
            return Ok(None);
        }

        fs::create_dir_all(&self.cache_dir)?;
        fs::write(self.lock_path(), b"")?;
        info!("garbage collection started");

        let result = self.sweep_locked();

        if let Err(err) = fs::remove_file(self.lock_path()) {
            warn!("could not remove sweep lock: {err}");
        }

        let stats = result?;
        info!(
            "garbage collection finished: examined {}, deleted {}",
            stats.examined, stats.deleted
        );
        Ok(Some(stats))
    }

    fn sweep_locked(&self) -> io::Result<SweepStats> {
        let mut stats = SweepStats::default();
        self.sweep_requests(&mut stats)?;
        self.sweep_rendered(&mut stats)?;
        Ok(stats)
    }

    fn sweep_requests(&self, stats: &mut SweepStats) -> io::Result<()> {
        let Ok(entries) = fs::read_dir(&self.request_dir) else {
            return Ok(());
        };
        for entry in entries {
            let entry = entry?;
            self.breathe(stats.examined);
            stats.examined += 1;

            // Age first: reading the record to chase its target would
            // refresh the access time this check relies on.
            let path = entry.path();
            if self.is_expired(&entry, true) || self.record_is_dangling(&path) {
                delete(&path, stats);
            }
        }
        Ok(())
    }

    fn sweep_rendered(&self, stats: &mut SweepStats) -> io::Result<()> {
        let Ok(entries) = fs::read_dir(&self.rendered_dir) else {
            return Ok(());
        };
        for entry in entries {
            let entry = entry?;
            self.breathe(stats.examined);
            stats.examined += 1;

            if self.is_expired(&entry, false) {
                delete(&entry.path(), stats);
            }
        }
        Ok(())
    }

    /// A record pointing at a rendition that no longer exists.
    fn record_is_dangling(&self, record: &Path) -> bool {
        match fs::read_to_string(record) {
            Ok(content) => {
                let target = content.trim();
                target.is_empty() || !self.rendered_dir.join(target).exists()
            }
            Err(_) => false,
        }
    }

    fn is_expired(&self, entry: &fs::DirEntry, by_access_time: bool) -> bool {
        let Ok(meta) = entry.metadata() else {
            return false;
        };
        // Access time where the filesystem tracks it (request records are
        // touched on every hit); modification time otherwise.
        let stamp = if by_access_time {
            meta.accessed().or_else(|_| meta.modified())
        } else {
            meta.modified()
        };
        match stamp {
            Ok(stamp) => match SystemTime::now().duration_since(stamp) {
                Ok(age) => age > self.max_lifetime,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    fn breathe(&self, examined: usize) {
        if examined > 0 && examined % BREATHE_EVERY == 0 {
            thread::sleep(BREATHE_PAUSE);
        }
    }

    fn is_running(&self) -> bool {
        let Ok(meta) = fs::metadata(self.lock_path()) else {
            return false;
        };
        let Ok(mtime) = meta.modified() else {
            return true;
        };
        match SystemTime::now().duration_since(mtime) {
            Ok(age) => age < self.lock_abandon,
            // Lock stamped in the future: treat as held
            Err(_) => true,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.cache_dir.join(LOCK_FILE)
    }
}

fn delete(path: &Path, stats: &mut SweepStats) {
    match fs::remove_file(path) {
        Ok(()) => stats.deleted += 1,
        Err(err) => warn!("could not delete cache entry {}: {err}", path.display()),
    }
}
