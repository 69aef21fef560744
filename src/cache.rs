//! Append-only, directory-backed result cache.
//!
//! Entry `N` is the pair `geometry_N.csv` (fingerprint) and `result_N.csv`
//! (result record). Indices are dense from 0; a lookup scans them in order and
//! stops at the first missing fingerprint file. Nothing is kept in memory
//! between calls and entries are never rewritten or removed.
//!
//! Writers serialize through a `.lock` file that records its owner. A lock
//! whose owner has exited, or that is older than [`LockPolicy::stale_after`],
//! is taken over; a live one is polled until [`LockPolicy::wait`] runs out.

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::io::{self, CsvWriter};
use crate::record::ResultRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const GEOMETRY_PREFIX: &str = "geometry_";
pub const RESULT_PREFIX: &str = "result_";
pub const CACHE_EXTENSION: &str = "csv";
pub const LOCK_FILE: &str = ".lock";

const FINGERPRINT_HEADER: [&str; 2] = ["field", "value"];

/// One indexed slot of the cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub index: usize,
    pub geometry_file: PathBuf,
    pub result_file: PathBuf,
}

impl CacheEntry {
    /// An entry is usable only once both files exist.
    pub fn is_complete(&self) -> bool {
        self.geometry_file.is_file() && self.result_file.is_file()
    }
}

/// Waiting and takeover rules for the writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// How long `lock` keeps polling a live lock before giving up
    pub wait: Duration,
    pub stale_after: Duration,
    pub poll: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            stale_after: Duration::from_secs(6 * 3600),
            poll: Duration::from_millis(200),
        }
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired: Utc::now(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "pid={}\nacquired={}\n",
            self.pid,
            self.acquired.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut pid = None;
        let mut acquired = None;
        for line in text.lines() {
            match line.split_once('=') {
                Some(("pid", v)) => pid = v.trim().parse().ok(),
                Some(("acquired", v)) => {
                    acquired = DateTime::parse_from_rfc3339(v.trim())
                        .ok()
                        .map(|t| t.with_timezone(&Utc))
                }
                _ => {}
            }
        }
        Some(Self {
            pid: pid?,
            acquired: acquired?,
        })
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    // without procfs there is no way to tell
    if !Path::new("/proc/self").exists() {
        return true;
    }
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
    lock_policy: LockPolicy,
}

impl ResultCache {
    /// Open (creating if needed) a cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        Ok(Self {
            dir,
            lock_policy: LockPolicy::default(),
        })
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry(&self, index: usize) -> CacheEntry {
        CacheEntry {
            index,
            geometry_file: self
                .dir
                .join(format!("{}{}.{}", GEOMETRY_PREFIX, index, CACHE_EXTENSION)),
            result_file: self
                .dir
                .join(format!("{}{}.{}", RESULT_PREFIX, index, CACHE_EXTENSION)),
        }
    }

    /// Contiguous entries from index 0, complete or not.
    pub fn entries(&self) -> Vec<CacheEntry> {
        (0..)
            .map(|i| self.entry(i))
            .take_while(|e| e.geometry_file.is_file())
            .collect()
    }

    /// Complete entries whose stored fingerprint is cache-equivalent, in index order.
    fn candidates<'a>(&'a self, fingerprint: &'a Fingerprint) -> impl Iterator<Item = CacheEntry> + 'a {
        self.entries().into_iter().filter(move |entry| {
            if !entry.result_file.is_file() {
                debug!(index = entry.index, "skipping cache entry without result file");
                return false;
            }
            match read_fingerprint(&entry.geometry_file) {
                Ok(stored) => fingerprint.matches(&stored),
                Err(e) => {
                    warn!(index = entry.index, error = %e, "unreadable fingerprint, skipping");
                    false
                }
            }
        })
    }

    /// First complete entry whose stored fingerprint is cache-equivalent.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let found = self.candidates(fingerprint).next();
        if let Some(entry) = &found {
            debug!(index = entry.index, "cache hit");
        }
        Ok(found)
    }

    /// First matching entry together with its record.
    ///
    /// A match whose result file cannot be read is skipped like an
    /// unreadable fingerprint, so it never shadows a later good entry.
    pub fn find(&self, fingerprint: &Fingerprint) -> Result<Option<(CacheEntry, ResultRecord)>> {
        for entry in self.candidates(fingerprint) {
            match self.read(&entry) {
                Ok(record) => {
                    debug!(index = entry.index, "cache hit");
                    return Ok(Some((entry, record)));
                }
                Err(e) => warn!(index = entry.index, error = %e, "unreadable result, skipping"),
            }
        }
        Ok(None)
    }

    /// Write the fingerprint into the first free index.
    ///
    /// Files are created with `create_new`, so an index taken between the
    /// scan and the write moves this call to the next one.
    pub fn reserve(&self, fingerprint: &Fingerprint) -> Result<CacheEntry> {
        let mut index = self.entries().len();
        loop {
            let entry = self.entry(index);
            if let Some(mut w) = CsvWriter::create_new(&entry.geometry_file)? {
                w.write_header(&FINGERPRINT_HEADER)?;
                for (name, value) in fingerprint.fields() {
                    w.write_row(name, &[value])?;
                }
                w.flush()?;
                debug!(index, "reserved cache entry");
                return Ok(entry);
            }
            index += 1;
        }
    }

    /// Persist a record for a reserved entry.
    pub fn store(&self, entry: &CacheEntry, record: &ResultRecord) -> Result<()> {
        let partial = entry.result_file.with_extension("csv.partial");
        io::write_record(&partial, record)?;
        fs::rename(&partial, &entry.result_file).map_err(|e| Error::io(&entry.result_file, e))
    }

    pub fn read(&self, entry: &CacheEntry) -> Result<ResultRecord> {
        io::read_record(&entry.result_file)
    }

    /// Take the single-writer lock for this directory.
    ///
    /// Polls a live lock until the policy's wait runs out, then fails with
    /// [`Error::CacheLocked`]. Stale locks are removed and retried.
    pub fn lock(&self) -> Result<CacheLock> {
        let path = self.dir.join(LOCK_FILE);
        let deadline = Instant::now() + self.lock_policy.wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let lock = CacheLock { path: path.clone() };
                    file.write_all(LockOwner::current().render().as_bytes())
                        .map_err(|e| Error::io(&path, e))?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::io(path, e)),
            }

            if self.lock_is_stale(&path) {
                warn!(path = %path.display(), "taking over stale cache lock");
                match fs::remove_file(&path) {
                    Ok(()) => continue,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(Error::io(path, e)),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::CacheLocked { path: self.dir.clone() });
            }
            debug!(path = %path.display(), "cache lock held, waiting");
            thread::sleep(self.lock_policy.poll.min(deadline - now));
        }
    }

    /// Owner gone, or older than `stale_after`. Unreadable contents fall back
    /// to the file's modification time, since a fresh lock may not be written yet.
    fn lock_is_stale(&self, path: &Path) -> bool {
        let owner = fs::read_to_string(path).ok().and_then(|t| LockOwner::parse(&t));
        let age = match &owner {
            Some(owner) => (Utc::now() - owner.acquired).to_std().unwrap_or_default(),
            None => fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default(),
        };
        if age > self.lock_policy.stale_after {
            return true;
        }
        owner.is_some_and(|o| !process_alive(o.pid))
    }
}

/// Held while a writer allocates and fills cache entries; released on drop.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release cache lock");
        }
    }
}

pub fn read_fingerprint(path: &Path) -> Result<Fingerprint> {
    let mut fields = Vec::new();
    for row in io::read_rows(path)? {
        let value = match row.cells.as_slice() {
            [v] => v.parse::<f64>().map_err(|e| Error::CorruptCacheFile {
                path: path.to_path_buf(),
                reason: format!("line {}: {}", row.line, e),
            })?,
            _ => {
                return Err(Error::CorruptCacheFile {
                    path: path.to_path_buf(),
                    reason: format!("line {}: expected one value", row.line),
                })
            }
        };
        fields.push((row.label, value));
    }
    if fields.is_empty() {
        return Err(Error::CorruptCacheFile {
            path: path.to_path_buf(),
            reason: "no fields".to_string(),
        });
    }
    Ok(Fingerprint::from_stored(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Flavor, ParameterBundle, TrailingField};
    use tempfile::TempDir;

    fn bundle(area_ratio_vtp: f64, wing_area: f64) -> ParameterBundle {
        let mut b = ParameterBundle::new();
        for name in Flavor::Aircraft.fields() {
            b.push(*name, 1.0);
        }
        b.set("wing_area", wing_area);
        b.set("area_ratio_vtp", area_ratio_vtp);
        b
    }

    fn key(area_ratio_vtp: f64, wing_area: f64) -> Fingerprint {
        Fingerprint::for_flavor(
            Flavor::Aircraft,
            &bundle(area_ratio_vtp, wing_area),
            TrailingField::ReuseUnscaled,
        )
        .unwrap()
    }

    fn record(cl_alpha: f64) -> ResultRecord {
        let mut r = ResultRecord::new();
        r.insert_scalar("CL_alpha", cl_alpha);
        r
    }

    #[test]
    fn test_empty_cache_misses() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        assert_eq!(cache.lookup(&key(0.11, 16.2)).unwrap(), None);
    }

    #[test]
    fn test_reserve_store_lookup_read() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let fp = key(0.11, 16.2);

        let entry = cache.reserve(&fp).unwrap();
        assert_eq!(entry.index, 0);
        assert!(entry.geometry_file.ends_with("geometry_0.csv"));
        assert!(!entry.result_file.exists());

        cache.store(&entry, &record(5.2)).unwrap();
        let hit = cache.lookup(&fp).unwrap().expect("hit");
        assert_eq!(hit, entry);
        assert_eq!(cache.read(&hit).unwrap(), record(5.2));
    }

    #[test]
    fn test_indices_stay_contiguous() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        for i in 0..4 {
            let entry = cache.reserve(&key(0.11, 10.0 + i as f64)).unwrap();
            assert_eq!(entry.index, i);
            cache.store(&entry, &record(i as f64)).unwrap();
        }
        let indices: Vec<usize> = cache.entries().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_orphan_fingerprint_is_skipped_and_kept() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let fp = key(0.11, 16.2);

        let orphan = cache.reserve(&fp).unwrap();
        assert_eq!(cache.lookup(&fp).unwrap(), None);

        let entry = cache.reserve(&fp).unwrap();
        assert_eq!(entry.index, 1);
        cache.store(&entry, &record(4.9)).unwrap();

        assert_eq!(cache.lookup(&fp).unwrap().map(|e| e.index), Some(1));
        assert!(orphan.geometry_file.exists());
    }

    #[test]
    fn test_corrupt_fingerprint_does_not_block_later_hits() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let bad = cache.entry(0);
        fs::write(&bad.geometry_file, "field,value\nwing_area,sixteen\n").unwrap();
        fs::write(&bad.result_file, "name,kind,values\n").unwrap();

        let fp = key(0.11, 16.2);
        let entry = cache.reserve(&fp).unwrap();
        assert_eq!(entry.index, 1);
        cache.store(&entry, &record(5.0)).unwrap();
        assert_eq!(cache.lookup(&fp).unwrap().map(|e| e.index), Some(1));
    }

    #[test]
    fn test_hole_ends_the_scan() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let fp = key(0.11, 16.2);

        let e0 = cache.reserve(&fp).unwrap();
        cache.store(&e0, &record(1.0)).unwrap();

        // shift the only entry to index 1, leaving index 0 empty
        let e1 = cache.entry(1);
        fs::rename(&e0.geometry_file, &e1.geometry_file).unwrap();
        fs::rename(&e0.result_file, &e1.result_file).unwrap();

        assert_eq!(cache.lookup(&fp).unwrap(), None);
        assert!(cache.entries().is_empty());
        assert_eq!(cache.reserve(&fp).unwrap().index, 0);
    }

    #[test]
    fn test_first_fit_wins() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();

        let first = cache.reserve(&key(0.11, 16.2)).unwrap();
        cache.store(&first, &record(1.0)).unwrap();
        let second = cache.reserve(&key(0.30, 16.2)).unwrap();
        cache.store(&second, &record(2.0)).unwrap();

        let hit = cache.lookup(&key(0.30, 16.2)).unwrap().unwrap();
        assert_eq!(hit.index, 0);
    }

    fn impatient(policy_wait_ms: u64) -> LockPolicy {
        LockPolicy {
            wait: Duration::from_millis(policy_wait_ms),
            poll: Duration::from_millis(10),
            ..LockPolicy::default()
        }
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap().with_lock_policy(impatient(0));

        let lock = cache.lock().unwrap();
        let owner = LockOwner::parse(&fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap()).unwrap();
        assert_eq!(owner.pid, std::process::id());
        assert!(matches!(cache.lock(), Err(Error::CacheLocked { .. })));
        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(cache.lock().is_ok());
    }

    #[test]
    fn test_lock_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap().with_lock_policy(impatient(5000));

        let held = cache.lock().unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(held);
        });
        assert!(cache.lock().is_ok());
        releaser.join().unwrap();
    }

    #[test]
    fn test_old_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let policy = LockPolicy {
            stale_after: Duration::from_secs(3600),
            ..impatient(0)
        };
        let cache = ResultCache::open(dir.path()).unwrap().with_lock_policy(policy);
        let old = LockOwner {
            pid: std::process::id(),
            acquired: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(dir.path().join(LOCK_FILE), old.render()).unwrap();

        let lock = cache.lock().unwrap();
        let owner = LockOwner::parse(&fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap()).unwrap();
        assert!(owner.acquired > old.acquired);
        drop(lock);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_of_exited_process_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap().with_lock_policy(impatient(0));
        let gone = LockOwner {
            pid: u32::MAX,
            acquired: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), gone.render()).unwrap();
        assert!(cache.lock().is_ok());
    }

    #[test]
    fn test_fresh_unreadable_lock_is_respected() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap().with_lock_policy(impatient(50));
        fs::write(dir.path().join(LOCK_FILE), "").unwrap();

        assert!(matches!(cache.lock(), Err(Error::CacheLocked { .. })));
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_lock_owner_round_trip() {
        let owner = LockOwner::current();
        let parsed = LockOwner::parse(&owner.render()).unwrap();
        assert_eq!(parsed.pid, owner.pid);
        assert!((parsed.acquired - owner.acquired).num_milliseconds().abs() <= 1);
        assert_eq!(LockOwner::parse("pid=12\n"), None);
    }

    #[test]
    fn test_corrupt_result_does_not_block_later_hits() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let fp = key(0.11, 16.2);

        let bad = cache.reserve(&fp).unwrap();
        fs::write(&bad.result_file, "name,kind,values\nCL_alpha,scalar,five\n").unwrap();
        assert_eq!(cache.lookup(&fp).unwrap().map(|e| e.index), Some(0));
        assert_eq!(cache.find(&fp).unwrap(), None);

        let good = cache.reserve(&fp).unwrap();
        cache.store(&good, &record(5.0)).unwrap();
        let (entry, found) = cache.find(&fp).unwrap().unwrap();
        assert_eq!(entry.index, 1);
        assert_eq!(found, record(5.0));
    }

    #[test]
    fn test_stored_fingerprint_keeps_trailing_field() {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        let entry = cache.reserve(&key(0.11, 16.2)).unwrap();

        let stored = read_fingerprint(&entry.geometry_file).unwrap();
        assert_eq!(stored.get("area_ratio_vtp"), Some(0.11));
        assert_eq!(stored.fields().len(), Flavor::Aircraft.fields().len());
    }
}
