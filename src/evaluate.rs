//! Cache-first evaluation of a [`Case`].

use crate::cache::{CacheEntry, LockPolicy, ResultCache};
use crate::config;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::geometry::Case;
use crate::pipeline::{Pipeline, Settings};
use crate::record::ResultRecord;
use crate::runner::ToolRunner;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub record: ResultRecord,
    pub entry: CacheEntry,
    pub cache_hit: bool,
    pub fingerprint: Fingerprint,
}

pub struct Evaluator<R: ToolRunner> {
    settings: Settings,
    cache: ResultCache,
    runner: R,
    lock: bool,
}

impl<R: ToolRunner> Evaluator<R> {
    pub fn new(settings: Settings, cache: ResultCache, runner: R) -> Self {
        Self {
            settings,
            cache,
            runner,
            lock: true,
        }
    }

    pub fn from_config(cfg: &config::Root, runner: R) -> Result<Self> {
        let cache = ResultCache::open(&cfg.cache.dir)?.with_lock_policy(LockPolicy {
            wait: Duration::from_secs(cfg.cache.lock_wait_secs),
            stale_after: Duration::from_secs(cfg.cache.lock_stale_secs),
            ..LockPolicy::default()
        });
        Ok(Self::new(Settings::from_config(cfg), cache, runner).with_lock(cfg.cache.lock))
    }

    /// Whether the miss path takes the cache writer lock.
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn hit(&self, fingerprint: &Fingerprint) -> Result<Option<Evaluation>> {
        let Some((entry, record)) = self.cache.find(fingerprint)? else {
            return Ok(None);
        };
        info!(index = entry.index, "cache hit");
        Ok(Some(Evaluation {
            record,
            entry,
            cache_hit: true,
            fingerprint: fingerprint.clone(),
        }))
    }

    /// Cached record for `case`, without running anything.
    pub fn lookup(&self, case: &Case) -> Result<Option<Evaluation>> {
        self.hit(&case.fingerprint()?)
    }

    /// Return the cached record for `case`, or run the pipeline and cache its result.
    pub fn evaluate(&self, case: &Case) -> Result<Evaluation> {
        let fingerprint = case.fingerprint()?;
        if let Some(found) = self.hit(&fingerprint)? {
            return Ok(found);
        }

        let _lock = if self.lock { Some(self.cache.lock()?) } else { None };
        // another writer may have stored it before we got the lock
        if let Some(found) = self.hit(&fingerprint)? {
            return Ok(found);
        }

        info!(flavor = ?case.flavor, "cache miss, running pipeline");
        let pipeline = Pipeline::new(&self.settings, &self.runner, case)?;
        let (entry, record) = pipeline.run(&self.cache, &fingerprint)?;
        Ok(Evaluation {
            record,
            entry,
            cache_hit: false,
            fingerprint,
        })
    }
}
