//! Snapshot-cached scoreboard reads on top of any `ScoreStore`.
//!
//! Bulk and per-user reads are served from an in-memory snapshot that is
//! refreshed either by a timer or by explicit invalidation on a successful
//! write; readers always observe a complete, snapshot-monotonic scoreboard.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};

use crate::error::StoreError;

use super::{MergeFn, ScoreRecord, ScoreStore};

#[derive(Clone, Default)]
struct CourseSnapshot {
    scores: BTreeMap<String, BTreeMap<String, u32>>,
    stats: BTreeMap<String, f64>,
}

#[derive(Clone)]
pub struct CachedScoreStore {
    inner: Arc<dyn ScoreStore>,
    snapshots: Arc<RwLock<HashMap<String, CourseSnapshot>>>,
}

impl CachedScoreStore {
    pub fn new(inner: Arc<dyn ScoreStore>) -> Self {
        Self {
            inner,
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Periodically refresh every course snapshot seen so far. Must be
    /// called from within a tokio runtime.
    pub fn start_refresh_task(&self, every: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let courses: Vec<String> = {
                    let snapshots = store.snapshots.read().await;
                    snapshots.keys().cloned().collect()
                };
                for course in courses {
                    if let Err(e) = store.refresh(&course).await {
                        tracing::warn!(course, "scoreboard refresh failed: {e}");
                    }
                }
            }
        });
    }

    /// Rebuild one course snapshot from the backing store and swap it in
    /// atomically.
    pub async fn refresh(&self, course: &str) -> Result<(), StoreError> {
        let scores = self.inner.get_all_scores(course).await?;
        let stats = self.inner.get_stats(course).await?;
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(course.to_string(), CourseSnapshot { scores, stats });
        Ok(())
    }

    async fn snapshot(&self, course: &str) -> Result<CourseSnapshot, StoreError> {
        {
            let snapshots = self.snapshots.read().await;
            if let Some(snapshot) = snapshots.get(course) {
                return Ok(snapshot.clone());
            }
        }
        self.refresh(course).await?;
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(course).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ScoreStore for CachedScoreStore {
    async fn enroll_user(&self, course: &str, user: &str) -> Result<(), StoreError> {
        self.inner.enroll_user(course, user).await?;
        self.refresh(course).await
    }

    async fn store_score(
        &self,
        course: &str,
        user: &str,
        task: &str,
        submit_time: DateTime<Utc>,
        merge: MergeFn<'_>,
    ) -> Result<u32, StoreError> {
        let score = self
            .inner
            .store_score(course, user, task, submit_time, merge)
            .await?;
        // invalidate on any successful write
        self.refresh(course).await?;
        Ok(score)
    }

    async fn get_record(
        &self,
        course: &str,
        user: &str,
        task: &str,
    ) -> Result<Option<ScoreRecord>, StoreError> {
        self.inner.get_record(course, user, task).await
    }

    async fn get_scores(
        &self,
        course: &str,
        user: &str,
    ) -> Result<BTreeMap<String, u32>, StoreError> {
        let snapshot = self.snapshot(course).await?;
        Ok(snapshot.scores.get(user).cloned().unwrap_or_default())
    }

    async fn get_all_scores(
        &self,
        course: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, u32>>, StoreError> {
        Ok(self.snapshot(course).await?.scores)
    }

    async fn get_stats(&self, course: &str) -> Result<BTreeMap<String, f64>, StoreError> {
        Ok(self.snapshot(course).await?.stats)
    }
}
