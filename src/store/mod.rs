//! Score persistence: the `ScoreStore` contract, an in-memory reference
//! implementation and a snapshot-cached wrapper for scoreboard reads.

mod cached;
mod memory;

pub use cached::CachedScoreStore;
pub use memory::InMemoryScoreStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One `(course, user, task)` score cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub score: u32,
    pub last_submit_time: DateTime<Utc>,
    pub submissions: u32,
}

/// Idempotent merge applied inside the store's per-cell critical section:
/// given the current record (if any), produce the new score. The default
/// merge used by the reporter is monotonic max; bonus tasks accumulate.
pub type MergeFn<'a> = &'a (dyn Fn(Option<&ScoreRecord>) -> u32 + Send + Sync);

/// Per-(course, user, task) score records with a monotonic update rule, bulk
/// scoreboard reads and per-task statistics. Concurrent submissions for the
/// same cell are serialised by the implementation.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn enroll_user(&self, course: &str, user: &str) -> Result<(), StoreError>;

    /// Apply `merge` to the cell under its row lock and return the new
    /// score. The submission counter and submit time are updated as well.
    async fn store_score(
        &self,
        course: &str,
        user: &str,
        task: &str,
        submit_time: DateTime<Utc>,
        merge: MergeFn<'_>,
    ) -> Result<u32, StoreError>;

    async fn get_record(
        &self,
        course: &str,
        user: &str,
        task: &str,
    ) -> Result<Option<ScoreRecord>, StoreError>;

    /// All of one user's task scores.
    async fn get_scores(
        &self,
        course: &str,
        user: &str,
    ) -> Result<BTreeMap<String, u32>, StoreError>;

    /// The full scoreboard: user -> task -> score.
    async fn get_all_scores(
        &self,
        course: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, u32>>, StoreError>;

    /// Per task, the fraction of enrolled users with a non-zero score.
    async fn get_stats(&self, course: &str) -> Result<BTreeMap<String, f64>, StoreError>;
}
