//! In-memory `ScoreStore`: the reference implementation used by tests and
//! single-process deployments. A relational backend implements the same
//! trait with a row lock per score cell; here one table lock serialises
//! writers, which gives the same per-cell guarantee.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;

use super::{MergeFn, ScoreRecord, ScoreStore};

#[derive(Default)]
struct Tables {
    /// course -> enrolled users
    users: BTreeMap<String, BTreeSet<String>>,
    /// (course, user, task) -> record
    cells: BTreeMap<(String, String, String), ScoreRecord>,
}

#[derive(Clone, Default)]
pub struct InMemoryScoreStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoreStore for InMemoryScoreStore {
    async fn enroll_user(&self, course: &str, user: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .users
            .entry(course.to_string())
            .or_default()
            .insert(user.to_string());
        Ok(())
    }

    async fn store_score(
        &self,
        course: &str,
        user: &str,
        task: &str,
        submit_time: DateTime<Utc>,
        merge: MergeFn<'_>,
    ) -> Result<u32, StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .users
            .entry(course.to_string())
            .or_default()
            .insert(user.to_string());

        let key = (course.to_string(), user.to_string(), task.to_string());
        let current = tables.cells.get(&key);
        let new_score = merge(current);
        let submissions = current.map(|record| record.submissions).unwrap_or(0) + 1;
        tables.cells.insert(
            key,
            ScoreRecord {
                score: new_score,
                last_submit_time: submit_time,
                submissions,
            },
        );
        Ok(new_score)
    }

    async fn get_record(
        &self,
        course: &str,
        user: &str,
        task: &str,
    ) -> Result<Option<ScoreRecord>, StoreError> {
        let tables = self.tables.read().await;
        let key = (course.to_string(), user.to_string(), task.to_string());
        Ok(tables.cells.get(&key).cloned())
    }

    async fn get_scores(
        &self,
        course: &str,
        user: &str,
    ) -> Result<BTreeMap<String, u32>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .cells
            .iter()
            .filter(|((c, u, _), _)| c == course && u == user)
            .map(|((_, _, task), record)| (task.clone(), record.score))
            .collect())
    }

    async fn get_all_scores(
        &self,
        course: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, u32>>, StoreError> {
        let tables = self.tables.read().await;
        let mut scoreboard: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
        for user in tables.users.get(course).into_iter().flatten() {
            scoreboard.entry(user.clone()).or_default();
        }
        for ((c, user, task), record) in &tables.cells {
            if c == course {
                scoreboard
                    .entry(user.clone())
                    .or_default()
                    .insert(task.clone(), record.score);
            }
        }
        Ok(scoreboard)
    }

    async fn get_stats(&self, course: &str) -> Result<BTreeMap<String, f64>, StoreError> {
        let tables = self.tables.read().await;
        let enrolled = tables.users.get(course).map(BTreeSet::len).unwrap_or(0);
        if enrolled == 0 {
            return Ok(BTreeMap::new());
        }
        let mut solvers: BTreeMap<String, usize> = BTreeMap::new();
        for ((c, _, task), record) in &tables.cells {
            if c == course {
                let entry = solvers.entry(task.clone()).or_default();
                if record.score > 0 {
                    *entry += 1;
                }
            }
        }
        Ok(solvers
            .into_iter()
            .map(|(task, count)| (task, count as f64 / enrolled as f64))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn max_merge(candidate: u32) -> impl Fn(Option<&ScoreRecord>) -> u32 + Send + Sync {
        move |current| current.map(|record| record.score).unwrap_or(0).max(candidate)
    }

    #[tokio::test]
    async fn test_monotonic_max_merge() {
        let store = InMemoryScoreStore::new();
        // percentages 0.3, 0.9, 0.5 on a 100-point task
        for candidate in [30, 90, 50] {
            store
                .store_score("course", "alice", "sorting", now(), &max_merge(candidate))
                .await
                .unwrap();
        }
        let record = store
            .get_record("course", "alice", "sorting")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.score, 90);
        assert_eq!(record.submissions, 3);
    }

    #[tokio::test]
    async fn test_additive_merge_accumulates() {
        let store = InMemoryScoreStore::new();
        let additive = |candidate: u32| {
            move |current: Option<&ScoreRecord>| {
                current.map(|record| record.score).unwrap_or(0) + candidate
            }
        };
        for candidate in [5, 5, 3] {
            store
                .store_score("course", "alice", "bonus-task", now(), &additive(candidate))
                .await
                .unwrap();
        }
        let record = store
            .get_record("course", "alice", "bonus-task")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.score, 13);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_serialise() {
        let store = InMemoryScoreStore::new();
        let mut handles = Vec::new();
        for candidate in 1..=20u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .store_score("course", "bob", "race", now(), &max_merge(candidate))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let record = store
            .get_record("course", "bob", "race")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.score, 20);
        assert_eq!(record.submissions, 20);
    }

    #[tokio::test]
    async fn test_scoreboard_and_stats() {
        let store = InMemoryScoreStore::new();
        store.enroll_user("course", "alice").await.unwrap();
        store.enroll_user("course", "bob").await.unwrap();
        store.enroll_user("course", "carol").await.unwrap();
        store
            .store_score("course", "alice", "sorting", now(), &max_merge(10))
            .await
            .unwrap();
        store
            .store_score("course", "bob", "sorting", now(), &max_merge(0))
            .await
            .unwrap();

        let scoreboard = store.get_all_scores("course").await.unwrap();
        assert_eq!(scoreboard.len(), 3);
        assert_eq!(scoreboard["alice"]["sorting"], 10);
        assert!(scoreboard["carol"].is_empty());

        // one of three enrolled users has a non-zero score
        let stats = store.get_stats("course").await.unwrap();
        assert!((stats["sorting"] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_courses_are_isolated() {
        let store = InMemoryScoreStore::new();
        store
            .store_score("course-a", "alice", "sorting", now(), &max_merge(10))
            .await
            .unwrap();
        let other = store.get_scores("course-b", "alice").await.unwrap();
        assert!(other.is_empty());
    }
}
