//! The server-side score API: the component behind the HTTP endpoint the
//! `report_score` plugin POSTs to. Applies the deadline multiplier and the
//! monotonic merge rule, arbitrates per-student repositories through the
//! `RepoHost` interface and exposes leaderboard statistics.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ManytaskConfig;
use crate::error::{HostError, StoreError};
use crate::host::RepoHost;
use crate::schedule::DeadlineSchedule;
use crate::store::{ScoreRecord, ScoreStore};

pub struct ScoreApi {
    config: ManytaskConfig,
    schedule: DeadlineSchedule,
    store: Arc<dyn ScoreStore>,
    host: Arc<dyn RepoHost>,
}

impl ScoreApi {
    pub fn new(
        config: ManytaskConfig,
        store: Arc<dyn ScoreStore>,
        host: Arc<dyn RepoHost>,
    ) -> Self {
        let schedule = DeadlineSchedule::new(&config.deadlines);
        Self {
            config,
            schedule,
            store,
            host,
        }
    }

    fn course(&self) -> &str {
        &self.config.settings.course_name
    }

    /// Record a graded submission. The incoming percentage is multiplied by
    /// the deadline multiplier (when `check_deadline` is set) and the task's
    /// maximum score; the store then applies the monotonic-max merge, or an
    /// additive merge for bonus tasks. A submission penalty, when
    /// configured, reduces only the incoming candidate, never a stored
    /// score.
    pub async fn report_score(
        &self,
        username: &str,
        task_name: &str,
        score_percent: f64,
        check_deadline: bool,
        submit_time: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let (_, task) = self
            .config
            .deadlines
            .find_task(task_name)
            .ok_or_else(|| StoreError::UnknownTask {
                task: task_name.to_string(),
            })?;

        let deadlines = &self.config.deadlines;
        let prior_submissions = self
            .store
            .get_record(self.course(), username, task_name)
            .await?
            .map(|record| record.submissions)
            .unwrap_or(0);
        if let Some(limit) = deadlines.max_submissions {
            if prior_submissions >= limit {
                return Err(StoreError::SubmissionLimit {
                    task: task_name.to_string(),
                    limit,
                });
            }
        }

        let multiplier = if check_deadline {
            self.schedule.multiplier(task_name, submit_time)
        } else {
            1.0
        };
        let raw = (score_percent * multiplier * f64::from(task.score)).round();
        let penalty = (deadlines.submission_penalty * f64::from(prior_submissions)).round();
        let candidate = (raw - penalty).max(0.0) as u32;

        let bonus = task.bonus;
        let merge = move |current: Option<&ScoreRecord>| {
            let old = current.map(|record| record.score).unwrap_or(0);
            if bonus {
                old + candidate
            } else {
                old.max(candidate)
            }
        };
        self.store
            .store_score(self.course(), username, task_name, submit_time, &merge)
            .await
    }

    /// Fork the public repository for a new student and push the default
    /// branch into the fork.
    pub async fn provision_repo(&self, username: &str) -> Result<String, HostError> {
        let user = self.host.get_user(username).await?;
        let fork = self
            .host
            .create_fork(&self.config.settings.public_repo, &user.username)
            .await?;
        self.host.push_branch(&fork, "main").await?;
        Ok(fork)
    }

    /// Schedule tasks whose directories were touched by the given commit.
    pub async fn changed_tasks_in_commit(
        &self,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<String>, HostError> {
        let changed = self.host.list_changed_files(repo, sha).await?;
        let now = self.config.deadlines.now();
        Ok(self
            .config
            .get_tasks(Some(true), None, now)
            .into_iter()
            .filter(|task| {
                changed.iter().any(|path| {
                    std::path::Path::new(path)
                        .components()
                        .any(|part| part.as_os_str() == task.name())
                })
            })
            .map(|task| task.name().to_string())
            .collect())
    }

    /// A large task counts as completed once its threshold is reached.
    pub fn is_large_task_completed(&self, task_name: &str, score: u32) -> bool {
        self.config
            .deadlines
            .find_task(task_name)
            .map(|(_, task)| task.large && score >= task.min_score)
            .unwrap_or(false)
    }

    pub fn max_score_started(&self, now: Option<DateTime<chrono_tz::Tz>>) -> u32 {
        let now = now.unwrap_or_else(|| self.config.deadlines.now());
        self.config.deadlines.max_score(Some(true), now)
    }

    pub async fn scores(
        &self,
        username: &str,
    ) -> Result<std::collections::BTreeMap<String, u32>, StoreError> {
        self.store.get_scores(self.course(), username).await
    }

    pub async fn all_scores(
        &self,
    ) -> Result<std::collections::BTreeMap<String, std::collections::BTreeMap<String, u32>>, StoreError>
    {
        self.store.get_all_scores(self.course()).await
    }

    pub async fn stats(&self) -> Result<std::collections::BTreeMap<String, f64>, StoreError> {
        self.store.get_stats(self.course()).await
    }

    pub fn task_url(&self, group: &str, task: &str, user: &str) -> String {
        self.config.ui.render_task_url(group, task, user)
    }
}
