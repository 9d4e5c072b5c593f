//! The course model: maps the deadline schedule onto the filesystem and
//! answers which tasks exist, which are enabled or started, and which were
//! affected by recent repository changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use chrono_tz::Tz;
use git2::Repository;

use crate::config::{
    ChangesDetection, GroupConfig, ManytaskConfig, SubConfig, GROUP_CONFIG_NAME, TASK_CONFIG_NAME,
};
use crate::error::{ConfigError, GraderError, TestingError};

/// A task directory discovered on disk, marked by a `.task.yml` file.
#[derive(Debug, Clone)]
pub struct FileSystemTask {
    pub name: String,
    pub relative_path: PathBuf,
    pub config: SubConfig,
}

/// A group directory discovered on disk, marked by a `.group.yml` file.
#[derive(Debug, Clone)]
pub struct FileSystemGroup {
    pub name: String,
    pub relative_path: PathBuf,
    pub config: SubConfig,
    pub tasks: Vec<FileSystemTask>,
}

/// Maps schedule groups/tasks to the reference tree. Loaded once per command;
/// only tasks existing both in the schedule and on disk are graded.
pub struct Course {
    pub manytask: ManytaskConfig,
    pub repository_root: PathBuf,
    pub reference_root: PathBuf,
    groups: BTreeMap<String, FileSystemGroup>,
    tasks: BTreeMap<String, FileSystemTask>,
    branch_name: Option<String>,
}

impl Course {
    pub fn new(
        manytask: ManytaskConfig,
        repository_root: PathBuf,
        reference_root: Option<PathBuf>,
        branch_name: Option<String>,
    ) -> Result<Self, ConfigError> {
        let reference_root = reference_root.unwrap_or_else(|| repository_root.clone());
        let tasks = discover_tasks(&reference_root)?;
        let groups = discover_groups(&reference_root, &tasks)?;
        Ok(Self {
            manytask,
            repository_root,
            reference_root,
            groups,
            tasks,
            branch_name,
        })
    }

    /// Every enabled task in the schedule must exist on disk; a missing
    /// group is only worth a warning (it may have no folder of its own).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let now = self.manytask.deadlines.now();
        for group in self.manytask.get_groups(Some(true), None, now) {
            if !self.groups.contains_key(group.name()) {
                tracing::warn!(group = group.name(), "group not found in repository");
            }
        }
        for task in self.manytask.get_tasks(Some(true), None, now) {
            if !self.tasks.contains_key(task.name()) {
                return Err(ConfigError::TaskNotFound {
                    task: task.name().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn get_groups(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: Option<DateTime<Tz>>,
    ) -> Vec<&FileSystemGroup> {
        let now = now.unwrap_or_else(|| self.manytask.deadlines.now());
        self.manytask
            .get_groups(enabled, started, now)
            .into_iter()
            .filter_map(|group| self.groups.get(group.name()))
            .collect()
    }

    pub fn get_tasks(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: Option<DateTime<Tz>>,
    ) -> Vec<&FileSystemTask> {
        let now = now.unwrap_or_else(|| self.manytask.deadlines.now());
        self.manytask
            .get_tasks(enabled, started, now)
            .into_iter()
            .filter_map(|task| self.tasks.get(task.name()))
            .collect()
    }

    pub fn find_task(&self, name: &str) -> Option<&FileSystemTask> {
        self.tasks.get(name)
    }

    pub fn find_group(&self, name: &str) -> Option<&FileSystemGroup> {
        self.groups.get(name)
    }

    /// The set of enabled tasks that should be re-graded, according to the
    /// configured detection mode.
    pub fn detect_changes(
        &self,
        detection: ChangesDetection,
        exact_match: bool,
    ) -> Result<Vec<FileSystemTask>, GraderError> {
        tracing::info!(?detection, "detecting changes");
        let repo = Repository::open(&self.repository_root).map_err(|_| {
            TestingError::Other(format!(
                "git repository not found in {}",
                self.repository_root.display()
            ))
        })?;

        match detection {
            ChangesDetection::BranchName => {
                let branch = self.current_branch(&repo)?;
                tracing::info!(branch, "matching tasks against branch name");
                Ok(self.find_tasks_by_identifier(&branch, exact_match))
            }
            ChangesDetection::CommitMessage => {
                let message = head_commit_message(&repo)?;
                tracing::info!(message, "matching tasks against commit message");
                Ok(self.find_tasks_by_identifier(&message, exact_match))
            }
            ChangesDetection::LastCommitChanges => {
                let changed = last_commit_paths(&repo)?;
                tracing::info!(?changed, "paths changed in last commit");
                Ok(self.find_tasks_by_paths(&changed))
            }
            ChangesDetection::FilesChanged => {
                let changed = working_tree_paths(&repo)?;
                tracing::info!(?changed, "paths changed against HEAD");
                Ok(self.find_tasks_by_paths(&changed))
            }
        }
    }

    fn current_branch(&self, repo: &Repository) -> Result<String, GraderError> {
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        self.branch_name.clone().ok_or_else(|| {
            TestingError::Other("detached HEAD state and no branch name provided".to_string()).into()
        })
    }

    /// Group matches take priority and expand to every enabled task in the
    /// group; otherwise individual tasks are matched. Matching is by exact
    /// name or, unless `exact_match` is set, by substring containment.
    fn find_tasks_by_identifier(&self, identifier: &str, exact_match: bool) -> Vec<FileSystemTask> {
        let matches = |name: &str| name == identifier || (!exact_match && identifier.contains(name));
        let now = self.manytask.deadlines.now();

        let matched_groups: Vec<&GroupConfig> = self
            .manytask
            .get_groups(Some(true), None, now)
            .into_iter()
            .filter(|group| matches(group.name()))
            .collect();
        if !matched_groups.is_empty() {
            let names: Vec<_> = matched_groups.iter().map(|g| g.name()).collect();
            tracing::info!(groups = ?names, "changed groups");
            let task_names: std::collections::BTreeSet<&str> = matched_groups
                .iter()
                .flat_map(|group| group.tasks.iter())
                .filter(|task| task.enabled)
                .map(|task| task.name())
                .collect();
            return self
                .get_tasks(Some(true), None, None)
                .into_iter()
                .filter(|task| task_names.contains(task.name.as_str()))
                .cloned()
                .collect();
        }

        let changed: Vec<FileSystemTask> = self
            .get_tasks(Some(true), None, None)
            .into_iter()
            .filter(|task| matches(&task.name))
            .cloned()
            .collect();
        if changed.is_empty() {
            tracing::warn!(identifier, "no active task or group matched");
        }
        changed
    }

    fn find_tasks_by_paths(&self, changed: &[PathBuf]) -> Vec<FileSystemTask> {
        self.get_tasks(Some(true), None, None)
            .into_iter()
            .filter(|task| {
                changed
                    .iter()
                    .any(|path| path.starts_with(&task.relative_path))
            })
            .cloned()
            .collect()
    }
}

fn discover_tasks(root: &Path) -> Result<BTreeMap<String, FileSystemTask>, ConfigError> {
    let mut tasks = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name() == TASK_CONFIG_NAME)
    {
        let task_dir = entry.path().parent().unwrap_or(root);
        let relative_path = task_dir.strip_prefix(root).unwrap_or(task_dir).to_path_buf();
        let name = task_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let config = SubConfig::from_yaml(entry.path())?;
        tasks.insert(
            name.clone(),
            FileSystemTask {
                name,
                relative_path,
                config,
            },
        );
    }
    Ok(tasks)
}

fn discover_groups(
    root: &Path,
    tasks: &BTreeMap<String, FileSystemTask>,
) -> Result<BTreeMap<String, FileSystemGroup>, ConfigError> {
    let mut groups = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name() == GROUP_CONFIG_NAME)
    {
        let group_dir = entry.path().parent().unwrap_or(root);
        let relative_path = group_dir
            .strip_prefix(root)
            .unwrap_or(group_dir)
            .to_path_buf();
        let name = group_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let config = SubConfig::from_yaml(entry.path())?;
        let group_tasks = tasks
            .values()
            .filter(|task| task.relative_path.starts_with(&relative_path))
            .cloned()
            .collect();
        groups.insert(
            name.clone(),
            FileSystemGroup {
                name,
                relative_path,
                config,
                tasks: group_tasks,
            },
        );
    }
    Ok(groups)
}

fn head_commit_message(repo: &Repository) -> Result<String, GraderError> {
    let commit = repo.head()?.peel_to_commit()?;
    Ok(commit.message().unwrap_or_default().to_string())
}

fn last_commit_paths(repo: &Repository) -> Result<Vec<PathBuf>, GraderError> {
    let commit = repo.head()?.peel_to_commit()?;
    let tree = commit.tree()?;
    let parent_tree = match commit.parent(0) {
        Ok(parent) => Some(parent.tree()?),
        Err(_) => None,
    };
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    Ok(diff_paths(&diff))
}

fn working_tree_paths(repo: &Repository) -> Result<Vec<PathBuf>, GraderError> {
    let tree = repo.head()?.peel_to_commit()?.tree()?;
    let mut options = git2::DiffOptions::new();
    options.include_untracked(true).recurse_untracked_dirs(true);
    let diff = repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut options))?;
    Ok(diff_paths(&diff))
}

fn diff_paths(diff: &git2::Diff) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = diff
        .deltas()
        .flat_map(|delta| {
            [delta.old_file().path(), delta.new_file().path()]
                .into_iter()
                .flatten()
                .map(Path::to_path_buf)
        })
        .collect();
    paths.sort();
    paths.dedup();
    paths
}
