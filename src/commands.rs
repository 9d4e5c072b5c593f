//! Implementations of the CLI subcommands.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};

use crate::cli::{Cli, Commands, ExportView};
use crate::config::{CheckerConfig, ManytaskConfig, CHECKER_CONFIG_NAME, MANYTASK_CONFIG_NAME};
use crate::course::{Course, FileSystemTask};
use crate::error::{ConfigError, GraderError};
use crate::exporter::Exporter;
use crate::plugins::PluginRegistry;
use crate::schema::write_schemas;
use crate::tester::Tester;

pub async fn run(cli: Cli) -> Result<(), GraderError> {
    let verbose = cli.verbose;
    match cli.command {
        Commands::Validate { root } => validate(&root, verbose),
        Commands::Check {
            root,
            reference_root,
            task,
            group,
            parallelize,
            num_processes,
            no_clean,
            dry_run,
        } => {
            check(
                &root,
                &reference_root,
                &task,
                &group,
                worker_count(parallelize, num_processes),
                no_clean,
                dry_run,
                verbose,
            )
            .await
        }
        Commands::Grade {
            root,
            reference_root,
            submit_score,
            timestamp,
            username,
            branch,
            no_clean,
            dry_run,
        } => {
            grade(
                &root,
                &reference_root,
                submit_score,
                timestamp,
                username,
                branch,
                no_clean,
                dry_run,
                verbose,
            )
            .await
        }
        Commands::Export {
            reference_root,
            export_root,
            view,
            commit,
            dry_run,
        } => export(&reference_root, &export_root, view, commit, dry_run, verbose),
        Commands::Schema { output_folder } => write_schemas(&output_folder),
    }
}

fn worker_count(parallelize: bool, num_processes: Option<usize>) -> usize {
    if !parallelize {
        return 1;
    }
    num_processes.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    })
}

fn load_configs(root: &Path) -> Result<(CheckerConfig, ManytaskConfig), GraderError> {
    let checker = CheckerConfig::from_yaml(&root.join(CHECKER_CONFIG_NAME))?;
    let manytask = ManytaskConfig::from_yaml(&root.join(MANYTASK_CONFIG_NAME))?;
    Ok((checker, manytask))
}

fn validate(root: &Path, verbose: bool) -> Result<(), GraderError> {
    tracing::info!("validating configuration files");
    let (checker, manytask) = load_configs(root)?;

    tracing::info!("validating course structure and task configs");
    let course = Course::new(manytask, root.to_path_buf(), None, None)?;
    course.validate()?;

    tracing::info!("validating exporter templates");
    let exporter = Exporter::new(
        &course,
        checker.structure.clone(),
        checker.export.clone(),
        true,
        verbose,
        true,
    )?;
    exporter.validate()?;

    tracing::info!("validating pipelines");
    let registry = Arc::new(PluginRegistry::builtin());
    let tester = Tester::new(&course, &checker, registry, verbose, true, 1)?;
    tester.validate()?;

    tracing::info!("ok");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn check(
    root: &Path,
    reference_root: &Path,
    tasks: &[String],
    groups: &[String],
    num_workers: usize,
    no_clean: bool,
    dry_run: bool,
    verbose: bool,
) -> Result<(), GraderError> {
    validate(reference_root, verbose)?;

    let (checker, manytask) = load_configs(reference_root)?;
    let course = Course::new(
        manytask,
        root.to_path_buf(),
        Some(reference_root.to_path_buf()),
        None,
    )?;

    let exporter = Exporter::new(
        &course,
        checker.structure.clone(),
        checker.export.clone(),
        !no_clean,
        verbose,
        dry_run,
    )?;
    let testing_dir = exporter.temporary_dir().to_path_buf();
    exporter.export_for_testing(&testing_dir)?;

    let selected = select_tasks(&course, tasks, groups)?;
    if let Some(selected) = &selected {
        tracing::info!(
            tasks = ?selected.iter().map(|task| task.name.as_str()).collect::<Vec<_>>(),
            "checking selected tasks"
        );
    }

    let registry = Arc::new(PluginRegistry::builtin());
    let tester = Tester::new(&course, &checker, registry, verbose, dry_run, num_workers)?;
    tester.run(&testing_dir, selected, false, None).await?;
    tracing::info!("testing passed");
    Ok(())
}

/// Resolve explicit `--task` / `--group` selections against the course;
/// unknown names are fatal.
fn select_tasks(
    course: &Course,
    tasks: &[String],
    groups: &[String],
) -> Result<Option<Vec<FileSystemTask>>, GraderError> {
    if tasks.is_empty() && groups.is_empty() {
        return Ok(None);
    }
    let mut selected: Vec<FileSystemTask> = Vec::new();
    for name in tasks {
        let task = course
            .find_task(name)
            .ok_or_else(|| ConfigError::TaskNotFound { task: name.clone() })?;
        selected.push(task.clone());
    }
    for name in groups {
        let group = course.find_group(name).ok_or_else(|| {
            ConfigError::Invalid(format!("group '{name}' not found in repository"))
        })?;
        for task in &group.tasks {
            if !selected.iter().any(|existing| existing.name == task.name) {
                selected.push(task.clone());
            }
        }
    }
    Ok(Some(selected))
}

#[allow(clippy::too_many_arguments)]
async fn grade(
    root: &Path,
    reference_root: &Path,
    submit_score: bool,
    timestamp: Option<DateTime<FixedOffset>>,
    username: Option<String>,
    branch: Option<String>,
    no_clean: bool,
    dry_run: bool,
    verbose: bool,
) -> Result<(), GraderError> {
    let (mut checker, manytask) = load_configs(reference_root)?;
    if let Some(username) = username {
        checker
            .default_parameters
            .insert("username".to_string(), serde_json::Value::String(username));
    }

    let course = Course::new(
        manytask,
        root.to_path_buf(),
        Some(reference_root.to_path_buf()),
        branch,
    )?;

    let exporter = Exporter::new(
        &course,
        checker.structure.clone(),
        checker.export.clone(),
        !no_clean,
        verbose,
        dry_run,
    )?;
    let testing_dir = exporter.temporary_dir().to_path_buf();
    exporter.export_for_testing(&testing_dir)?;

    let changed = course.detect_changes(
        checker.testing.changes_detection,
        checker.testing.exact_changes_match,
    )?;
    if changed.is_empty() {
        tracing::warn!("no tasks to test");
        return Ok(());
    }

    let registry = Arc::new(PluginRegistry::builtin());
    let workers = worker_count(true, None);
    let tester = Tester::new(&course, &checker, registry, verbose, dry_run, workers)?;
    tester
        .run(&testing_dir, Some(changed), submit_score, timestamp)
        .await?;
    tracing::info!("testing passed");
    Ok(())
}

fn export(
    reference_root: &Path,
    export_root: &Path,
    view: ExportView,
    commit: bool,
    dry_run: bool,
    verbose: bool,
) -> Result<(), GraderError> {
    let (checker, manytask) = load_configs(reference_root)?;
    let course = Course::new(manytask, reference_root.to_path_buf(), None, None)?;

    clear_export_root(export_root)?;

    let exporter = Exporter::new(
        &course,
        checker.structure.clone(),
        checker.export.clone(),
        true,
        verbose,
        dry_run,
    )?;
    match view {
        ExportView::Public => exporter.export_public(export_root)?,
        ExportView::Private => exporter.export_private(export_root)?,
    }
    if commit {
        exporter.commit_and_push(export_root, &checker.export.commit_message)?;
    }
    Ok(())
}

/// Empty the export directory, keeping its `.git` folder intact.
fn clear_export_root(export_root: &Path) -> Result<(), GraderError> {
    if !export_root.exists() {
        std::fs::create_dir_all(export_root)?;
        return Ok(());
    }
    for entry in std::fs::read_dir(export_root)? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(root: &Path, name: &str, content: &str) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn make_course_root(root: &Path) {
        write_file(
            root,
            CHECKER_CONFIG_NAME,
            r#"
version: 1
structure:
  private_patterns: [".*"]
export:
  destination: https://gitlab.example.com/courses/public
  templates: create
testing:
  tasks_pipeline:
    - name: run tests
      run: run_script
      args:
        origin: "${{ global.temp_dir }}/${{ task.task_sub_path }}"
        script: echo checked
"#,
        );
        write_file(
            root,
            MANYTASK_CONFIG_NAME,
            r#"
version: 1
settings:
  course_name: rust-course
  gitlab_base_url: https://gitlab.example.com
  public_repo: courses/public
  students_group: students
ui:
  task_url_template: https://example.com/$GROUP_NAME/$TASK_NAME
deadlines:
  timezone: UTC
  schedule:
    - group: intro
      start: 2020-01-01 00:00:00
      end: 2030-12-31 00:00:00
      tasks:
        - {task: hello-world, score: 10}
"#,
        );
        write_file(root, "intro/.group.yml", "");
        write_file(root, "intro/hello-world/.task.yml", "");
        write_file(
            root,
            "intro/hello-world/solution.py",
            "# SOLUTION BEGIN\nprint('hi')\n# SOLUTION END\n",
        );
    }

    #[test]
    fn test_validate_command_on_wellformed_course() {
        let dir = TempDir::new().unwrap();
        make_course_root(dir.path());
        validate(dir.path(), false).unwrap();
    }

    #[test]
    fn test_validate_command_rejects_missing_task_dir() {
        let dir = TempDir::new().unwrap();
        make_course_root(dir.path());
        std::fs::remove_dir_all(dir.path().join("intro/hello-world")).unwrap();
        assert!(validate(dir.path(), false).is_err());
    }

    #[tokio::test]
    async fn test_check_command_runs_pipelines() {
        let dir = TempDir::new().unwrap();
        make_course_root(dir.path());
        check(
            dir.path(),
            dir.path(),
            &[],
            &[],
            2,
            false,
            false,
            false,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_check_command_rejects_unknown_task_selection() {
        let dir = TempDir::new().unwrap();
        make_course_root(dir.path());
        let err = check(
            dir.path(),
            dir.path(),
            &["no-such-task".to_string()],
            &[],
            1,
            false,
            false,
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            GraderError::Config(ConfigError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_export_command_builds_public_view() {
        let dir = TempDir::new().unwrap();
        make_course_root(dir.path());
        let target = TempDir::new().unwrap();
        export(dir.path(), target.path(), ExportView::Public, false, false, false).unwrap();

        let solution =
            std::fs::read_to_string(target.path().join("intro/hello-world/solution.py")).unwrap();
        assert!(solution.contains("TODO: Your solution"));
    }

    #[test]
    fn test_clear_export_root_preserves_git() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), ".git/config", "[core]\n");
        write_file(dir.path(), "stale.txt", "old");
        clear_export_root(dir.path()).unwrap();
        assert!(dir.path().join(".git/config").exists());
        assert!(!dir.path().join("stale.txt").exists());
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(false, Some(8)), 1);
        assert_eq!(worker_count(true, Some(8)), 8);
        assert!(worker_count(true, None) >= 1);
    }
}
