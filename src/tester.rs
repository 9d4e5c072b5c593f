//! Grading orchestration: one global pipeline, then a task pipeline per
//! selected task (graded concurrently up to a configurable worker count),
//! then a report pipeline for each task that passed.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::{CheckerConfig, ParamMap};
use crate::course::{Course, FileSystemTask};
use crate::error::{ConfigError, GraderError, TestingError};
use crate::pipeline::{PipelineContext, PipelineRunner};
use crate::plugins::PluginRegistry;
use crate::schedule::DeadlineSchedule;

/// Context variables shared by every pipeline in a run.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalVariables {
    pub ref_dir: String,
    pub repo_dir: String,
    pub temp_dir: String,
    pub task_names: Vec<String>,
    pub task_sub_paths: Vec<String>,
}

/// Per-task context variables; `task_score_percent` already carries the
/// deadline multiplier for the grading timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TaskVariables {
    pub task_name: String,
    pub task_sub_path: String,
    pub task_score_percent: f64,
}

pub struct Tester<'a> {
    course: &'a Course,
    schedule: DeadlineSchedule,
    global_pipeline: PipelineRunner,
    task_pipeline: PipelineRunner,
    report_pipeline: PipelineRunner,
    default_params: ParamMap,
    num_workers: usize,
    verbose: bool,
    dry_run: bool,
}

impl<'a> Tester<'a> {
    pub fn new(
        course: &'a Course,
        checker: &CheckerConfig,
        plugins: Arc<PluginRegistry>,
        verbose: bool,
        dry_run: bool,
        num_workers: usize,
    ) -> Result<Self, ConfigError> {
        let testing = &checker.testing;
        if !testing.search_plugins.is_empty() {
            tracing::warn!(
                "search_plugins is ignored; register third-party plugins in the registry instead"
            );
        }
        Ok(Self {
            course,
            schedule: DeadlineSchedule::new(&course.manytask.deadlines),
            global_pipeline: PipelineRunner::new(
                testing.global_pipeline.clone(),
                plugins.clone(),
                verbose,
            )?,
            task_pipeline: PipelineRunner::new(
                testing.tasks_pipeline.clone(),
                plugins.clone(),
                verbose,
            )?,
            report_pipeline: PipelineRunner::new(
                testing.report_pipeline.clone(),
                plugins,
                verbose,
            )?,
            default_params: checker.default_parameters.clone(),
            num_workers: num_workers.max(1),
            verbose,
            dry_run,
        })
    }

    fn global_variables(&self, origin: &Path, tasks: &[FileSystemTask]) -> GlobalVariables {
        GlobalVariables {
            ref_dir: self.course.reference_root.display().to_string(),
            repo_dir: self.course.repository_root.display().to_string(),
            temp_dir: origin.display().to_string(),
            task_names: tasks.iter().map(|task| task.name.clone()).collect(),
            task_sub_paths: tasks
                .iter()
                .map(|task| task.relative_path.display().to_string())
                .collect(),
        }
    }

    fn task_variables(
        &self,
        task: &FileSystemTask,
        timestamp: Option<DateTime<FixedOffset>>,
    ) -> TaskVariables {
        let score_percent = match timestamp {
            Some(at) => self.schedule.multiplier(&task.name, at),
            None => self.schedule.multiplier(&task.name, self.schedule.now()),
        };
        TaskVariables {
            task_name: task.name.clone(),
            task_sub_path: task.relative_path.display().to_string(),
            task_score_percent: score_percent,
        }
    }

    fn task_parameters(&self, task: &FileSystemTask) -> ParamMap {
        let mut parameters = self.default_params.clone();
        if let Some(overrides) = &task.config.parameters {
            parameters.extend(overrides.clone());
        }
        parameters
    }

    /// Check placeholders of all three pipelines against a realistic context
    /// for every enabled task.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tasks: Vec<FileSystemTask> = self
            .course
            .get_tasks(Some(true), None, None)
            .into_iter()
            .cloned()
            .collect();

        tracing::info!("validating global pipeline");
        let global = self.global_variables(Path::new(""), &tasks);
        let mut context =
            PipelineContext::new(&global, None::<&TaskVariables>, &self.default_params);
        self.global_pipeline.validate(&mut context, true)?;
        let outputs = context.outputs();

        for task in &tasks {
            tracing::info!(task = %task.name, "validating task pipelines");
            let variables = self.task_variables(task, None);
            let parameters = self.task_parameters(task);
            let mut context = PipelineContext::new(&global, Some(&variables), &parameters);
            context.seed_outputs(outputs.clone());
            self.task_pipeline.validate(&mut context, true)?;
            self.report_pipeline.validate(&mut context, true)?;
        }
        Ok(())
    }

    /// Run the global pipeline once, then grade every task. Independent
    /// tasks are graded concurrently (bounded by the worker count); each
    /// task gets a fresh outputs map seeded from the global pipeline's
    /// outputs, copied, never aliased.
    pub async fn run(
        &self,
        origin: &Path,
        tasks: Option<Vec<FileSystemTask>>,
        report: bool,
        timestamp: Option<DateTime<FixedOffset>>,
    ) -> Result<(), GraderError> {
        let tasks: Vec<FileSystemTask> = match tasks {
            Some(tasks) => tasks,
            None => self
                .course
                .get_tasks(Some(true), None, None)
                .into_iter()
                .cloned()
                .collect(),
        };

        let global = self.global_variables(origin, &tasks);
        let mut global_outputs = serde_json::Map::new();
        if !self.global_pipeline.is_empty() || self.verbose {
            tracing::info!("running global pipeline");
            let mut context =
                PipelineContext::new(&global, None::<&TaskVariables>, &self.default_params);
            let result = self.global_pipeline.run(&mut context, self.dry_run).await?;
            tracing::info!("{result}");
            if !result.ok() {
                return Err(TestingError::GlobalPipelineFailed.into());
            }
            global_outputs = context.outputs();
        }

        let semaphore = Arc::new(Semaphore::new(self.num_workers));
        let runs = tasks.iter().map(|task| {
            let semaphore = semaphore.clone();
            let global = &global;
            let global_outputs = &global_outputs;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closes");
                self.grade_task(task, global, global_outputs.clone(), report, timestamp)
                    .await
            }
        });
        let results = futures::future::join_all(runs).await;

        let mut failed_tasks = Vec::new();
        for result in results {
            if let Some(name) = result? {
                failed_tasks.push(name);
            }
        }
        if !failed_tasks.is_empty() {
            return Err(TestingError::TasksFailed(failed_tasks).into());
        }
        Ok(())
    }

    /// Returns the task name when its pipeline failed.
    async fn grade_task(
        &self,
        task: &FileSystemTask,
        global: &GlobalVariables,
        global_outputs: serde_json::Map<String, serde_json::Value>,
        report: bool,
        timestamp: Option<DateTime<FixedOffset>>,
    ) -> Result<Option<String>, GraderError> {
        tracing::info!(task = %task.name, "running task pipeline");
        let variables = self.task_variables(task, timestamp);
        let parameters = self.task_parameters(task);
        let mut context = PipelineContext::new(global, Some(&variables), &parameters);
        context.seed_outputs(global_outputs);

        let result = self.task_pipeline.run(&mut context, self.dry_run).await?;
        tracing::info!("{result}");
        if !result.ok() {
            return Ok(Some(task.name.clone()));
        }

        tracing::info!(task = %task.name, "running report pipeline");
        let report_dry_run = self.dry_run || !report;
        let report_result = self.report_pipeline.run(&mut context, report_dry_run).await?;
        if report_result.ok() {
            tracing::info!(task = %task.name, "reporting succeeded");
        } else {
            tracing::warn!(task = %task.name, "reporting failed");
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManytaskConfig;
    use crate::error::{FailureCause, PluginFailure};
    use crate::plugins::{Plugin, PluginOutput};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every resolved args value it is invoked with.
    struct CapturePlugin {
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Plugin for CapturePlugin {
        fn name(&self) -> &'static str {
            "capture"
        }

        fn validate_args(&self, _args: &Value) -> Result<(), String> {
            Ok(())
        }

        async fn run(&self, args: Value, _verbose: bool) -> Result<PluginOutput, PluginFailure> {
            let fail = args.get("fail").and_then(Value::as_bool).unwrap_or(false);
            self.seen.lock().unwrap().push(args);
            if fail {
                Err(PluginFailure::new(FailureCause::BadInput, "requested failure"))
            } else {
                Ok(PluginOutput::new("captured"))
            }
        }
    }

    fn manytask_yaml() -> &'static str {
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
  deadlines: hard
  schedule:
    - group: intro
      start: 2024-01-01 00:00:00
      steps:
        0.5: 2024-06-01 00:00:00
      end: 2025-01-01 00:00:00
      tasks:
        - {task: hello-world, score: 10}
        - {task: fizz-buzz, score: 20}
"#
    }

    fn checker_yaml(tasks_pipeline: &str, report_pipeline: &str) -> CheckerConfig {
        let tasks = if tasks_pipeline.is_empty() {
            "  tasks_pipeline: []\n".to_string()
        } else {
            format!("  tasks_pipeline:\n{tasks_pipeline}")
        };
        let report = if report_pipeline.is_empty() {
            "  report_pipeline: []\n".to_string()
        } else {
            format!("  report_pipeline:\n{report_pipeline}")
        };
        serde_yaml::from_str(&format!(
            "version: 1\nstructure: {{}}\nexport:\n  destination: \
             https://gitlab.example.com/courses/public\ntesting:\n{tasks}{report}"
        ))
        .unwrap()
    }

    fn write_file(root: &std::path::Path, name: &str, content: &str) {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn make_course(dir: &TempDir) -> Course {
        write_file(dir.path(), "intro/.group.yml", "");
        write_file(dir.path(), "intro/hello-world/.task.yml", "");
        write_file(dir.path(), "intro/fizz-buzz/.task.yml", "");
        let manytask: ManytaskConfig = serde_yaml::from_str(manytask_yaml()).unwrap();
        Course::new(manytask, dir.path().to_path_buf(), None, None).unwrap()
    }

    fn capture_registry() -> (Arc<PluginRegistry>, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = PluginRegistry::empty();
        registry.register(Arc::new(CapturePlugin { seen: seen.clone() }));
        (Arc::new(registry), seen)
    }

    fn late() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-07-01T00:00:00+00:00").unwrap()
    }

    #[tokio::test]
    async fn test_score_percent_carries_deadline_multiplier() {
        let dir = TempDir::new().unwrap();
        let course = make_course(&dir);
        let (registry, seen) = capture_registry();
        let checker = checker_yaml(
            "    - name: grade\n      run: capture\n      args:\n        percent: \"${{ task.task_score_percent }}\"\n        task: \"${{ task.task_name }}\"\n",
            "",
        );
        let tester = Tester::new(&course, &checker, registry, false, false, 2).unwrap();

        tester.run(dir.path(), None, false, Some(late())).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for args in seen.iter() {
            // past the 0.5 step at the grading timestamp
            assert_eq!(args["percent"], 0.5);
        }
    }

    #[tokio::test]
    async fn test_failed_task_pipeline_lists_task_and_skips_report() {
        let dir = TempDir::new().unwrap();
        let course = make_course(&dir);
        let (registry, seen) = capture_registry();
        let checker = checker_yaml(
            "    - name: grade\n      run: capture\n      args:\n        fail: \"${{ task.task_name == 'fizz-buzz' }}\"\n        phase: grade\n",
            "    - name: report\n      run: capture\n      args:\n        phase: report\n        task: \"${{ task.task_name }}\"\n",
        );
        let tester = Tester::new(&course, &checker, registry, false, false, 2).unwrap();

        let err = tester.run(dir.path(), None, true, None).await.unwrap_err();
        match err {
            GraderError::Testing(TestingError::TasksFailed(tasks)) => {
                assert_eq!(tasks, vec!["fizz-buzz"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        // report ran only for the passing task
        let seen = seen.lock().unwrap();
        let reports: Vec<_> = seen
            .iter()
            .filter(|args| args["phase"] == "report")
            .collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["task"], "hello-world");
    }

    #[tokio::test]
    async fn test_report_disabled_runs_report_pipeline_as_dry_run() {
        let dir = TempDir::new().unwrap();
        let course = make_course(&dir);
        let (registry, seen) = capture_registry();
        let checker = checker_yaml(
            "    - name: grade\n      run: capture\n      args:\n        phase: grade\n",
            "    - name: report\n      run: capture\n      args:\n        phase: report\n",
        );
        let tester = Tester::new(&course, &checker, registry, false, false, 2).unwrap();

        tester.run(dir.path(), None, false, None).await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|args| args["phase"] == "grade"));
    }

    #[tokio::test]
    async fn test_explicit_task_selection() {
        let dir = TempDir::new().unwrap();
        let course = make_course(&dir);
        let (registry, seen) = capture_registry();
        let checker = checker_yaml(
            "    - name: grade\n      run: capture\n      args:\n        task: \"${{ task.task_name }}\"\n",
            "",
        );
        let tester = Tester::new(&course, &checker, registry, false, false, 2).unwrap();

        let selected = vec![course.find_task("fizz-buzz").unwrap().clone()];
        tester.run(dir.path(), Some(selected), false, None).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["task"], "fizz-buzz");
    }

    #[tokio::test]
    async fn test_validate_checks_placeholders_for_every_task() {
        let dir = TempDir::new().unwrap();
        let course = make_course(&dir);
        let (registry, _) = capture_registry();
        let good = checker_yaml(
            "    - name: grade\n      run: capture\n      args:\n        name: \"${{ task.task_name }}\"\n",
            "",
        );
        Tester::new(&course, &good, registry.clone(), false, false, 1)
            .unwrap()
            .validate()
            .unwrap();

        let bad = checker_yaml(
            "    - name: grade\n      run: capture\n      args:\n        name: \"${{ task.no_such_field }}\"\n",
            "",
        );
        let err = Tester::new(&course, &bad, registry, false, false, 1)
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BadTemplate { .. }));
    }
}
