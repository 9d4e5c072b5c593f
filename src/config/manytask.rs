//! Course-wide configuration (`.manytask.yml`): server settings, UI links and
//! the deadline schedule.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

pub const MANYTASK_CONFIG_NAME: &str = ".manytask.yml";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn de_datetime<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_datetime(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid datetime '{raw}'")))
}

/// A deadline boundary: an absolute local datetime, or a day offset relative
/// to the group start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeadlineBound {
    At(NaiveDateTime),
    Days(i64),
}

impl DeadlineBound {
    pub fn resolve(&self, start: NaiveDateTime) -> NaiveDateTime {
        match self {
            DeadlineBound::At(at) => *at,
            DeadlineBound::Days(days) => start + Duration::days(*days),
        }
    }
}

impl<'de> Deserialize<'de> for DeadlineBound {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BoundVisitor;

        impl Visitor<'_> for BoundVisitor {
            type Value = DeadlineBound;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a datetime string or a day offset")
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(DeadlineBound::Days(value))
            }

            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(DeadlineBound::Days(value as i64))
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Self::Value, E> {
                parse_datetime(value)
                    .map(DeadlineBound::At)
                    .ok_or_else(|| E::custom(format!("invalid datetime '{value}'")))
            }
        }

        deserializer.deserialize_any(BoundVisitor)
    }
}

/// Ordered percentage -> deadline mapping. YAML mapping order is preserved.
pub type Steps = Vec<(f64, DeadlineBound)>;

fn de_steps<'de, D>(deserializer: D) -> Result<Steps, D::Error>
where
    D: Deserializer<'de>,
{
    struct StepsVisitor;

    impl<'de> Visitor<'de> for StepsVisitor {
        type Value = Steps;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of percentage to deadline")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut steps = Steps::new();
            while let Some((percent, bound)) = map.next_entry::<f64, DeadlineBound>()? {
                steps.push((percent, bound));
            }
            Ok(steps)
        }
    }

    deserializer.deserialize_map(StepsVisitor)
}

fn default_true() -> bool {
    true
}

/// One gradable task inside a group.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub task: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum points for the task.
    pub score: u32,
    /// Threshold score to consider a large task completed.
    #[serde(default)]
    pub min_score: u32,
    #[serde(default)]
    pub bonus: bool,
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub special: bool,
    #[serde(default)]
    pub url: Option<String>,
}

impl TaskConfig {
    pub fn name(&self) -> &str {
        &self.task
    }
}

/// A group of tasks sharing one deadline block.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(deserialize_with = "de_datetime")]
    #[schemars(with = "String")]
    pub start: NaiveDateTime,
    #[serde(default, deserialize_with = "de_steps")]
    #[schemars(with = "BTreeMap<String, String>")]
    pub steps: Steps,
    #[schemars(with = "String")]
    pub end: DeadlineBound,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl GroupConfig {
    pub fn name(&self) -> &str {
        &self.group
    }

    pub fn start_in(&self, tz: Tz) -> DateTime<Tz> {
        localize(tz, self.start)
    }

    /// Flatten `(start, steps, end)` into the ordered list
    /// `[(1.0, step_0), (p_1, step_1), ..., (p_last, end)]`.
    pub fn percents_before_deadline(&self, tz: Tz) -> Vec<(f64, DateTime<Tz>)> {
        let mut percents = vec![1.0];
        percents.extend(self.steps.iter().map(|(percent, _)| *percent));

        let mut deadlines: Vec<DateTime<Tz>> = self
            .steps
            .iter()
            .map(|(_, bound)| localize(tz, bound.resolve(self.start)))
            .collect();
        deadlines.push(localize(tz, self.end.resolve(self.start)));

        percents.into_iter().zip(deadlines).collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let start = self.start;
        let end = self.end.resolve(start);
        if end <= start {
            return Err(ConfigError::Invalid(format!(
                "group '{}': end {end} must be after start {start}",
                self.group
            )));
        }

        let mut last_percent = 1.0;
        let mut last_deadline = start;
        for (percent, bound) in &self.steps {
            if *percent >= last_percent {
                return Err(ConfigError::Invalid(format!(
                    "group '{}': step percentages must be strictly decreasing, got {percent}",
                    self.group
                )));
            }
            let deadline = bound.resolve(start);
            if deadline <= last_deadline || deadline >= end {
                return Err(ConfigError::Invalid(format!(
                    "group '{}': step deadline {deadline} must lie strictly between \
                     the previous deadline and the group end",
                    self.group
                )));
            }
            last_percent = *percent;
            last_deadline = deadline;
        }
        Ok(())
    }
}

fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    use chrono::offset::TimeZone;
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

/// Deadline policy: step down instantly or interpolate over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinesPolicy {
    #[default]
    Hard,
    Interpolate,
}

/// The deadline schedule plus its course-wide knobs.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeadlinesConfig {
    #[schemars(with = "String")]
    pub timezone: Tz,
    #[serde(default)]
    pub deadlines: DeadlinesPolicy,
    /// Interpolation window in days; only valid with the interpolate policy.
    #[serde(default)]
    pub window: Option<u32>,
    #[serde(default)]
    pub max_submissions: Option<u32>,
    #[serde(default)]
    pub submission_penalty: f64,
    pub schedule: Vec<GroupConfig>,
}

impl DeadlinesConfig {
    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max) = self.max_submissions {
            if max == 0 {
                return Err(ConfigError::Invalid(
                    "max_submissions must be positive".into(),
                ));
            }
        }
        if self.submission_penalty < 0.0 {
            return Err(ConfigError::Invalid(
                "submission_penalty must be non-negative".into(),
            ));
        }
        match (self.deadlines, self.window) {
            (DeadlinesPolicy::Hard, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "window can only be used with the interpolate policy".into(),
                ));
            }
            (DeadlinesPolicy::Interpolate, Some(0)) => {
                return Err(ConfigError::Invalid("window must be positive".into()));
            }
            _ => {}
        }

        let mut group_names = std::collections::BTreeSet::new();
        let mut task_names = std::collections::BTreeSet::new();
        for group in &self.schedule {
            group.validate()?;
            if !group_names.insert(group.name()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate group name '{}'",
                    group.name()
                )));
            }
            for task in &group.tasks {
                if !task_names.insert(task.name()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate task name '{}'",
                        task.name()
                    )));
                }
            }
        }

        if self.deadlines == DeadlinesPolicy::Interpolate {
            let window = Duration::days(i64::from(self.window.unwrap_or(0)));
            for group in &self.schedule {
                let deadlines: Vec<_> = group
                    .percents_before_deadline(self.timezone)
                    .into_iter()
                    .map(|(_, deadline)| deadline)
                    .collect();
                for pair in deadlines.windows(2) {
                    if pair[0] + window > pair[1] {
                        return Err(ConfigError::Invalid(format!(
                            "group '{}': interpolation window does not fit between \
                             consecutive deadlines",
                            group.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn find_task(&self, name: &str) -> Option<(&GroupConfig, &TaskConfig)> {
        self.schedule.iter().find_map(|group| {
            group
                .tasks
                .iter()
                .find(|task| task.name() == name)
                .map(|task| (group, task))
        })
    }

    pub fn get_groups(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: DateTime<Tz>,
    ) -> Vec<&GroupConfig> {
        self.schedule
            .iter()
            .filter(|group| enabled.map_or(true, |want| group.enabled == want))
            .filter(|group| {
                started.map_or(true, |want| (group.start_in(self.timezone) <= now) == want)
            })
            .collect()
    }

    /// A task is effectively enabled only when both it and its group are
    /// enabled; a disabled group dominates its member tasks.
    pub fn get_tasks(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: DateTime<Tz>,
    ) -> Vec<&TaskConfig> {
        self.get_groups(None, started, now)
            .into_iter()
            .flat_map(|group| {
                group
                    .tasks
                    .iter()
                    .map(move |task| (group.enabled && task.enabled, task))
            })
            .filter(|(effective, _)| enabled.map_or(true, |want| *effective == want))
            .map(|(_, task)| task)
            .collect()
    }

    /// Sum of scores of started, enabled, non-bonus tasks.
    pub fn max_score(&self, started: Option<bool>, now: DateTime<Tz>) -> u32 {
        self.get_tasks(Some(true), started, now)
            .into_iter()
            .filter(|task| !task.bonus)
            .map(|task| task.score)
            .sum()
    }
}

/// Connection settings for the hosting side of the course.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SettingsConfig {
    pub course_name: String,
    pub gitlab_base_url: String,
    pub public_repo: String,
    pub students_group: String,
}

/// UI settings: task link template and extra links.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UiConfig {
    /// `$GROUP_NAME`, `$TASK_NAME` and `$USER_NAME` macros are substituted.
    pub task_url_template: String,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

impl UiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.task_url_template.starts_with("http://")
            && !self.task_url_template.starts_with("https://")
        {
            return Err(ConfigError::Invalid(
                "task_url_template must be an http(s) url".into(),
            ));
        }
        Ok(())
    }

    pub fn render_task_url(&self, group: &str, task: &str, user: &str) -> String {
        self.task_url_template
            .replace("$GROUP_NAME", group)
            .replace("$TASK_NAME", task)
            .replace("$USER_NAME", user)
    }
}

/// Top-level `.manytask.yml` document.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ManytaskConfig {
    pub version: u32,
    pub settings: SettingsConfig,
    pub ui: UiConfig,
    pub deadlines: DeadlinesConfig,
}

impl ManytaskConfig {
    pub fn from_yaml(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config: ManytaskConfig = super::load_yaml(path)?;
        if config.version != super::SUPPORTED_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: config.version,
            });
        }
        config.ui.validate()?;
        config.deadlines.validate()?;
        Ok(config)
    }

    pub fn get_groups(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: DateTime<Tz>,
    ) -> Vec<&GroupConfig> {
        self.deadlines.get_groups(enabled, started, now)
    }

    pub fn get_tasks(
        &self,
        enabled: Option<bool>,
        started: Option<bool>,
        now: DateTime<Tz>,
    ) -> Vec<&TaskConfig> {
        self.deadlines.get_tasks(enabled, started, now)
    }
}
