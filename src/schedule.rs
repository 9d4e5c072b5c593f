//! Deadline schedule: computes the score multiplier for a task at a given
//! instant under the hard-step or linear-interpolation policy.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::config::{DeadlinesConfig, DeadlinesPolicy};

/// Flattened per-task deadline steps, precomputed from the course schedule.
#[derive(Debug, Clone)]
pub struct DeadlineSchedule {
    policy: DeadlinesPolicy,
    window: Duration,
    timezone: Tz,
    task_steps: HashMap<String, Vec<(f64, DateTime<Tz>)>>,
}

impl DeadlineSchedule {
    pub fn new(config: &DeadlinesConfig) -> Self {
        let mut task_steps = HashMap::new();
        for group in &config.schedule {
            let steps = group.percents_before_deadline(config.timezone);
            for task in &group.tasks {
                task_steps.insert(task.name().to_string(), steps.clone());
            }
        }
        Self {
            policy: config.deadlines,
            window: Duration::days(i64::from(config.window.unwrap_or(0))),
            timezone: config.timezone,
            task_steps,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone)
    }

    pub fn contains(&self, task: &str) -> bool {
        self.task_steps.contains_key(task)
    }

    /// Score multiplier for `task` at instant `at`.
    ///
    /// Hard policy: the percentage of the first deadline not yet passed.
    /// Interpolate policy: within `window` after a deadline the multiplier
    /// slides linearly from the previous percentage to the next one.
    /// After the last deadline the multiplier is 0. Tasks unknown to the
    /// schedule grade at full value.
    pub fn multiplier<Z: chrono::TimeZone>(&self, task: &str, at: DateTime<Z>) -> f64 {
        let Some(steps) = self.task_steps.get(task) else {
            tracing::warn!(task, "task has no deadline schedule, grading at 100%");
            return 1.0;
        };
        let at = at.with_timezone(&self.timezone);

        let mut prev_percent = 1.0;
        let mut prev_deadline = at;
        for (percent, deadline) in steps {
            if at <= *deadline {
                return match self.policy {
                    DeadlinesPolicy::Hard => *percent,
                    DeadlinesPolicy::Interpolate => {
                        self.interpolate(*percent, at, prev_percent, prev_deadline)
                    }
                };
            }
            prev_percent = *percent;
            prev_deadline = *deadline;
        }
        0.0
    }

    fn interpolate(
        &self,
        percent: f64,
        at: DateTime<Tz>,
        prev_percent: f64,
        prev_deadline: DateTime<Tz>,
    ) -> f64 {
        let window = self.window.num_seconds();
        if window == 0 {
            return percent;
        }
        let frac = (at - prev_deadline).num_seconds() as f64 / window as f64;
        if frac >= 1.0 {
            percent
        } else {
            prev_percent - frac * (prev_percent - percent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadlinesConfig;
    use chrono::NaiveDateTime;
    use chrono::TimeZone;

    fn schedule_from_yaml(yaml: &str) -> DeadlineSchedule {
        let config: DeadlinesConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        DeadlineSchedule::new(&config)
    }

    fn utc(value: &str) -> DateTime<chrono_tz::Tz> {
        let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").unwrap();
        chrono_tz::UTC.from_utc_datetime(&naive)
    }

    fn hard_schedule() -> DeadlineSchedule {
        schedule_from_yaml(
            r#"
timezone: UTC
deadlines: hard
schedule:
  - group: g
    start: 2021-01-01 00:00:00
    steps:
      0.9: 2021-01-02 00:00:00
      0.5: 2021-01-03 00:00:00
      0.2: 2021-01-04 00:00:00
    end: 2021-01-05 00:00:00
    tasks:
      - {task: sorting, score: 100}
"#,
        )
    }

    #[test]
    fn test_hard_multiplier_steps_down() {
        let schedule = hard_schedule();
        assert_eq!(schedule.multiplier("sorting", utc("2021-01-01 12:00:00")), 1.0);
        assert_eq!(schedule.multiplier("sorting", utc("2021-01-02 01:00:00")), 0.9);
        assert_eq!(schedule.multiplier("sorting", utc("2021-01-04 01:00:00")), 0.2);
        assert_eq!(schedule.multiplier("sorting", utc("2021-01-05 01:00:00")), 0.0);
    }

    #[test]
    fn test_hard_multiplier_at_exact_deadline() {
        let schedule = hard_schedule();
        // boundaries are inclusive on the earlier percentage
        assert_eq!(schedule.multiplier("sorting", utc("2021-01-02 00:00:00")), 1.0);
        assert_eq!(schedule.multiplier("sorting", utc("2021-01-05 00:00:00")), 0.2);
    }

    fn interpolated_schedule() -> DeadlineSchedule {
        schedule_from_yaml(
            r#"
timezone: UTC
deadlines: interpolate
window: 7
schedule:
  - group: g
    start: 2025-02-16 00:00:00
    steps:
      0.5: 2025-03-01 00:00:00
      0.3: 2025-03-16 00:00:00
    end: 2025-04-01 00:00:00
    tasks:
      - {task: parsing, score: 100}
"#,
        )
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-3,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_interpolated_multiplier() {
        let schedule = interpolated_schedule();
        assert_close(schedule.multiplier("parsing", utc("2025-02-16 00:00:00")), 1.0);
        // just past the first deadline, still at the very start of the window
        assert_close(schedule.multiplier("parsing", utc("2025-03-01 00:01:00")), 1.0);
        // halfway through the 7-day window from 1.0 down to 0.5
        assert_close(schedule.multiplier("parsing", utc("2025-03-04 12:00:00")), 0.75);
        // window fully elapsed
        assert_close(schedule.multiplier("parsing", utc("2025-03-08 00:00:00")), 0.5);
        // halfway through the second window from 0.5 down to 0.3
        assert_close(schedule.multiplier("parsing", utc("2025-03-19 12:00:00")), 0.4);
        // past the end
        assert_close(schedule.multiplier("parsing", utc("2025-04-01 00:01:00")), 0.0);
    }

    #[test]
    fn test_unknown_task_grades_at_full_value() {
        let schedule = hard_schedule();
        assert_eq!(schedule.multiplier("unlisted", utc("2099-01-01 00:00:00")), 1.0);
    }

    #[test]
    fn test_timezone_is_respected() {
        let schedule = schedule_from_yaml(
            r#"
timezone: Europe/Moscow
deadlines: hard
schedule:
  - group: g
    start: 2021-01-01 00:00:00
    steps:
      0.5: 2021-01-02 00:00:00
    end: 2021-01-03 00:00:00
    tasks:
      - {task: io, score: 10}
"#,
        );
        // 22:30 UTC on Jan 1 is 01:30 Moscow on Jan 2, past the first step
        assert_eq!(schedule.multiplier("io", utc("2021-01-01 22:30:00")), 0.5);
    }
}
