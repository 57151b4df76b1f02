//! Jobs a provider registers with the service center.
//!
//! The center owns the timing. The provider only keeps the job's action and
//! runs it when a trigger arrives.

use crate::error::RpcError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Repeat count meaning "until cancelled".
pub const REPEAT_FOREVER: i32 = -1;

/// When the center should fire a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleSpec {
    /// Cron expression, evaluated by the center. Five to seven fields.
    Cron(String),
    /// Fixed interval, fired `repeat_count + 1` times, or forever with
    /// [`REPEAT_FOREVER`].
    Interval {
        hours: u32,
        minutes: u32,
        seconds: u32,
        millis: u32,
        repeat_count: i32,
    },
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        ScheduleSpec::Cron(expression.into())
    }

    /// An interval spec from a duration, split into its wire fields.
    ///
    /// Fails if the hours do not fit the wire field.
    pub fn every(period: Duration, repeat_count: i32) -> Result<Self, String> {
        let total_secs = period.as_secs();
        let hours = u32::try_from(total_secs / 3600)
            .map_err(|_| format!("interval {:?} is too long", period))?;
        Ok(ScheduleSpec::Interval {
            hours,
            minutes: ((total_secs % 3600) / 60) as u32,
            seconds: (total_secs % 60) as u32,
            millis: period.subsec_millis(),
            repeat_count,
        })
    }

    /// Total period of an interval spec.
    pub fn period(&self) -> Option<Duration> {
        match self {
            ScheduleSpec::Cron(_) => None,
            ScheduleSpec::Interval {
                hours,
                minutes,
                seconds,
                millis,
                ..
            } => Some(
                Duration::from_secs(*hours as u64 * 3600 + *minutes as u64 * 60 + *seconds as u64)
                    + Duration::from_millis(*millis as u64),
            ),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ScheduleSpec::Cron(expr) => {
                let fields = expr.split_whitespace().count();
                if !(5..=7).contains(&fields) {
                    return Err(format!(
                        "cron expression '{}' has {} fields, expected 5 to 7",
                        expr, fields
                    ));
                }
            }
            ScheduleSpec::Interval { repeat_count, .. } => {
                if self.period().map_or(true, |p| p.is_zero()) {
                    return Err("interval must be greater than zero".to_string());
                }
                if *repeat_count < REPEAT_FOREVER {
                    return Err(format!("invalid repeat count {}", repeat_count));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Cron(expr) => write!(f, "cron '{}'", expr),
            ScheduleSpec::Interval { repeat_count, .. } => {
                let period = self.period().unwrap_or_default();
                if *repeat_count == REPEAT_FOREVER {
                    write!(f, "every {:?}", period)
                } else {
                    write!(f, "every {:?}, {} repeat(s)", period, repeat_count)
                }
            }
        }
    }
}

type JobAction = Arc<dyn Fn() + Send + Sync>;

/// A named job and the action run on each trigger.
#[derive(Clone)]
pub struct ProviderJob {
    name: String,
    spec: ScheduleSpec,
    action: JobAction,
}

impl ProviderJob {
    pub fn new<F>(name: impl Into<String>, spec: ScheduleSpec, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            spec,
            action: Arc::new(action),
        }
    }

    pub fn cron<F>(name: impl Into<String>, expression: impl Into<String>, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(name, ScheduleSpec::cron(expression), action)
    }

    pub fn interval<F>(
        name: impl Into<String>,
        period: Duration,
        repeat_count: i32,
        action: F,
    ) -> Result<Self, RpcError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let spec = ScheduleSpec::every(period, repeat_count).map_err(|reason| {
            RpcError::InvalidSchedule {
                job: name.clone(),
                reason,
            }
        })?;
        Ok(Self::new(name, spec, action))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ScheduleSpec {
        &self.spec
    }

    /// Runs the action once.
    pub fn run(&self) {
        (*self.action)()
    }
}

impl fmt::Debug for ProviderJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderJob")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}
