// Schedule parsing and next-tick calculation
//
// A site's cadence is either a fixed-rate interval ("interval:<seconds>") or
// a cron expression evaluated in the site's timezone.

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

const INTERVAL_PREFIX: &str = "interval:";

/// Parsed cadence of one site module
#[derive(Clone)]
pub enum ScheduleSpec {
    /// Fixed-rate ticks, measured from the previous deadline
    Interval { every: Duration },
    Cron {
        expression: String,
        schedule: CronSchedule,
        timezone: Tz,
    },
}

impl ScheduleSpec {
    /// Parse a schedule string
    ///
    /// Accepts `interval:<seconds>`, 5-field cron (`min hour dom month dow`)
    /// and 6/7-field cron with seconds.
    pub fn parse(text: &str, timezone: Tz) -> Result<Self, ScheduleError> {
        let text = text.trim();

        if let Some(seconds) = text.strip_prefix(INTERVAL_PREFIX) {
            let seconds: u64 = seconds
                .trim()
                .parse()
                .map_err(|_| ScheduleError::InvalidInterval(text.to_string()))?;
            if seconds == 0 {
                return Err(ScheduleError::InvalidInterval(text.to_string()));
            }
            return Ok(ScheduleSpec::Interval {
                every: Duration::from_secs(seconds),
            });
        }

        let schedule = parse_cron_expression(text)?;
        Ok(ScheduleSpec::Cron {
            expression: text.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn interval(every: Duration) -> Self {
        ScheduleSpec::Interval { every }
    }

    /// Next tick deadline
    ///
    /// Interval ticks are drift-free: the successor is due `every` after the
    /// previous deadline, regardless of how long the tick took. An overrun
    /// tick makes its successor due immediately (clamped to `now`) so ticks
    /// never pile up.
    pub fn next_deadline(&self, previous: Instant, now: Instant) -> Instant {
        match self {
            ScheduleSpec::Interval { every } => {
                let next = previous + *every;
                if next <= now {
                    now
                } else {
                    next
                }
            }
            ScheduleSpec::Cron { .. } => match self.next_cron_delay(Utc::now()) {
                Ok(delay) => now + delay,
                Err(_) => now + FALLBACK_CRON_DELAY,
            },
        }
    }

    /// Delay from `reference` to the next cron occurrence
    pub fn next_cron_delay(&self, reference: DateTime<Utc>) -> Result<Duration, ScheduleError> {
        match self {
            ScheduleSpec::Interval { every } => Ok(*every),
            ScheduleSpec::Cron {
                schedule, timezone, ..
            } => {
                let reference_in_tz = reference.with_timezone(timezone);
                let next = schedule.after(&reference_in_tz).next().ok_or_else(|| {
                    ScheduleError::NoNextExecution {
                        schedule_type: "cron".to_string(),
                    }
                })?;
                let next_utc = next.with_timezone(&Utc);
                Ok((next_utc - reference).to_std().unwrap_or(Duration::ZERO))
            }
        }
    }
}

// A cron expression with no future occurrence re-checks hourly.
const FALLBACK_CRON_DELAY: Duration = Duration::from_secs(3600);

impl fmt::Debug for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Interval { every } => f
                .debug_struct("Interval")
                .field("every_secs", &every.as_secs())
                .finish(),
            ScheduleSpec::Cron {
                expression,
                timezone,
                ..
            } => f
                .debug_struct("Cron")
                .field("expression", expression)
                .field("timezone", &timezone.to_string())
                .finish(),
        }
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleSpec::Interval { every } => write!(f, "{}{}", INTERVAL_PREFIX, every.as_secs()),
            ScheduleSpec::Cron { expression, .. } => f.write_str(expression),
        }
    }
}

/// Parse and validate a cron expression
///
/// Five-field expressions get a leading seconds field of `0`.
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression),
        6 | 7 => expression.to_string(),
        _ => {
            return Err(ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: format!("expected 5, 6 or 7 fields, found {}", fields),
            })
        }
    };

    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse a timezone name such as `Asia/Shanghai`
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Default timezone for cron schedules
pub fn default_timezone() -> Tz {
    chrono_tz::Asia::Shanghai
}
