//! Five-field cron expressions as users type them.
//!
//! `minute hour day-of-month month day-of-week`, with `*`, lists, ranges,
//! steps and three-letter month/day names. Day-of-week runs 0-7 with both
//! 0 and 7 meaning Sunday. The scheduler backend expects a seconds field
//! and numbers its weekdays differently, so [`CronSchedule::to_six_field`]
//! emits weekday names only.

use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("Cron expression needs 5 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names accepted in place of numbers, starting at `names_base`.
    names: &'static [&'static str],
    names_base: u32,
}

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59, names: &[], names_base: 0 },
    FieldSpec { name: "hour", min: 0, max: 23, names: &[], names_base: 0 },
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], names_base: 0 },
    FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, names_base: 1 },
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: &DAY_NAMES, names_base: 0 },
];

const DOW: usize = 4;

/// A validated five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    fields: [String; 5],
    /// Expanded weekdays, 0 = Sunday.
    weekdays: BTreeSet<u32>,
}

impl CronSchedule {
    /// Validates `expr`.
    ///
    /// ```
    /// use feedrelay::scheduler::CronSchedule;
    ///
    /// assert!(CronSchedule::parse("*/15 8-18 * * 1-5").is_ok());
    /// assert!(CronSchedule::parse("61 * * * *").is_err());
    /// ```
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let raw: Vec<&str> = expr.split_whitespace().collect();
        if raw.len() != FIELDS.len() {
            return Err(CronError::FieldCount(raw.len()));
        }

        let mut weekdays = BTreeSet::new();
        for (idx, (spec, value)) in FIELDS.iter().zip(&raw).enumerate() {
            let expanded = expand(spec, value)?;
            if idx == DOW {
                weekdays = expanded.into_iter().map(|d| d % 7).collect();
            }
        }

        Ok(Self {
            fields: [0, 1, 2, 3, 4].map(|i| raw[i].to_ascii_uppercase()),
            weekdays,
        })
    }

    /// The backend form: a leading seconds field and named weekdays.
    pub fn to_six_field(&self) -> String {
        let dow = if self.weekdays.len() == DAY_NAMES.len() {
            "*".to_string()
        } else {
            self.weekdays
                .iter()
                .map(|d| DAY_NAMES[*d as usize])
                .collect::<Vec<_>>()
                .join(",")
        };
        format!(
            "0 {} {} {} {} {}",
            self.fields[0], self.fields[1], self.fields[2], self.fields[3], dow
        )
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields.join(" "))
    }
}

fn expand(spec: &FieldSpec, raw: &str) -> Result<BTreeSet<u32>, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
        reason,
    };

    let mut values = BTreeSet::new();
    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{}'", step)))?;
                if step == 0 {
                    return Err(invalid("step must be at least 1".into()));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(spec, a).map_err(&invalid)?, value(spec, b).map_err(&invalid)?)
        } else {
            let v = value(spec, range).map_err(&invalid)?;
            // "5/15" means "from 5 every 15"
            (v, if step.is_some() { spec.max } else { v })
        };

        if lo > hi {
            return Err(invalid(format!("range {}-{} is reversed", lo, hi)));
        }
        values.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    }
    Ok(values)
}

fn value(spec: &FieldSpec, token: &str) -> Result<u32, String> {
    if token.is_empty() {
        return Err("empty value".into());
    }
    let v = match token.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|idx| idx as u32 + spec.names_base)
            .ok_or_else(|| format!("unknown value '{}'", token))?,
    };
    if v < spec.min || v > spec.max {
        return Err(format!("{} is outside {}-{}", v, spec.min, spec.max));
    }
    Ok(v)
}
