//! Storage resolution per metric name.

use std::time::Duration;

use regex::Regex;

use crate::config::RetentionRule;
use crate::error::ValidationError;

/// Ordered retention rules; the first matching regex wins.
#[derive(Debug, Clone)]
pub struct Retentions {
    rules: Vec<(Regex, i64)>,
    default_step: i64,
}

impl Retentions {
    /// Compiles the configured rules.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidPattern` for a rule that is not a valid regex.
    pub fn new(rules: &[RetentionRule], default: Duration) -> Result<Self, ValidationError> {
        let compiled = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, step_secs(rule.retention)))
                    .map_err(|e| ValidationError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules: compiled,
            default_step: step_secs(default),
        })
    }

    /// Step in seconds for `name`.
    #[must_use]
    pub fn step_for(&self, name: &str) -> i64 {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(name))
            .map_or(self.default_step, |(_, step)| *step)
    }

    /// Rounds `timestamp` to the nearest multiple of `step`.
    #[must_use]
    pub const fn round(timestamp: i64, step: i64) -> i64 {
        if step <= 1 {
            return timestamp;
        }
        timestamp.saturating_add(step / 2) / step * step
    }
}

impl Default for Retentions {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_step: 60,
        }
    }
}

fn step_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_nearest_step() {
        assert_eq!(Retentions::round(1_000_029, 60), 1_000_020);
        assert_eq!(Retentions::round(120, 60), 120);
        assert_eq!(Retentions::round(149, 60), 120);
        assert_eq!(Retentions::round(150, 60), 180);
        assert_eq!(Retentions::round(7, 1), 7);
        assert_eq!(Retentions::round(i64::MAX, 60), i64::MAX / 60 * 60);
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            RetentionRule {
                pattern: "^servers\\.".to_string(),
                retention: Duration::from_secs(10),
            },
            RetentionRule {
                pattern: "cpu".to_string(),
                retention: Duration::from_secs(30),
            },
        ];
        let r = Retentions::new(&rules, Duration::from_secs(60)).unwrap();
        assert_eq!(r.step_for("servers.web1.cpu"), 10);
        assert_eq!(r.step_for("db.cpu"), 30);
        assert_eq!(r.step_for("db.io"), 60);
    }

    #[test]
    fn bad_regex_is_rejected() {
        let rules = vec![RetentionRule {
            pattern: "(".to_string(),
            retention: Duration::from_secs(10),
        }];
        assert!(Retentions::new(&rules, Duration::from_secs(60)).is_err());
    }
}
