//! Compiled-in detection checks
//!
//! Built-in checks run before policy scripts, lowest priority first.

use crate::config::Settings;
use crate::error::Result;
use crate::types::{Action, CheckParams, CheckRequest, DetectionType, Verdict, VerdictSource};

/// A detector compiled into the agent
pub trait BuiltinCheck: Send + Sync {
    /// Short name, reported as `builtin.<name>`
    fn name(&self) -> &str;

    /// Lower runs first
    fn priority(&self) -> i32 {
        100
    }

    /// Detection types this check inspects
    fn detection_types(&self) -> &[DetectionType];

    /// Inspect one interception; `Ok(None)` means no opinion
    fn check(&self, request: &CheckRequest<'_>, settings: &Settings) -> Result<Option<Verdict>>;
}

/// Logs queries whose result set reached `sql.slowquery.min_rows`
#[derive(Debug, Default)]
pub struct SlowQueryCheck;

impl BuiltinCheck for SlowQueryCheck {
    fn name(&self) -> &str {
        "slow_query"
    }

    fn detection_types(&self) -> &[DetectionType] {
        &[DetectionType::SqlSlowQuery]
    }

    fn check(&self, request: &CheckRequest<'_>, settings: &Settings) -> Result<Option<Verdict>> {
        let CheckParams::SqlSlowQuery {
            server, row_count, ..
        } = &request.params
        else {
            return Ok(None);
        };
        // 0 switches the check off
        if settings.sql_slow_query_min_rows == 0 || *row_count < settings.sql_slow_query_min_rows {
            return Ok(None);
        }
        Ok(Some(Verdict::new(
            Action::Log,
            format!(
                "SQL slow query detected: selected {} rows from {}, exceeding {}",
                row_count, server, settings.sql_slow_query_min_rows
            ),
            90,
            VerdictSource::Builtin(self.name().to_string()),
        )))
    }
}

/// Reports security baseline violations found by the host
///
/// Violations are logged, or blocked when `security.enforce_policy` is on.
#[derive(Debug, Default)]
pub struct SecurityPolicyCheck;

impl BuiltinCheck for SecurityPolicyCheck {
    fn name(&self) -> &str {
        "security_policy"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn detection_types(&self) -> &[DetectionType] {
        &[DetectionType::Policy]
    }

    fn check(&self, request: &CheckRequest<'_>, settings: &Settings) -> Result<Option<Verdict>> {
        let CheckParams::Policy {
            policy_id, message, ..
        } = &request.params
        else {
            return Ok(None);
        };
        let action = if settings.enforce_policy {
            Action::Block
        } else {
            Action::Log
        };
        Ok(Some(Verdict::new(
            action,
            format!("Security baseline {} violated: {}", policy_id, message),
            100,
            VerdictSource::Builtin(self.name().to_string()),
        )))
    }
}

/// The checks every agent ships with
pub fn default_checks() -> Vec<Box<dyn BuiltinCheck>> {
    vec![Box::new(SecurityPolicyCheck), Box::new(SlowQueryCheck)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow(rows: u64) -> CheckRequest<'static> {
        CheckRequest::new(
            CheckParams::SqlSlowQuery {
                server: "mysql".to_string(),
                query: "select * from t".to_string(),
                row_count: rows,
            },
            None,
        )
    }

    #[test]
    fn test_slow_query_threshold() {
        let settings = Settings::default();
        let check = SlowQueryCheck;
        assert!(check.check(&slow(499), &settings).unwrap().is_none());

        let verdict = check.check(&slow(500), &settings).unwrap().unwrap();
        assert_eq!(verdict.action, Action::Log);
        assert!(verdict.message.contains("500 rows"));
        assert_eq!(verdict.source.plugin_name(), "builtin.slow_query");
    }

    #[test]
    fn test_slow_query_disabled_at_zero() {
        let settings = Settings {
            sql_slow_query_min_rows: 0,
            ..Settings::default()
        };
        assert!(SlowQueryCheck.check(&slow(10_000), &settings).unwrap().is_none());
    }

    #[test]
    fn test_policy_logs_unless_enforced() {
        let request = CheckRequest::new(
            CheckParams::Policy {
                policy_id: 3001,
                message: "Tomcat runs as root".to_string(),
                details: serde_json::Map::new(),
            },
            None,
        );
        let mut settings = Settings::default();
        let verdict = SecurityPolicyCheck.check(&request, &settings).unwrap().unwrap();
        assert_eq!(verdict.action, Action::Log);

        settings.enforce_policy = true;
        let verdict = SecurityPolicyCheck.check(&request, &settings).unwrap().unwrap();
        assert_eq!(verdict.action, Action::Block);
    }

    #[test]
    fn test_checks_ignore_other_params() {
        let request = CheckRequest::new(CheckParams::file_read("/etc/passwd"), None);
        let settings = Settings::default();
        for check in default_checks() {
            assert!(check.check(&request, &settings).unwrap().is_none());
        }
    }
}
