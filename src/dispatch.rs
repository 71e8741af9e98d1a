//! Detection dispatcher
//!
//! Runs the built-in checks for a detection type, then the policy
//! sandbox, and collects every verdict into one [`DetectionOutcome`].
//! A check that errors or panics is logged and counted as a failure; it
//! never reaches the caller.

use crate::checks::BuiltinCheck;
use crate::config::{ConfigStore, Settings};
use crate::sandbox::PolicySandbox;
use crate::types::{CheckParams, CheckRequest, DetectionOutcome};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

pub struct Dispatcher {
    config: Arc<ConfigStore>,
    sandbox: Arc<PolicySandbox>,
    builtins: Vec<Box<dyn BuiltinCheck>>,
}

impl Dispatcher {
    /// Built-ins are ordered by priority; equal priorities keep the given order
    pub fn new(
        config: Arc<ConfigStore>,
        sandbox: Arc<PolicySandbox>,
        mut builtins: Vec<Box<dyn BuiltinCheck>>,
    ) -> Self {
        builtins.sort_by_key(|check| check.priority());
        Self {
            config,
            sandbox,
            builtins,
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn sandbox(&self) -> &Arc<PolicySandbox> {
        &self.sandbox
    }

    /// Names of the built-in checks in execution order
    pub fn builtin_names(&self) -> Vec<&str> {
        self.builtins.iter().map(|c| c.name()).collect()
    }

    /// Whether the request is switched off by configuration
    fn skipped(request: &CheckRequest<'_>, settings: &Settings) -> bool {
        if settings.is_hook_ignored(request.detection_type.as_str()) {
            return true;
        }
        match &request.params {
            CheckParams::Ognl { expression } => expression.chars().count() < settings.ognl_min_length,
            _ => false,
        }
    }

    /// Run every applicable check
    pub fn dispatch(&self, request: &CheckRequest<'_>) -> DetectionOutcome {
        let settings = self.config.snapshot();
        let mut outcome = DetectionOutcome::empty(request.detection_type);
        if Self::skipped(request, &settings) {
            return outcome;
        }

        let started = Instant::now();

        for check in self
            .builtins
            .iter()
            .filter(|c| c.detection_types().contains(&request.detection_type))
        {
            match catch_unwind(AssertUnwindSafe(|| check.check(request, &settings))) {
                Ok(Ok(Some(verdict))) => outcome.verdicts.push(verdict),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    outcome.failures += 1;
                    tracing::warn!(check = check.name(), detection_type = %request.detection_type, error = %e, "Built-in check failed");
                }
                Err(_) => {
                    outcome.failures += 1;
                    tracing::error!(check = check.name(), detection_type = %request.detection_type, "Built-in check panicked");
                }
            }
        }

        match catch_unwind(AssertUnwindSafe(|| self.sandbox.invoke(request))) {
            Ok(Ok(run)) => {
                outcome.failures += run.failures.len();
                outcome.verdicts.extend(run.verdicts);
            }
            Ok(Err(e)) => {
                outcome.failures += 1;
                tracing::warn!(detection_type = %request.detection_type, error = %e, "Policy checks failed");
            }
            Err(_) => {
                outcome.failures += 1;
                tracing::error!(detection_type = %request.detection_type, "Policy sandbox panicked");
            }
        }

        outcome.elapsed = started.elapsed();
        let elapsed_us = outcome.elapsed.as_micros() as u64;
        let request_id = request.request_id().unwrap_or("");
        if settings.is_debug_enabled() {
            tracing::info!(
                detection_type = %request.detection_type,
                request_id,
                elapsed_us,
                action = %outcome.action(),
                "Detection finished"
            );
        } else {
            tracing::trace!(
                detection_type = %request.detection_type,
                request_id,
                elapsed_us,
                "Detection finished"
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::default_checks;
    use crate::error::{RaspError, Result};
    use crate::sandbox::PolicyScript;
    use crate::types::{Action, DetectionType, Verdict, VerdictSource};

    struct Fixed {
        name: &'static str,
        priority: i32,
        action: Action,
    }

    impl BuiltinCheck for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn detection_types(&self) -> &[DetectionType] {
            &[DetectionType::FileRead]
        }
        fn check(&self, _request: &CheckRequest<'_>, _settings: &Settings) -> Result<Option<Verdict>> {
            Ok(Some(Verdict::new(
                self.action,
                self.name,
                100,
                VerdictSource::Builtin(self.name.to_string()),
            )))
        }
    }

    struct Panics;

    impl BuiltinCheck for Panics {
        fn name(&self) -> &str {
            "panics"
        }
        fn detection_types(&self) -> &[DetectionType] {
            &[DetectionType::FileRead]
        }
        fn check(&self, _request: &CheckRequest<'_>, _settings: &Settings) -> Result<Option<Verdict>> {
            panic!("detector bug")
        }
    }

    struct Fails;

    impl BuiltinCheck for Fails {
        fn name(&self) -> &str {
            "fails"
        }
        fn detection_types(&self) -> &[DetectionType] {
            &[DetectionType::FileRead]
        }
        fn check(&self, _request: &CheckRequest<'_>, _settings: &Settings) -> Result<Option<Verdict>> {
            Err(RaspError::Config("broken".to_string()))
        }
    }

    fn dispatcher(builtins: Vec<Box<dyn BuiltinCheck>>) -> Dispatcher {
        let config = Arc::new(ConfigStore::in_memory());
        let sandbox = Arc::new(PolicySandbox::new(Arc::clone(&config)));
        Dispatcher::new(config, sandbox, builtins)
    }

    #[test]
    fn test_builtins_sorted_by_priority() {
        let d = dispatcher(vec![
            Box::new(Fixed {
                name: "late",
                priority: 50,
                action: Action::Log,
            }),
            Box::new(Fixed {
                name: "early",
                priority: 1,
                action: Action::Log,
            }),
        ]);
        assert_eq!(d.builtin_names(), vec!["early", "late"]);

        let outcome = d.dispatch(&CheckRequest::new(CheckParams::file_read("/x"), None));
        let order: Vec<_> = outcome.verdicts.iter().map(|v| v.message.as_str()).collect();
        assert_eq!(order, vec!["early", "late"]);
    }

    #[test]
    fn test_collects_all_verdicts_around_block() {
        let d = dispatcher(vec![
            Box::new(Fixed {
                name: "logger",
                priority: 1,
                action: Action::Log,
            }),
            Box::new(Fixed {
                name: "blocker",
                priority: 2,
                action: Action::Block,
            }),
        ]);
        d.sandbox()
            .activate(vec![PolicyScript::new(
                "p.rhai",
                r#"plugin("after").register("file-read", |p, c| #{ action: "log" });"#,
            )])
            .unwrap();

        let outcome = d.dispatch(&CheckRequest::new(CheckParams::file_read("/etc/passwd"), None));
        assert_eq!(outcome.action(), Action::Block);
        assert_eq!(outcome.verdicts.len(), 3);
        assert_eq!(outcome.reportable().count(), 3);
    }

    #[test]
    fn test_failures_are_isolated() {
        let d = dispatcher(vec![
            Box::new(Panics),
            Box::new(Fails),
            Box::new(Fixed {
                name: "ok",
                priority: 200,
                action: Action::Log,
            }),
        ]);
        let outcome = d.dispatch(&CheckRequest::new(CheckParams::file_read("/x"), None));
        assert_eq!(outcome.failures, 2);
        assert_eq!(outcome.verdicts.len(), 1);
        assert_eq!(outcome.action(), Action::Log);
    }

    #[test]
    fn test_ignored_hooks_are_skipped() {
        let d = dispatcher(vec![Box::new(Fixed {
            name: "blocker",
            priority: 1,
            action: Action::Block,
        })]);
        d.config().set("hooks.ignore", "sql-query,file-read");
        let outcome = d.dispatch(&CheckRequest::new(CheckParams::file_read("/etc/passwd"), None));
        assert!(outcome.verdicts.is_empty());
        assert_eq!(outcome.action(), Action::Ignore);
    }

    #[test]
    fn test_short_ognl_expressions_are_skipped() {
        let d = dispatcher(default_checks());
        d.sandbox()
            .activate(vec![PolicyScript::new(
                "ognl.rhai",
                r#"plugin("ognl").register("ognl", |p, c| #{ action: "block" });"#,
            )])
            .unwrap();

        let short = CheckRequest::new(
            CheckParams::Ognl {
                expression: "name".to_string(),
            },
            None,
        );
        assert!(d.dispatch(&short).verdicts.is_empty());

        let long = CheckRequest::new(
            CheckParams::Ognl {
                expression: "#_memberAccess['allowStaticMethodAccess']=true".to_string(),
            },
            None,
        );
        assert!(d.dispatch(&long).is_blocked());
    }

    #[test]
    fn test_sandbox_timeout_keeps_earlier_block() {
        let d = dispatcher(Vec::new());
        d.config().set("plugin.timeout.millis", "50");
        d.sandbox()
            .activate(vec![PolicyScript::new(
                "spin.rhai",
                r#"
                plugin("block-first").register("file-read", |p, c| #{ action: "block" });
                plugin("spin").register("file-read", |p, c| { let i = 0; loop { i += 1; } });
                "#,
            )])
            .unwrap();
        let outcome = d.dispatch(&CheckRequest::new(CheckParams::file_read("/x"), None));
        assert_eq!(outcome.failures, 1);
        assert!(outcome.is_blocked());
    }

    #[test]
    fn test_sandbox_timeout_alone_is_non_blocking() {
        let d = dispatcher(Vec::new());
        d.config().set("plugin.timeout.millis", "50");
        d.sandbox()
            .activate(vec![PolicyScript::new(
                "spin.rhai",
                r#"plugin("spin").register("file-read", |p, c| { let i = 0; loop { i += 1; } });"#,
            )])
            .unwrap();
        let outcome = d.dispatch(&CheckRequest::new(CheckParams::file_read("/x"), None));
        assert_eq!(outcome.failures, 1);
        assert!(outcome.verdicts.is_empty());
        assert!(!outcome.is_blocked());
    }
}
