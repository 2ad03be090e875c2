//! Deployment of assembled patch folders.
//!
//! A [`Deployer`] selects a patch from a scanned [`schemapatch_registry::Registry`],
//! refuses patches that are already deployed or overlap newer deployed ones
//! (unless forced), runs each schema script through a [`ScriptExecutor`] and
//! records the result as a renamed log file in the patch folder.

mod executor;
mod orchestrator;

pub use executor::ShellExecutor;
pub use orchestrator::{
    has_marker, strip_comments, BlockReason, DeployOutcome, Deployer, ScriptResult,
    LOG_TIMESTAMP_FORMAT,
};

pub use schemapatch_types::ScriptExecutor;

#[cfg(test)]
mod tests {
    use super::*;
    use schemapatch_registry::Registry;
    use schemapatch_types::{Config, DeployResult, Execution, PatchError, Result};
    use std::cell::RefCell;
    use std::path::Path;

    /// Records every call; targets listed in `failing` get output without the marker.
    #[derive(Default)]
    struct FakeExecutor {
        calls: RefCell<Vec<(String, String)>>,
        failing: Vec<String>,
        spool: bool,
    }

    impl ScriptExecutor for FakeExecutor {
        fn execute(&self, target: &str, script: &str, working_dir: &Path) -> Result<Execution> {
            self.calls.borrow_mut().push((target.to_string(), script.to_string()));
            if self.spool {
                let key = target.split('/').next().unwrap_or(target).to_uppercase();
                std::fs::write(working_dir.join(format!("{}.log", key)), "spooled\n-- SUCCESS\n")?;
            }
            if self.failing.iter().any(|t| t == target) {
                return Ok(Execution {
                    output: "ORA-00942: table or view does not exist\n".into(),
                    exit_code: Some(1),
                });
            }
            Ok(Execution {
                output: "Table created.\nCommit complete.\n-- SUCCESS\n".into(),
                exit_code: Some(0),
            })
        }
    }

    struct BrokenExecutor;

    impl ScriptExecutor for BrokenExecutor {
        fn execute(&self, _target: &str, _script: &str, _working_dir: &Path) -> Result<Execution> {
            Err(PatchError::Execution("sql: No such file or directory".into()))
        }
    }

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, text).expect("write");
    }

    fn script(commit: u64, files: &[&str]) -> String {
        let mut text = format!("-- COMMITS:\n--   {}) change\n--\n\nSET DEFINE OFF\n", commit);
        for f in files {
            text.push_str(&format!("PROMPT -- TABLE\n@\"./{}\"\n", f));
        }
        text.push_str("COMMIT;\nPROMPT -- SUCCESS\n");
        text
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.connections.insert("HR".into(), "hr/hr@db".into());
        config.connections.insert("SALES".into(), "sales/sales@db".into());
        config
    }

    /// ref 2: 20261001-01-JIRA-1 (HR emp), ref 1: 20261002-01-JIRA-2 (HR emp + SALES orders)
    fn patch_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            &dir.path().join("20261001-01-JIRA-1/HR.sql"),
            &script(10, &["database/HR/tables/emp.sql"]),
        );
        write(
            &dir.path().join("20261002-01-JIRA-2/HR.sql"),
            &script(12, &["database/HR/tables/emp.sql"]),
        );
        write(
            &dir.path().join("20261002-01-JIRA-2/SALES.sql"),
            &script(12, &["database/SALES/tables/orders.sql"]),
        );
        dir
    }

    fn log_names(folder: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(folder)
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".log"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_deploy_runs_each_schema_and_records_logs() {
        let dir = patch_root();
        let config = config();
        let exec = FakeExecutor::default();
        let registry = Registry::scan(dir.path()).expect("scan");

        let outcome = Deployer::new(&config, &exec)
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 09-30-00")
            .expect("deploy");

        let calls = exec.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "hr/hr@db");
        assert_eq!(calls[1].0, "sales/sales@db");
        assert!(!calls[0].1.contains("COMMITS"), "comment lines are stripped");
        assert!(calls[0].1.contains("PROMPT -- SUCCESS"));

        match outcome {
            DeployOutcome::Deployed { results, patch } => {
                assert_eq!(results.len(), 2);
                assert!(results.iter().all(|r| r.result == DeployResult::Success));
                assert_eq!(patch.result, Some(DeployResult::Success));
                assert_eq!(patch.deployed_at.as_deref(), Some("2026-10-05 09-30-00"));
            }
            other => panic!("expected deployed, got {:?}", other),
        }
        assert_eq!(
            log_names(&dir.path().join("20261002-01-JIRA-2")),
            vec![
                "HR 2026-10-05 09-30-00 [SUCCESS].log",
                "SALES 2026-10-05 09-30-00 [SUCCESS].log",
            ]
        );
    }

    #[test]
    fn test_already_deployed_is_blocked_unless_forced() {
        let dir = patch_root();
        let config = config();
        let exec = FakeExecutor::default();
        let deployer = Deployer::new(&config, &exec);

        let registry = Registry::scan(dir.path()).expect("scan");
        deployer
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 09-30-00")
            .expect("first deploy");

        let registry = Registry::scan(dir.path()).expect("rescan");
        let blocked = deployer
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 10-00-00")
            .expect("second deploy");
        assert_eq!(
            blocked,
            DeployOutcome::Blocked {
                reference: 1,
                reason: BlockReason::AlreadyDeployed {
                    deployed_at: "2026-10-05 09-30-00".into()
                },
            }
        );
        assert_eq!(exec.calls.borrow().len(), 2, "blocked deploy executes nothing");

        let forced = deployer
            .deploy_at(&registry, "JIRA-2", true, "2026-10-05 10-00-00")
            .expect("forced deploy");
        assert!(matches!(forced, DeployOutcome::Deployed { .. }));
        assert_eq!(exec.calls.borrow().len(), 4);
        assert_eq!(log_names(&dir.path().join("20261002-01-JIRA-2")).len(), 4);
    }

    #[test]
    fn test_older_patch_blocked_by_newer_deployed_patch() {
        let dir = patch_root();
        let config = config();
        let exec = FakeExecutor::default();
        let deployer = Deployer::new(&config, &exec);

        let registry = Registry::scan(dir.path()).expect("scan");
        deployer
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 09-30-00")
            .expect("deploy newer");

        let registry = Registry::scan(dir.path()).expect("rescan");
        let outcome = deployer
            .deploy_at(&registry, "2", false, "2026-10-05 10-00-00")
            .expect("deploy older");
        match outcome {
            DeployOutcome::Blocked {
                reference,
                reason: BlockReason::Conflicts { conflicted_files, with },
            } => {
                assert_eq!(reference, 2);
                assert_eq!(conflicted_files, vec!["database/HR/tables/emp.sql"]);
                assert_eq!(with.len(), 1);
                assert_eq!(with[0].reference, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(exec.calls.borrow().len(), 2);
    }

    #[test]
    fn test_newer_patch_not_blocked_by_older_deployed_patch() {
        let dir = patch_root();
        let config = config();
        let exec = FakeExecutor::default();
        let deployer = Deployer::new(&config, &exec);

        let registry = Registry::scan(dir.path()).expect("scan");
        deployer
            .deploy_at(&registry, "JIRA-1", false, "2026-10-05 09-30-00")
            .expect("deploy older");
        let registry = Registry::scan(dir.path()).expect("rescan");
        let outcome = deployer
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 10-00-00")
            .expect("deploy newer");
        assert!(matches!(outcome, DeployOutcome::Deployed { .. }));
    }

    #[test]
    fn test_failed_schema_does_not_stop_siblings() {
        let dir = patch_root();
        let config = config();
        let exec = FakeExecutor {
            failing: vec!["hr/hr@db".into()],
            ..Default::default()
        };
        let registry = Registry::scan(dir.path()).expect("scan");
        let outcome = Deployer::new(&config, &exec)
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 09-30-00")
            .expect("deploy");

        assert_eq!(exec.calls.borrow().len(), 2);
        match outcome {
            DeployOutcome::Deployed { results, patch } => {
                assert_eq!(results[0].result, DeployResult::Error);
                assert_eq!(results[1].result, DeployResult::Success);
                // Same second: ERROR wins.
                assert_eq!(patch.result, Some(DeployResult::Error));
            }
            other => panic!("expected deployed, got {:?}", other),
        }

        // A failed patch may be retried without forcing.
        let registry = Registry::scan(dir.path()).expect("rescan");
        let retry = Deployer::new(&config, &FakeExecutor::default())
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 09-45-00")
            .expect("retry");
        assert!(matches!(retry, DeployOutcome::Deployed { .. }));
    }

    #[test]
    fn test_missing_connection_records_error() {
        let dir = patch_root();
        let mut config = config();
        config.connections.remove("SALES");
        let exec = FakeExecutor::default();
        let registry = Registry::scan(dir.path()).expect("scan");
        Deployer::new(&config, &exec)
            .deploy_at(&registry, "JIRA-2", false, "2026-10-05 09-30-00")
            .expect("deploy");

        assert_eq!(exec.calls.borrow().len(), 1);
        let folder = dir.path().join("20261002-01-JIRA-2");
        let log = folder.join("SALES 2026-10-05 09-30-00 [ERROR].log");
        let text = std::fs::read_to_string(log).expect("log");
        assert!(text.contains("no connection configured for schema key SALES"));
    }

    #[test]
    fn test_executor_error_recorded_as_failed_attempt() {
        let dir = patch_root();
        let config = config();
        let registry = Registry::scan(dir.path()).expect("scan");
        let outcome = Deployer::new(&config, &BrokenExecutor)
            .deploy_at(&registry, "JIRA-1", false, "2026-10-05 09-30-00")
            .expect("deploy");
        match outcome {
            DeployOutcome::Deployed { results, .. } => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].result, DeployResult::Error);
                assert_eq!(results[0].log_file, "HR 2026-10-05 09-30-00 [ERROR].log");
            }
            other => panic!("expected deployed, got {:?}", other),
        }
    }

    #[test]
    fn test_spooled_log_is_kept() {
        let dir = patch_root();
        let config = config();
        let exec = FakeExecutor {
            spool: true,
            ..Default::default()
        };
        let registry = Registry::scan(dir.path()).expect("scan");
        Deployer::new(&config, &exec)
            .deploy_at(&registry, "JIRA-1", false, "2026-10-05 09-30-00")
            .expect("deploy");
        let log = dir.path().join("20261001-01-JIRA-1/HR 2026-10-05 09-30-00 [SUCCESS].log");
        assert_eq!(std::fs::read_to_string(log).expect("log"), "spooled\n-- SUCCESS\n");
    }

    #[test]
    fn test_ambiguous_query_is_an_error() {
        let dir = patch_root();
        let config = config();
        let exec = FakeExecutor::default();
        let registry = Registry::scan(dir.path()).expect("scan");
        let err = Deployer::new(&config, &exec)
            .deploy_at(&registry, "JIRA", false, "2026-10-05 09-30-00")
            .expect_err("ambiguous");
        assert!(err.is_user_correctable());
        assert!(exec.calls.borrow().is_empty());
    }
}
