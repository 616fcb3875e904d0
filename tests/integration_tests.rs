//! Integration tests for the sequencer binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Generator address nothing listens on.
const DEAD_GENERATOR: &str = "http://127.0.0.1:1/generate";

fn sequencer(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("sequencer");
    cmd.current_dir(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("SEQUENCER_CONFIG");
    cmd
}

fn write_config(dir: &TempDir, content: &str) {
    fs::create_dir_all(dir.path().join(".sequencer")).unwrap();
    fs::write(dir.path().join(".sequencer/sequencer.toml"), content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        sequencer(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("purge"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        sequencer(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_run_requires_topics() {
        let dir = TempDir::new().unwrap();
        sequencer(&dir).arg("run").assert().failure();
    }
}

// =============================================================================
// Init / Config
// =============================================================================

mod init_and_config {
    use super::*;

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();
        sequencer(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Sequence database initialized"));

        assert!(dir.path().join(".sequencer/sequencer.toml").exists());
        assert!(dir.path().join(".sequencer/sequencer.db").exists());
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[limits]\nmax_topics = 3\n");

        sequencer(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join(".sequencer/sequencer.toml")).unwrap();
        assert!(content.contains("max_topics = 3"));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[timing]\npoll_interval_ms = 0\n");

        sequencer(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("timing.poll_interval_ms"));
    }

    #[test]
    fn test_config_show_applies_env() {
        let dir = TempDir::new().unwrap();
        sequencer(&dir)
            .args(["config", "show"])
            .env("SEQUENCER_PORT", "9123")
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9123"));
    }

    #[test]
    fn test_invalid_config_stops_other_commands() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[limits]\nmax_concurrent_jobs = 0\n");

        sequencer(&dir)
            .arg("purge")
            .assert()
            .failure()
            .stderr(predicate::str::contains("max_concurrent_jobs"));
    }
}

// =============================================================================
// Purge / Run
// =============================================================================

mod commands {
    use super::*;

    #[test]
    fn test_purge_on_fresh_database() {
        let dir = TempDir::new().unwrap();
        sequencer(&dir)
            .arg("purge")
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed 0 expired sequence(s)"));
    }

    #[test]
    fn test_run_reports_generator_failures() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[timing]\npoll_interval_ms = 20\n");

        sequencer(&dir)
            .args(["run", "first", "second", "third"])
            .env("SEQUENCER_GENERATOR_URL", DEAD_GENERATOR)
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .failure()
            .stdout(predicate::str::contains("Sequence complete: 0/3"))
            .stderr(predicate::str::contains("3 job(s) failed"));
    }

    #[test]
    fn test_run_rejects_params_outside_allow_list() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[params]\nallowed = [\"Notion\"]\n");

        sequencer(&dir)
            .args(["run", "topic", "--param", "Other"])
            .env("SEQUENCER_GENERATOR_URL", DEAD_GENERATOR)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid request"));
    }
}
