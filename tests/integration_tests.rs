//! CLI integration tests for issue-enhancer.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// The binary with a clean environment rooted in `dir`.
fn enhancer(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("issue-enhancer");
    cmd.env_clear()
        .current_dir(dir.path())
        .arg("--data-dir")
        .arg(dir.path().join("data"));
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        cargo_bin_cmd!("issue-enhancer")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("sync"))
            .stdout(predicate::str::contains("connectors"));
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("issue-enhancer").arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let dir = TempDir::new().unwrap();
        enhancer(&dir)
            .args(["--log-format", "xml", "connectors"])
            .assert()
            .failure();
    }
}

mod connectors {
    use super::*;

    #[test]
    fn test_all_disabled_without_credentials() {
        let dir = TempDir::new().unwrap();
        enhancer(&dir)
            .arg("connectors")
            .assert()
            .success()
            .stdout(predicate::str::contains("slack    disabled (needs SLACK_TOKEN)"))
            .stdout(predicate::str::contains("gdrive   disabled"))
            .stdout(predicate::str::contains("needs LINEAR_API_KEY"));
    }

    #[test]
    fn test_credentials_enable_connectors() {
        let dir = TempDir::new().unwrap();
        enhancer(&dir)
            .env("SLACK_TOKEN", "xoxb-test")
            .env("GH_TOKEN", "ghp_test")
            .arg("connectors")
            .assert()
            .success()
            .stdout(predicate::str::contains("slack    enabled"))
            .stdout(predicate::str::contains("github   enabled"))
            .stdout(predicate::str::contains("gmail    disabled"))
            .stdout(predicate::str::contains("Repository discovery: enabled"));
    }

    #[test]
    fn test_config_file_controls_order() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("custom.toml");
        fs::write(&config, "[sync]\norder = [\"github\", \"slack\"]\n").unwrap();

        let output = enhancer(&dir)
            .arg("--config")
            .arg(&config)
            .arg("connectors")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let text = String::from_utf8(output).unwrap();
        let github = text.find("github").unwrap();
        let slack = text.find("slack").unwrap();
        assert!(github < slack);
        assert!(!text.contains("gdrive"));
    }

    #[test]
    fn test_invalid_config_file_fails() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("broken.toml");
        fs::write(&config, "[cache]\nttl_secs = \"soon\"\n").unwrap();

        enhancer(&dir)
            .arg("--config")
            .arg(&config)
            .arg("connectors")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid config file"));
    }
}

mod status_and_sync {
    use super::*;

    #[test]
    fn test_status_on_fresh_data_dir() {
        let dir = TempDir::new().unwrap();
        let output = enhancer(&dir)
            .arg("status")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let status: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(status["needs_sync"], true);
        assert!(status["last_sync_at"].is_null());
        assert_eq!(status["connectors"].as_array().unwrap().len(), 0);
        assert!(dir.path().join("data").join("enhancer.db").exists());
    }

    #[test]
    fn test_sync_without_connectors_fails() {
        let dir = TempDir::new().unwrap();
        enhancer(&dir)
            .arg("sync")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No connectors are enabled"));
    }

    #[test]
    fn test_serve_requires_linear_key() {
        let dir = TempDir::new().unwrap();
        enhancer(&dir)
            .args(["serve", "--port", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("LINEAR_API_KEY"));
    }
}
