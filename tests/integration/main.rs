//! Integration tests for vaultd

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// vaultd pointed at a config file inside `temp` (absent unless written)
    fn vaultd(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("vaultd");
        cmd.env_remove("VAULTD_CONFIG")
            .arg("--config")
            .arg(temp.path().join("config.toml"));
        cmd
    }

    fn serve(temp: &TempDir, extra: &[&str], script: &str) -> assert_cmd::assert::Assert {
        vaultd(temp)
            .arg("serve")
            .arg("--data-dir")
            .arg(temp.path().join("data"))
            .args(extra)
            .write_stdin(script)
            .assert()
    }

    fn user_id(name: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    fn vault_file(temp: &TempDir, name: &str) -> std::path::PathBuf {
        temp.path()
            .join("data")
            .join("vaults")
            .join(format!("{}.json", user_id(name)))
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("vaultd")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Per-user paged item vaults"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("vaultd")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("vaultd"));
    }

    #[test]
    fn config_path_follows_flag() {
        let temp = TempDir::new().unwrap();
        vaultd(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_prints_defaults() {
        let temp = TempDir::new().unwrap();
        vaultd(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]").and(predicate::str::contains("[autosave]")));
    }

    #[test]
    fn config_init_writes_file() {
        let temp = TempDir::new().unwrap();
        vaultd(&temp).args(["config", "init"]).assert().success();
        assert!(temp.path().join("config.toml").exists());

        vaultd(&temp)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[vault]\nmode = 7\n").unwrap();
        vaultd(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration").and(predicate::str::contains("Hint:")));
    }

    #[test]
    fn serve_saves_on_close_and_reloads() {
        let temp = TempDir::new().unwrap();
        serve(&temp, &[], "open alice\nput alice 1 sword\nclose alice\nexit\n")
            .success()
            .stdout(
                predicate::str::contains("[sword ]")
                    .and(predicate::str::contains("closed vault for")),
            );

        let document = std::fs::read_to_string(vault_file(&temp, "alice")).unwrap();
        assert!(document.contains(&user_id("alice").to_string()));

        serve(&temp, &[], "open alice\n")
            .success()
            .stdout(predicate::str::contains("[sword ]"));
    }

    #[test]
    fn serve_flushes_dirty_vaults_at_eof() {
        let temp = TempDir::new().unwrap();
        serve(&temp, &[], "open bob\nput bob 2 torch\n")
            .success()
            .stdout(predicate::str::contains("Shut down"));

        assert!(vault_file(&temp, "bob").exists());
    }

    #[test]
    fn serve_with_sqlite_backend() {
        let temp = TempDir::new().unwrap();
        serve(
            &temp,
            &["--backend", "sqlite"],
            "open carol\nput carol 3 shield\nquit carol\n",
        )
        .success()
        .stdout(predicate::str::contains("sqlite backend"));

        assert!(Path::new(&temp.path().join("data").join("vaults.db")).exists());

        serve(&temp, &["--backend", "sqlite"], "open carol\n")
            .success()
            .stdout(predicate::str::contains("[shield]"));
    }

    #[test]
    fn serve_pages_through_granted_pages() {
        let temp = TempDir::new().unwrap();
        serve(
            &temp,
            &[],
            "pages dave 3\nopen dave\nput dave 1 map\nnext dave\nshow dave\nnav dave 4\n",
        )
        .success()
        .stdout(
            predicate::str::contains("page 2/3")
                .and(predicate::str::contains("closed vault"))
                .and(predicate::str::contains("out of range")),
        );
    }

    #[test]
    fn serve_reports_bad_commands_and_keeps_going() {
        let temp = TempDir::new().unwrap();
        serve(&temp, &[], "dance erin\nput erin 1 cake\nstats\nexit\n")
            .success()
            .stdout(
                predicate::str::contains("unknown command")
                    .and(predicate::str::contains("No open vault session"))
                    .and(predicate::str::contains("cached=0")),
            );
    }
}
