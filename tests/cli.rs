mod common;

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use common::{tree, Fixture};

fn nc_guard(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_nc_guard"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("NC_GUARD_CONFIG")
        .output()
        .unwrap()
}

#[test]
fn restore_of_missing_backup_fails_untouched() {
    let fixture = Fixture::new();
    let config = fixture.write_config(&fixture.settings());
    let data = tree(&fixture.data());

    let output = nc_guard(&config, &["restore", "/nonexistent/backup"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let error = stderr
        .lines()
        .find(|line| line.contains("ERROR"))
        .unwrap_or_else(|| panic!("no error logged: {stderr}"));
    assert!(error.contains("/nonexistent/backup"), "{error}");

    assert_eq!(tree(&fixture.data()), data);
    assert!(!fixture.calls().contains("maintenance:mode --on"));
}

#[test]
fn invalid_config_is_reported() {
    let fixture = Fixture::new();
    let mut settings = fixture.settings();
    settings.backup.prefix = "next_cloud".into();
    let config = fixture.write_config(&settings);

    let output = nc_guard(&config, &["list"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("prefix"));
}

#[test]
fn missing_config_is_created() {
    let fixture = Fixture::new();
    let config = fixture.path().join("etc/nc_guard.toml");

    let output = nc_guard(&config, &["--dry-run", "list"]);

    assert!(config.is_file());
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn check_update_exit_code() {
    let fixture = Fixture::new();
    let config = fixture.write_config(&fixture.settings());

    let output = nc_guard(&config, &["check-update"]);
    assert_eq!(output.status.code(), Some(0));

    fs::write(
        fixture.updates_file(),
        "Nextcloud 30.0.1 is available. Get more information on how to update online.\n",
    )
    .unwrap();
    let output = nc_guard(&config, &["check-update"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn backup_then_list_and_verify() {
    let fixture = Fixture::new();
    let config = fixture.write_config(&fixture.settings());

    let output = nc_guard(&config, &["backup", "--no-cleanup"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let output = nc_guard(&config, &["list"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .find(|line| line.starts_with("nextcloud_"))
        .unwrap_or_else(|| panic!("backup not listed: {stdout}"));
    assert!(line.contains("full"), "{line}");

    let output = nc_guard(&config, &["verify"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(fixture.backups().join("logs").is_dir());
}

#[test]
fn backup_then_restore() {
    let fixture = Fixture::new();
    let config = fixture.write_config(&fixture.settings());

    let output = nc_guard(&config, &["backup", "--no-cleanup"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let data = tree(&fixture.data());

    fs::write(fixture.data().join("alice/files/kept.txt"), "damaged").unwrap();
    fs::write(fixture.database(), "DROP DATABASE nextcloud;").unwrap();
    fs::write(fixture.config_dir().join("config.php"), "<?php\n").unwrap();

    let output = nc_guard(&config, &["restore", "--no-config"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    assert_eq!(tree(&fixture.data()), data);
    assert_eq!(fs::read_to_string(fixture.database()).unwrap(), common::DUMP);
    assert_eq!(
        fs::read_to_string(fixture.config_dir().join("config.php")).unwrap(),
        "<?php\n"
    );
    assert!(!fixture.maintenance_enabled());
}
