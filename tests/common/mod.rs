//! A fake Nextcloud installation in a temporary directory.
//!
//! `occ` is a shell script run through `sh` that keeps the maintenance state
//! in a file and records its calls. The database is a plain file: the fake
//! dump tool prints it and the fake client overwrites it.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nc_guard_lib::backends::CopyMethod;
use nc_guard_lib::settings::Settings;
use nc_guard_lib::util::step::StepPolicy;
use tempfile::TempDir;
use walkdir::WalkDir;

pub const DUMP: &str = "-- MySQL dump 10.13  Distrib 8.0.36, for Linux (x86_64)\n\
--\n\
-- Host: localhost    Database: nextcloud\n\
CREATE TABLE `oc_accounts` (\n  `uid` varchar(64) NOT NULL\n);\n\
INSERT INTO `oc_accounts` VALUES ('alice');\n";

pub const CONFIG_PHP: &str = "<?php\n$CONFIG = array (\n  'instanceid' => 'oc1234',\n  'dbname' => 'nextcloud',\n  'dbpassword' => 'secret',\n  'installed' => true,\n);\n";

pub struct Fixture {
    pub dir: TempDir,
}

pub fn write_script(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };

        fs::create_dir_all(fixture.config_dir()).unwrap();
        fs::write(fixture.config_dir().join("config.php"), CONFIG_PHP).unwrap();
        fs::create_dir_all(fixture.document_root().join("custom_apps/notes/appinfo")).unwrap();
        fs::write(
            fixture.document_root().join("custom_apps/notes/appinfo/info.xml"),
            "<info><id>notes</id></info>\n",
        )
        .unwrap();

        fs::create_dir_all(fixture.data().join("alice/files")).unwrap();
        fs::write(fixture.data().join("alice/files/kept.txt"), "unchanged").unwrap();
        fs::write(fixture.data().join("alice/files/edited.txt"), "v1").unwrap();
        fs::write(fixture.data().join(".ocdata"), "").unwrap();

        fs::write(fixture.database(), DUMP).unwrap();
        fs::create_dir_all(fixture.bin()).unwrap();
        fixture.write_occ();
        write_script(
            &fixture.bin().join("mysqldump"),
            &format!("#!/bin/sh\ncat '{}'\n", fixture.database().display()),
        );
        write_script(
            &fixture.bin().join("mysql"),
            &format!("#!/bin/sh\ncat > '{}'\n", fixture.database().display()),
        );

        fixture
    }

    fn write_occ(&self) {
        let script = format!(
            r#"#!/bin/sh
# $1 is --no-warnings
shift
cmd="$1"
shift
echo "$cmd $*" >> '{calls}'
case "$cmd" in
  maintenance:mode)
    case "$1" in
      --on) touch '{state}'; echo "Maintenance mode enabled" ;;
      --off) rm -f '{state}'; echo "Maintenance mode disabled" ;;
      *) if [ -e '{state}' ]; then echo "Maintenance mode is currently enabled"; else echo "Maintenance mode is currently disabled"; fi ;;
    esac ;;
  config:system:get)
    case "$1" in
      datadirectory) echo '{data}' ;;
      dbname) echo nextcloud ;;
      dbuser) echo nextcloud ;;
      dbpassword) echo secret ;;
      *) exit 1 ;;
    esac ;;
  status) echo '{{"installed":true,"versionstring":"29.0.4"}}' ;;
  update:check) if [ -e '{updates}' ]; then cat '{updates}'; else echo "Everything up to date"; fi ;;
  maintenance:data-fingerprint) echo "Updated data-fingerprint" ;;
  app:update|notification:generate) ;;
  *) echo "Command \"$cmd\" is not defined." >&2; exit 1 ;;
esac
"#,
            calls = self.calls_file().display(),
            state = self.path().join("maintenance").display(),
            data = self.data().display(),
            updates = self.updates_file().display(),
        );
        fs::write(self.document_root().join("occ"), script).unwrap();
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn document_root(&self) -> PathBuf {
        self.path().join("nextcloud")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.document_root().join("config")
    }

    pub fn data(&self) -> PathBuf {
        self.path().join("data")
    }

    pub fn database(&self) -> PathBuf {
        self.path().join("database.sql")
    }

    pub fn bin(&self) -> PathBuf {
        self.path().join("bin")
    }

    pub fn backups(&self) -> PathBuf {
        self.path().join("backups")
    }

    pub fn calls_file(&self) -> PathBuf {
        self.path().join("occ_calls")
    }

    pub fn updates_file(&self) -> PathBuf {
        self.path().join("update_check")
    }

    pub fn calls(&self) -> String {
        fs::read_to_string(self.calls_file()).unwrap_or_default()
    }

    pub fn maintenance_enabled(&self) -> bool {
        self.path().join("maintenance").exists()
    }

    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.nextcloud.document_root = self.document_root();
        settings.nextcloud.php = "sh".into();
        settings.nextcloud.run_as = None;
        settings.database.dump_command = self.bin().join("mysqldump").display().to_string();
        settings.database.client_command = self.bin().join("mysql").display().to_string();
        settings.backup.root = self.backups();
        settings.backup.copy_method = CopyMethod::Native;
        settings.backup.cleanup = false;
        settings.steps = StepPolicy {
            timeout_secs: Some(60),
            retries: 0,
            backoff_secs: 0,
        };
        settings
    }

    /// Writes `settings` as config file for the binary.
    pub fn write_config(&self, settings: &Settings) -> PathBuf {
        let path = self.path().join("config.toml");
        fs::write(&path, toml::to_string_pretty(settings).unwrap()).unwrap();
        path
    }
}

/// Contents of all files below `dir`, keyed by relative path.
pub fn tree(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut out: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .map(Result::unwrap)
        .filter(|entry| !entry.file_type().is_dir())
        .map(|entry| {
            let relative = entry.path().strip_prefix(dir).unwrap().to_path_buf();
            (relative, fs::read(entry.path()).unwrap())
        })
        .collect();
    out.sort();
    out
}
