//! The configuration file.
//!
//! All settings are read once at startup into [Settings] and handed to the
//! actions. Every section and key is optional, missing values take their
//! defaults. Keys with a default value that can be switched off take `false`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use crate::actions::notify::NotifySettings;
use crate::backends::{CopyMethod, DatabaseSettings};
use crate::backup::RetentionSettings;
use crate::nextcloud::NextcloudSettings;
use crate::remote::RemoteSettings;
use crate::util::logging::LogSettings;
use crate::util::step::StepPolicy;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nc_guard/config.toml";

const DEFAULT_BACKUP_ROOT: &str = "/var/backups/nextcloud";

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Settings {
    pub nextcloud: NextcloudSettings,
    pub database: DatabaseSettings,
    pub backup: BackupSettings,
    pub retention: RetentionSettings,
    pub remote: Option<RemoteSettings>,
    pub notify: NotifySettings,
    pub steps: StepPolicy,
    pub log: LogSettings,
}

/// What a backup run contains and what happens after it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Directory holding the backups.
    pub root: PathBuf,

    /// Name prefix of the backups, must not contain `_`.
    pub prefix: String,

    pub copy_method: CopyMethod,

    /// Backup the custom apps directory.
    pub include_apps: bool,

    /// Redis dump file to include.
    pub redis_dump: Option<PathBuf>,

    /// Incremental backups on top of a full one before the next full backup.
    /// `false` never starts a new chain.
    #[serde(with = "or_false")]
    pub max_incrementals: Option<usize>,

    /// Replace `dbpassword` in the saved `config.php` with a placeholder.
    pub mask_dbpassword: bool,

    /// Create a `.tar.gz` archive of every new backup.
    pub archive: bool,

    /// Directory of the archives. Defaults to `<root>/archives`.
    pub archive_dir: Option<PathBuf>,

    /// Upload the archive to the remote storage.
    pub upload: bool,

    /// Apply the retention policy after a backup.
    pub cleanup: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            root: DEFAULT_BACKUP_ROOT.into(),
            prefix: "nextcloud".into(),
            copy_method: CopyMethod::default(),
            include_apps: true,
            redis_dump: None,
            max_incrementals: Some(6),
            mask_dbpassword: false,
            archive: false,
            archive_dir: None,
            upload: false,
            cleanup: true,
        }
    }
}

/// (De)serializes an [Option] whose default is [Some] with [None] as `false`.
///
/// TOML has no null and a missing key takes the default, so [None] wouldn't
/// survive a round trip otherwise.
pub(crate) mod or_false {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Setting<T> {
        Off(bool),
        Value(T),
    }

    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        match Setting::deserialize(deserializer)? {
            Setting::Value(value) => Ok(Some(value)),
            Setting::Off(false) => Ok(None),
            Setting::Off(true) => Err(de::Error::custom("expected a value or `false`")),
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum SettingsError {
    #[display("Reading the config file {} failed: {_1}", _0.display())]
    Io(PathBuf, #[error(source)] io::Error),
    #[display("Parsing the config file {} failed: {_1}", _0.display())]
    Parse(PathBuf, #[error(source)] toml::de::Error),
    #[display("Invalid configuration: {}", _0.join("; "))]
    Invalid(#[error(ignore)] Vec<String>),
}

impl Settings {
    /// Reads the settings from `path`.
    ///
    /// A missing file is created with the default settings, which are used.
    pub fn load_or_init(path: &Path) -> Result<Self, SettingsError> {
        match fs::read(path) {
            Ok(config_str) => toml::from_slice(&config_str)
                .map_err(|e| SettingsError::Parse(path.to_path_buf(), e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                let written = toml::to_string_pretty(&default_config)
                    .map_err(io::Error::other)
                    .and_then(|config_str| {
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(path, config_str)
                    });
                if let Err(e) = written {
                    log::warn!("Writing default config to {} failed {e}", path.display());
                }

                Ok(default_config)
            }
            Err(e) => Err(SettingsError::Io(path.to_path_buf(), e)),
        }
    }

    /// Checks values the types can't express, reporting all problems at once.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut problems = Vec::new();

        if !self.backup.root.is_absolute() {
            problems.push(format!(
                "backup.root must be absolute, got {}",
                self.backup.root.display()
            ));
        }
        if self.backup.prefix.is_empty() || self.backup.prefix.contains(['_', '/']) {
            problems.push(format!(
                "backup.prefix must be non-empty without `_` or `/`, got {:?}",
                self.backup.prefix
            ));
        }
        if self.retention.keep_chains == 0 {
            problems.push("retention.keep_chains must be at least 1".into());
        }
        if !self.nextcloud.document_root.is_absolute() {
            problems.push(format!(
                "nextcloud.document_root must be absolute, got {}",
                self.nextcloud.document_root.display()
            ));
        }
        if self.database.dump_command.is_empty() || self.database.client_command.is_empty() {
            problems.push("database.dump_command and database.client_command must be set".into());
        }
        match &self.remote {
            Some(remote) => {
                if remote.bucket.trim().is_empty() {
                    problems.push("remote.bucket must be set".into());
                }
                if remote.keep == Some(0) {
                    problems.push("remote.keep must be at least 1".into());
                }
            }
            None if self.backup.upload => {
                problems.push("backup.upload requires a [remote] section".into());
            }
            None => {}
        }
        if self.backup.upload && !self.backup.archive {
            problems.push("backup.upload requires backup.archive".into());
        }
        if self.steps.timeout_secs == Some(0) {
            problems.push("steps.timeout_secs must be at least 1".into());
        }
        if let Some(url) = &self.notify.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                problems.push(format!("notify.webhook_url must be a http(s) URL, got {url}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(problems))
        }
    }

    /// Directory of the archives.
    pub fn archive_dir(&self) -> PathBuf {
        self.backup
            .archive_dir
            .clone()
            .unwrap_or_else(|| self.backup.root.join("archives"))
    }

    /// Directory of the log files.
    pub fn log_directory(&self) -> PathBuf {
        self.log
            .directory
            .clone()
            .unwrap_or_else(|| self.backup.root.join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_written_and_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/config.toml");

        let settings = Settings::load_or_init(&path).unwrap();
        assert!(path.is_file());
        settings.validate().unwrap();

        let reread = Settings::load_or_init(&path).unwrap();
        assert_eq!(reread.backup.prefix, "nextcloud");
        assert_eq!(reread.retention, settings.retention);
        assert_eq!(reread.steps, settings.steps);
    }

    #[test]
    fn partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[backup]
root = "/srv/backup"
copy_method = "native"

[retention]
keep_chains = 10

[retention.calendar]
monthly = 12

[remote]
bucket = "nc-backups"
endpoint = "https://example.r2.cloudflarestorage.com"
"#,
        )
        .unwrap();

        let settings = Settings::load_or_init(&path).unwrap();
        assert_eq!(settings.backup.root, PathBuf::from("/srv/backup"));
        assert_eq!(settings.backup.copy_method, CopyMethod::Native);
        assert!(settings.backup.include_apps);
        assert_eq!(settings.retention.keep_chains, 10);
        assert_eq!(settings.retention.keep_all_days, 7);
        assert_eq!(settings.retention.calendar.as_ref().unwrap().monthly, Some(12));
        assert_eq!(settings.remote.as_ref().unwrap().aws_command, "aws");
        assert_eq!(settings.log_directory(), PathBuf::from("/srv/backup/logs"));
    }

    #[test]
    fn disabled_values_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut settings = Settings::default();
        settings.nextcloud.run_as = None;
        settings.steps.timeout_secs = None;
        settings.backup.max_incrementals = None;
        fs::write(&path, toml::to_string_pretty(&settings).unwrap()).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("run_as = false"), "{written}");

        let reread = Settings::load_or_init(&path).unwrap();
        assert_eq!(reread.nextcloud.run_as, None);
        assert_eq!(reread.steps.timeout_secs, None);
        assert_eq!(reread.backup.max_incrementals, None);

        settings.nextcloud.run_as = Some("nginx".into());
        fs::write(&path, toml::to_string_pretty(&settings).unwrap()).unwrap();
        let reread = Settings::load_or_init(&path).unwrap();
        assert_eq!(reread.nextcloud.run_as.as_deref(), Some("nginx"));
        assert_eq!(reread.backup.max_incrementals, None);
    }

    #[test]
    fn switched_off_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[nextcloud]\nrun_as = false\n\n[backup]\nmax_incrementals = 3\n",
        )
        .unwrap();

        let settings = Settings::load_or_init(&path).unwrap();
        assert_eq!(settings.nextcloud.run_as, None);
        assert_eq!(settings.backup.max_incrementals, Some(3));
        assert_eq!(settings.steps.timeout_secs, Some(6 * 60 * 60));

        fs::write(&path, "[nextcloud]\nrun_as = true\n").unwrap();
        let err = Settings::load_or_init(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse(..)), "{err}");
    }

    #[test]
    fn parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[backup]\nroot = 5\n").unwrap();

        let err = Settings::load_or_init(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse(..)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn all_problems_are_reported() {
        let mut settings = Settings::default();
        settings.backup.root = "relative".into();
        settings.backup.prefix = "next_cloud".into();
        settings.retention.keep_chains = 0;
        settings.backup.upload = true;
        settings.remote = Some(RemoteSettings::default());

        let Err(SettingsError::Invalid(problems)) = settings.validate() else {
            panic!("settings should be invalid");
        };
        assert_eq!(problems.len(), 5, "{problems:?}");
    }
}
