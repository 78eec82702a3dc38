//! Upload of archives to S3 compatible object storage through the `aws` CLI.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use chrono::NaiveDateTime;
use derive_more::{Display, Error, From};

use crate::archive::{self, ARCHIVE_SUFFIX, CHECKSUM_SUFFIX};
use crate::backup::BackupName;
use crate::util::command::{self, CommandError};

/// Bucket and credentials of the remote storage.
///
/// Credentials left unset are taken from the environment or the profile of
/// the `aws` CLI.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub bucket: String,
    /// Key prefix inside the bucket.
    pub prefix: String,
    /// Endpoint of non-AWS providers, e.g. Cloudflare R2.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub aws_command: String,
    /// Number of archives kept in the bucket, all if unset.
    pub keep: Option<usize>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: "nextcloud".into(),
            endpoint: None,
            region: None,
            access_key_id: None,
            secret_access_key: None,
            aws_command: "aws".into(),
            keep: None,
        }
    }
}

#[derive(Debug, Display, Error, From)]
pub enum RemoteError {
    #[display("aws s3 failed: {_0}")]
    #[from]
    Command(CommandError),
    #[display("Unable to hash archive: {_0}")]
    #[from]
    Io(std::io::Error),
    #[display("Not an archive: {}", _0.display())]
    NotAnArchive(#[error(ignore)] std::path::PathBuf),
}

/// An object listed in the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub modified: NaiveDateTime,
    pub size: u64,
    /// Key relative to the configured prefix.
    pub key: String,
}

/// Parses the output of `aws s3 ls`, skipping common prefixes (`PRE`).
pub fn parse_listing(listing: &str) -> Vec<RemoteObject> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let date = fields.next()?;
            let time = fields.next()?;
            let size = fields.next()?.parse().ok()?;
            let key = fields.collect::<Vec<_>>().join(" ");
            if key.is_empty() {
                return None;
            }
            let modified =
                NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").ok()?;
            Some(RemoteObject {
                modified,
                size,
                key,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct S3Remote {
    settings: RemoteSettings,
    timeout: Option<Duration>,
}

impl S3Remote {
    pub fn new(settings: RemoteSettings, timeout: Option<Duration>) -> Self {
        Self { settings, timeout }
    }

    pub fn program(&self) -> &str {
        &self.settings.aws_command
    }

    /// `s3://<bucket>/<prefix>/<key>`
    pub fn url(&self, key: &str) -> String {
        let prefix = self.settings.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("s3://{}/{key}", self.settings.bucket)
        } else {
            format!("s3://{}/{prefix}/{key}", self.settings.bucket)
        }
    }

    fn aws(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.settings.aws_command);
        cmd.arg("s3").args(args);
        if let Some(endpoint) = &self.settings.endpoint {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        if let Some(region) = &self.settings.region {
            cmd.env("AWS_DEFAULT_REGION", region);
        }
        if let Some(key_id) = &self.settings.access_key_id {
            cmd.env("AWS_ACCESS_KEY_ID", key_id);
        }
        if let Some(secret) = &self.settings.secret_access_key {
            cmd.env("AWS_SECRET_ACCESS_KEY", secret);
        }
        cmd
    }

    fn copy(&self, file: &Path, key: &str, dry_run: bool) -> Result<(), RemoteError> {
        let url = self.url(key);
        if dry_run {
            log::info!(target: "remote", "Would upload {} to {url}", file.display());
            return Ok(());
        }
        let source = file.to_string_lossy();
        let mut cmd = self.aws(&["cp", "--only-show-errors", &source, &url]);
        command::run(&mut cmd, self.timeout)?;
        log::info!(target: "remote", "Uploaded {} to {url}", file.display());
        Ok(())
    }

    /// Uploads `archive`, then its checksum file.
    ///
    /// A missing checksum file is computed first.
    pub fn upload(&self, archive: &Path, dry_run: bool) -> Result<(), RemoteError> {
        let file_name = archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| name.ends_with(ARCHIVE_SUFFIX))
            .ok_or_else(|| RemoteError::NotAnArchive(archive.to_path_buf()))?;

        let checksum = archive::checksum_path(archive);
        if !checksum.is_file() && !dry_run {
            let sum = archive::sha256_file(archive)?;
            std::fs::write(&checksum, format!("{sum}  {file_name}\n"))?;
        }

        self.copy(archive, &file_name, dry_run)?;
        self.copy(&checksum, &format!("{file_name}{CHECKSUM_SUFFIX}"), dry_run)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), RemoteError> {
        let url = self.url(key);
        command::run(&mut self.aws(&["rm", "--only-show-errors", &url]), self.timeout)?;
        Ok(())
    }

    /// Objects below the configured prefix.
    pub fn list(&self) -> Result<Vec<RemoteObject>, RemoteError> {
        let mut cmd = self.aws(&["ls", &self.url("")]);
        let output = command::run(&mut cmd, self.timeout)?;
        Ok(parse_listing(&output.stdout))
    }

    /// Deletes all but the newest `keep` archives with their checksum files.
    ///
    /// Returns the keys of the removed archives.
    pub fn prune(&self, keep: usize, dry_run: bool) -> Result<Vec<String>, RemoteError> {
        let objects = self.list()?;
        let mut archives: Vec<_> = objects
            .iter()
            .filter(|object| object.key.ends_with(ARCHIVE_SUFFIX))
            .collect();
        // newest first, by the time in the name where possible
        archives.sort_by_key(|object| {
            let created = object
                .key
                .strip_suffix(ARCHIVE_SUFFIX)
                .and_then(|name| name.parse::<BackupName>().ok())
                .map(|name| name.timestamp())
                .unwrap_or(object.modified);
            std::cmp::Reverse(created)
        });

        let mut removed = Vec::new();
        for object in archives.into_iter().skip(keep) {
            let checksum = format!("{}{CHECKSUM_SUFFIX}", object.key);
            if dry_run {
                log::info!(target: "remote", "Would remove {}", self.url(&object.key));
            } else {
                self.remove(&object.key)?;
                if objects.iter().any(|other| other.key == checksum) {
                    self.remove(&checksum)?;
                }
                log::info!(target: "remote", "Removed {}", self.url(&object.key));
            }
            removed.push(object.key.clone());
        }

        Ok(removed)
    }
}
