//! Backup instances: naming convention and metadata.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDateTime;
use derive_more::{Display, Error, From};

/// Format of the timestamp embedded in backup names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// File recording [BackupMetadata] in every backup.
pub const METADATA_FILE: &str = "backup_metadata";

pub const DATABASE_DIR: &str = "database";
pub const DATA_DIR: &str = "data";
pub const CONFIG_DIR: &str = "config";
pub const APPS_DIR: &str = "apps";
pub const REDIS_DIR: &str = "redis";

/// Top-level entries every complete backup has.
pub const REQUIRED_ENTRIES: [&str; 3] = [DATABASE_DIR, DATA_DIR, CONFIG_DIR];

#[derive(
    Copy, Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Complete copy of data, config and apps.
    #[display("full")]
    Full,
    /// Unchanged files are hard links into the base backup.
    #[display("incremental")]
    Incremental,
}

impl BackupKind {
    /// Suffix of the backup name.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incr",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "full" => Some(Self::Full),
            "incr" => Some(Self::Incremental),
            _ => None,
        }
    }
}

/// Name of a backup: `<prefix>_<YYYYMMDD_HHMMSS>[_full|_incr]`.
///
/// Names order by timestamp first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupName {
    timestamp: NaiveDateTime,
    prefix: String,
    kind: Option<BackupKind>,
}

#[derive(Debug, Display, Error)]
#[display("Not a backup name: {_0}")]
pub struct InvalidBackupName(#[error(ignore)] String);

impl BackupName {
    pub fn new(prefix: &str, timestamp: NaiveDateTime, kind: BackupKind) -> Self {
        Self {
            timestamp,
            prefix: prefix.to_string(),
            kind: Some(kind),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    /// Kind encoded in the name, if it carries a suffix.
    pub fn kind(&self) -> Option<BackupKind> {
        self.kind
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.prefix, self.timestamp.format(TIMESTAMP_FORMAT))?;
        if let Some(kind) = self.kind {
            write!(f, "_{}", kind.suffix())?;
        }
        Ok(())
    }
}

impl FromStr for BackupName {
    type Err = InvalidBackupName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidBackupName(s.to_string());

        let (rest, kind) = match s.rsplit_once('_') {
            Some((rest, suffix)) => match BackupKind::from_suffix(suffix) {
                Some(kind) => (rest, Some(kind)),
                None => (s, None),
            },
            None => return Err(invalid()),
        };

        // <prefix>_<date>_<time>
        let mut parts = rest.rsplitn(3, '_');
        let time = parts.next().ok_or_else(invalid)?;
        let date = parts.next().ok_or_else(invalid)?;
        let prefix = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;

        let timestamp = NaiveDateTime::parse_from_str(&format!("{date}_{time}"), TIMESTAMP_FORMAT)
            .map_err(|_| invalid())?;

        Ok(Self {
            timestamp,
            prefix: prefix.to_string(),
            kind,
        })
    }
}

/// Content of the [METADATA_FILE].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackupMetadata {
    pub kind: BackupKind,

    /// Name of the backup this one hard-links against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    pub created: NaiveDateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nextcloud_version: Option<String>,
}

#[derive(Debug, Display, Error, From)]
pub enum MetadataError {
    #[display("Unable to access backup metadata: {_0}")]
    Io(io::Error),
    #[display("Backup metadata is malformed: {_0}")]
    Parse(toml::de::Error),
    #[display("Backup metadata can't be serialized: {_0}")]
    Serialize(toml::ser::Error),
}

impl BackupMetadata {
    /// Reads the metadata of the backup in `dir`, [None] if it has none.
    pub fn read(dir: &Path) -> Result<Option<Self>, MetadataError> {
        match fs::read_to_string(dir.join(METADATA_FILE)) {
            Ok(content) => Ok(Some(toml::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, dir: &Path) -> Result<(), MetadataError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(dir.join(METADATA_FILE), content)?;
        Ok(())
    }
}

#[derive(Debug, Display, Error, From)]
pub enum InstanceError {
    #[from]
    Name(InvalidBackupName),
    #[display("{}: {_1}", _0.display())]
    Metadata(PathBuf, #[error(source)] MetadataError),
}

/// A completed backup on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupInstance {
    path: PathBuf,
    name: BackupName,
    metadata: Option<BackupMetadata>,
}

impl BackupInstance {
    pub fn open(path: &Path) -> Result<Self, InstanceError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name: BackupName = file_name.parse()?;
        let metadata = BackupMetadata::read(path)
            .map_err(|e| InstanceError::Metadata(path.to_path_buf(), e))?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &BackupName {
        &self.name
    }

    pub fn metadata(&self) -> Option<&BackupMetadata> {
        self.metadata.as_ref()
    }

    /// Kind from the metadata, else from the name, else [`BackupKind::Full`].
    pub fn kind(&self) -> BackupKind {
        self.metadata
            .as_ref()
            .map(|meta| meta.kind)
            .or(self.name.kind)
            .unwrap_or(BackupKind::Full)
    }

    /// Name of the recorded base backup.
    pub fn base(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|meta| meta.base.as_deref())
    }

    /// Creation time, taken from the name.
    pub fn created(&self) -> NaiveDateTime {
        self.name.timestamp
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(3, 15, 0)
            .unwrap()
    }

    #[test]
    fn name_format() {
        let name = BackupName::new("nextcloud", ts(), BackupKind::Incremental);
        assert_eq!(name.to_string(), "nextcloud_20240229_031500_incr");
    }

    #[test]
    fn name_parse() {
        let name: BackupName = "nextcloud_20240229_031500_full".parse().unwrap();
        assert_eq!(name.prefix(), "nextcloud");
        assert_eq!(name.timestamp(), ts());
        assert_eq!(name.kind(), Some(BackupKind::Full));

        let name: BackupName = "my_cloud_20240229_031500".parse().unwrap();
        assert_eq!(name.prefix(), "my_cloud");
        assert_eq!(name.kind(), None);
        assert_eq!(name.to_string(), "my_cloud_20240229_031500");
    }

    #[test]
    fn invalid_names() {
        for name in [
            "latest",
            "nextcloud_full",
            "_20240229_031500_full",
            "nextcloud_20241399_031500_full",
            "nextcloud_20240229_031500_diff",
        ] {
            assert!(name.parse::<BackupName>().is_err(), "{name}");
        }
    }

    #[test]
    fn names_order_by_time() {
        let older: BackupName = "zzz_20240101_000000_full".parse().unwrap();
        let newer: BackupName = "aaa_20240102_000000_full".parse().unwrap();
        assert!(older < newer);
    }

    #[test]
    fn metadata_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(BackupMetadata::read(dir.path()).unwrap(), None);

        let meta = BackupMetadata {
            kind: BackupKind::Incremental,
            base: Some("nextcloud_20240228_031500_full".into()),
            created: ts(),
            nextcloud_version: None,
        };
        meta.write(dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        assert!(content.contains("kind = \"incremental\""));
        assert_eq!(BackupMetadata::read(dir.path()).unwrap(), Some(meta));
    }

    #[test]
    fn instance_kind_falls_back_to_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nextcloud_20240229_031500_incr");
        fs::create_dir(&path).unwrap();

        let instance = BackupInstance::open(&path).unwrap();
        assert_eq!(instance.kind(), BackupKind::Incremental);
        assert_eq!(instance.base(), None);
        assert_eq!(instance.created(), ts());
    }
}
