//! The Nextcloud installation being backed up.

mod occ;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

pub use occ::{MaintenanceGuard, Occ, OccError};

const DEFAULT_DOCUMENT_ROOT: &str = "/var/www/nextcloud";

/// Location of the Nextcloud installation and how to reach `occ`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NextcloudSettings {
    /// Root directory of the Nextcloud server instance.
    pub document_root: PathBuf,

    /// PHP interpreter running `occ`.
    pub php: String,

    /// Run `occ` as this user through `sudo -u`, usually the web server user.
    ///
    /// `occ` refuses to run as any other user than the owner of `config.php`.
    /// `false` runs it as the current user.
    #[serde(with = "crate::settings::or_false")]
    pub run_as: Option<String>,

    /// Data directory. Asked from `occ` if unset.
    pub data_directory: Option<PathBuf>,

    /// Directory of custom apps, relative to the document root.
    pub apps_dir: PathBuf,
}

impl Default for NextcloudSettings {
    fn default() -> Self {
        Self {
            document_root: DEFAULT_DOCUMENT_ROOT.into(),
            php: "php".into(),
            run_as: Some("www-data".into()),
            data_directory: None,
            apps_dir: "custom_apps".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Nextcloud {
    occ: Occ,
    document_root: PathBuf,
    data_directory: Option<PathBuf>,
    apps_dir: PathBuf,
}

impl Nextcloud {
    pub fn new(settings: &NextcloudSettings, timeout: Option<Duration>) -> Result<Nextcloud, OccError> {
        let document_root = settings.document_root.clone();
        let occ = Occ::new(
            document_root.join("occ"),
            &settings.php,
            settings.run_as.as_deref(),
            timeout,
        )?;

        Ok(Self {
            occ,
            document_root,
            data_directory: settings.data_directory.clone(),
            apps_dir: settings.apps_dir.clone(),
        })
    }

    pub fn occ(&self) -> &Occ {
        &self.occ
    }

    pub fn document_root(&self) -> &Path {
        self.document_root.as_path()
    }

    /// Directory holding `config.php`.
    pub fn config_dir(&self) -> PathBuf {
        self.document_root().join("config")
    }

    pub fn config(&self) -> PathBuf {
        self.config_dir().join("config.php")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.document_root().join(&self.apps_dir)
    }

    /// The configured data directory or the one `occ` reports.
    pub fn data_directory(&self) -> Result<PathBuf, OccError> {
        match &self.data_directory {
            Some(dir) => Ok(dir.clone()),
            None => self.occ.data_directory(),
        }
    }
}
