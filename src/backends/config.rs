//! Implements backup of Nextcloud's config directory using [Config].

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::time::Duration;

use derive_more::{Display, Error, From};
use regex::{NoExpand, Regex};

use super::files::remove_leftover;
use super::{Backup, Destination, Restore};
use crate::backup::instance::CONFIG_DIR;
use crate::nextcloud::{Nextcloud, OccError};
use crate::util::linktree;

const CONFIG_FILE: &str = "config.php";
const PASSWORD_MASK: &str = "'DBPASSWORD'";

#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("Copying the Nextcloud config failed: {_0}")]
    #[from]
    Io(io::Error),
    /// The live database password couldn't be read for a masked backup.
    #[from]
    Occ(OccError),
    #[from]
    Regex(regex::Error),
}

/// The [Config] backend copies Nextcloud's config directory.
///
/// With masking enabled the `dbpassword` in `config.php` is replaced by a
/// placeholder; on restore the password of the live installation is put back.
#[derive(Debug, Clone)]
pub struct Config {
    mask_dbpassword: bool,
}

impl Config {
    pub fn new(mask_dbpassword: bool) -> Self {
        Self { mask_dbpassword }
    }
}

fn password_line() -> Result<Regex, regex::Error> {
    Regex::new(r"('dbpassword'\s*=>\s*).*,")
}

/// Copies `config.php` line by line, masking the first `dbpassword` entry.
fn write_masked(src: &Path, dst: &Path) -> Result<bool, ConfigError> {
    // Mask dbpassword, since we don't need it when restoring.
    // https://github.com/nextcloud-snap/nextcloud-snap/blob/43ef350cff3d63a40e7868c408e792b5b0023375/src/import-export/bin/export-data#L64-L66
    let re = password_line()?;
    let reader = BufReader::new(File::open(src)?);
    let mut writer = io::BufWriter::new(File::create(dst)?);

    let mut replaced = false;
    for line in reader.lines() {
        let line = line?;
        let processed_line = if !replaced && re.is_match(&line) {
            replaced = true;
            log::trace!(target: "backend::config", "Masked dbpassword");
            re.replace(&line, format!("${{1}}{PASSWORD_MASK},")).into_owned()
        } else {
            line
        };
        writeln!(writer, "{processed_line}")?;
    }
    writer.flush()?;

    Ok(replaced)
}

/// Replaces a masked `dbpassword` in `config` with `password`.
fn unmask(config: &str, password: &str) -> Result<Option<String>, regex::Error> {
    let re = Regex::new(r"('dbpassword'\s*=>\s*)'DBPASSWORD',")?;
    let Some(captures) = re.captures(config) else {
        return Ok(None);
    };
    let escaped = password.replace('\\', "\\\\").replace('\'', "\\'");
    let line = format!("{}'{escaped}',", &captures[1]);

    Ok(Some(re.replace(config, NoExpand(&line)).into_owned()))
}

impl Backup for Config {
    type Error = ConfigError;

    fn name(&self) -> &'static str {
        "config"
    }

    fn backup(
        &self,
        nextcloud: &Nextcloud,
        dest: &Destination<'_>,
        dry_run: bool,
    ) -> Result<(), Self::Error> {
        let config_dir = nextcloud.config_dir();
        log::info!(target: "backend::config", "Create backup of Nextcloud config: {}", config_dir.display());

        if dry_run {
            File::open(nextcloud.config())?;
            log::debug!(target: "backend::config", "Nextcloud config is readable");
            return Ok(());
        }

        let target = dest.root.join(CONFIG_DIR);
        remove_leftover(&target)?;
        linktree::snapshot(&config_dir, &target, None)?;

        if self.mask_dbpassword {
            let masked = target.join(CONFIG_FILE);
            if !write_masked(&nextcloud.config(), &masked)? {
                log::warn!(target: "backend::config", "No dbpassword config entry found and masked!");
            }
        }
        log::info!(target: "backend::config", "Finished backup of Nextcloud config");

        Ok(())
    }
}

impl Restore for Config {
    fn restore(
        &self,
        nextcloud: &Nextcloud,
        source: &Path,
        _timeout: Option<Duration>,
    ) -> Result<(), Self::Error> {
        let source = source.join(CONFIG_DIR);
        let config_dir = nextcloud.config_dir();
        log::info!(target: "backend::config", "Restore Nextcloud config to {}", config_dir.display());

        let backup_config = fs::read_to_string(source.join(CONFIG_FILE))?;
        let restored_config = if backup_config.contains(PASSWORD_MASK) {
            // read before the live config.php is replaced
            let password = nextcloud.occ().db_password()?.unwrap_or_default();
            match unmask(&backup_config, &password)? {
                Some(config) => {
                    log::debug!(target: "backend::config", "Re-inserted dbpassword of the live installation");
                    config
                }
                None => backup_config,
            }
        } else {
            backup_config
        };

        fs::create_dir_all(&config_dir)?;
        for entry in fs::read_dir(&source)? {
            let entry = entry?;
            if entry.file_name() == CONFIG_FILE {
                continue;
            }
            let target = config_dir.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                linktree::snapshot(&entry.path(), &target, None)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        fs::write(config_dir.join(CONFIG_FILE), restored_config)?;
        log::info!(target: "backend::config", "Finished restore of Nextcloud config");

        Ok(())
    }
}
