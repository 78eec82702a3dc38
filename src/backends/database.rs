//! Implements backup of the Nextcloud database using [Database].

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use derive_more::{Display, Error, From};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::{Backup, Destination, Restore};
use crate::backup::instance::DATABASE_DIR;
use crate::nextcloud::{Nextcloud, Occ, OccError};
use crate::util::command::{self, CommandError};

/// Database connection and the tools used to dump and load it.
///
/// Connection values left unset are read from Nextcloud's `config.php`
/// through `occ`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Dump tool, `mysqldump` or `mariadb-dump`.
    pub dump_command: String,

    /// Client used on restore, `mysql` or `mariadb`.
    pub client_command: String,

    /// Host, optionally with `:port` or `:/path/to/socket`.
    pub host: Option<String>,

    pub name: Option<String>,

    pub user: Option<String>,

    pub password: Option<String>,

    /// Prefix of Nextcloud's tables, used to verify dumps.
    pub table_prefix: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            dump_command: "mysqldump".into(),
            client_command: "mysql".into(),
            host: None,
            name: None,
            user: None,
            password: None,
            table_prefix: "oc_".into(),
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on backup and restore of the database.
pub enum DatabaseError {
    /// Reading the database connection from Nextcloud failed.
    #[from]
    Occ(OccError),
    #[display("Dump file couldn't be written or read: {_0}")]
    #[from]
    Io(io::Error),
    #[display("Database tool failed: {_0}")]
    #[from]
    Command(CommandError),
    /// The backup contains no database dump.
    #[display("No database dump found in {}", _0.display())]
    MissingDump(#[error(ignore)] PathBuf),
}

#[derive(Debug, Clone)]
struct Credentials {
    host: Option<String>,
    name: String,
    user: String,
    password: Option<String>,
}

impl DatabaseSettings {
    fn credentials(&self, occ: &Occ) -> Result<Credentials, OccError> {
        let host = match &self.host {
            Some(host) => Some(host.clone()),
            None => occ.db_host()?,
        };
        let name = match &self.name {
            Some(name) => name.clone(),
            None => occ.db_name()?,
        };
        let user = match &self.user {
            Some(user) => user.clone(),
            None => occ.db_user()?,
        };
        let password = match &self.password {
            Some(password) => Some(password.clone()),
            None => occ.db_password()?,
        };

        Ok(Credentials {
            host,
            name,
            user,
            password,
        })
    }
}

impl Credentials {
    /// Adds connection options; the password goes through `MYSQL_PWD` so it
    /// doesn't show up in the process list.
    fn apply(&self, cmd: &mut Command) {
        if let Some(host) = self.host.as_deref().filter(|host| !host.is_empty()) {
            match host.split_once(':') {
                Some((host, socket)) if socket.starts_with('/') => {
                    cmd.arg(format!("--host={host}"))
                        .arg(format!("--socket={socket}"));
                }
                Some((host, port)) if port.parse::<u16>().is_ok() => {
                    cmd.arg(format!("--host={host}")).arg(format!("--port={port}"));
                }
                _ => {
                    cmd.arg(format!("--host={host}"));
                }
            }
        }
        cmd.arg(format!("--user={}", self.user));
        if let Some(password) = &self.password {
            cmd.env("MYSQL_PWD", password);
        }
    }
}

/// The [Database] backend stores a gzip compressed logical dump.
///
/// The dump is always complete, also for incremental backups.
#[derive(Debug, Clone)]
pub struct Database {
    settings: DatabaseSettings,
}

impl Database {
    pub fn with_config(settings: DatabaseSettings) -> Self {
        Self { settings }
    }

    /// The dump file in the backup directory `dir`, [None] if there is none.
    pub fn find_dump(dir: &Path) -> io::Result<Option<PathBuf>> {
        let entries = match fs::read_dir(dir.join(DATABASE_DIR)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut dumps = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let name = path.to_string_lossy();
            if name.ends_with(".sql.gz") || name.ends_with(".sql") {
                dumps.push(path);
            }
        }
        dumps.sort();
        Ok(dumps.into_iter().next())
    }
}

impl Backup for Database {
    type Error = DatabaseError;

    fn name(&self) -> &'static str {
        "database"
    }

    fn backup(
        &self,
        nextcloud: &Nextcloud,
        dest: &Destination<'_>,
        dry_run: bool,
    ) -> Result<(), Self::Error> {
        let credentials = self.settings.credentials(nextcloud.occ())?;
        log::info!(target: "backend::database", "Create database dump of the Nextcloud database: {}", credentials.name);
        log::trace!(target: "backend::database", "Using dbuser '{}' for backup", credentials.user);

        let dump_dir = dest.root.join(DATABASE_DIR);
        let dump_file = dump_dir.join(format!("{}.sql.gz", credentials.name));
        log::debug!(target: "backend::database", "Save Nextcloud database dump at: {}", dump_file.display());

        let mut dump = Command::new(&self.settings.dump_command);
        dump.arg("--opt") // sensible dump defaults
            .arg("--single-transaction");
        credentials.apply(&mut dump);
        dump.arg(&credentials.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped());

        let output = if dry_run {
            None
        } else {
            fs::create_dir_all(&dump_dir)?;
            // truncates the leftover of a failed attempt
            Some(File::create(&dump_file)?)
        };

        // compress and capture stdout of the dump
        let written = command::stream(&mut dump, dest.timeout, |pipes| {
            let stdout = pipes
                .stdout
                .ok_or_else(|| io::Error::other("stdout of dump is not captured"))?;
            let mut reader = BufReader::new(stdout);
            match output {
                None => {
                    log::trace!(target: "backend::database", "Discarding output of the dump on dry-run");
                    io::copy(&mut reader, &mut io::sink())
                }
                Some(file) => {
                    let mut encoder = GzEncoder::new(file, Compression::default());
                    let written = io::copy(&mut reader, &mut encoder)?;
                    encoder.finish()?.sync_all()?;
                    Ok(written)
                }
            }
        })?;

        log::info!(target: "backend::database", "Finished Nextcloud database dump ({written} bytes uncompressed).");
        Ok(())
    }
}

impl Restore for Database {
    fn restore(
        &self,
        nextcloud: &Nextcloud,
        source: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), Self::Error> {
        let dump_file = Self::find_dump(source)?
            .ok_or_else(|| DatabaseError::MissingDump(source.to_path_buf()))?;
        let credentials = self.settings.credentials(nextcloud.occ())?;
        log::info!(
            target: "backend::database",
            "Restore database {} from {}",
            credentials.name,
            dump_file.display()
        );

        let mut client = Command::new(&self.settings.client_command);
        credentials.apply(&mut client);
        client
            .arg(&credentials.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null());

        let compressed = dump_file.to_string_lossy().ends_with(".gz");
        let file = BufReader::new(File::open(&dump_file)?);
        command::stream(&mut client, timeout, |pipes| {
            let mut stdin = pipes
                .stdin
                .ok_or_else(|| io::Error::other("stdin of client is not captured"))?;
            if compressed {
                io::copy(&mut GzDecoder::new(file), &mut stdin)?;
            } else {
                io::copy(&mut { file }, &mut stdin)?;
            }
            Ok(())
        })?;

        log::info!(target: "backend::database", "Finished restore of the Nextcloud database.");
        Ok(())
    }
}
