use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::util::command::{self, CommandError};

/// Errors on interaction with the `occ` command.
#[derive(Debug, Display, Error, From)]
pub enum OccError {
    /// The occ php file doesn't exist.
    #[display("occ not found at {}", _0.display())]
    NotFound(#[error(ignore)] PathBuf),
    /// Running the occ command failed.
    #[display("occ command failed: {_0}")]
    #[from]
    Command(CommandError),
    /// Nextcloud didn't end up in the expected state.
    #[display("occ {command}: {message}")]
    UnexpectedState { command: String, message: String },
    /// Output of the occ command couldn't be parsed.
    #[display("Unable to parse occ output: {_0}")]
    #[from]
    Json(serde_json::Error),
}

/// Interaction with the Nextcloud instance using the [`occ` command].
///
/// [`occ` command]: https://docs.nextcloud.com/server/latest/admin_manual/occ_command.html
#[derive(Debug, Clone)]
pub struct Occ {
    /// Path to the occ php file.
    occ: PathBuf,
    /// PHP interpreter.
    php: String,
    /// User to run occ as through `sudo -u`.
    run_as: Option<String>,
    timeout: Option<Duration>,
}

impl Occ {
    pub fn new(
        occ_path: PathBuf,
        php: &str,
        run_as: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Self, OccError> {
        if !occ_path.is_file() {
            return Err(OccError::NotFound(occ_path));
        }

        Ok(Self {
            occ: occ_path,
            php: php.to_string(),
            run_as: run_as.map(str::to_string),
            timeout,
        })
    }

    pub fn occ_path(&self) -> &Path {
        &self.occ
    }

    /// Programs needed to run occ.
    pub fn required_programs(&self) -> Vec<&str> {
        let mut programs = vec![self.php.as_str()];
        if self.run_as.is_some() {
            programs.push("sudo");
        }
        programs
    }
}

impl Occ {
    fn execute_command(&self, command: &str, args: &[&str]) -> Result<String, OccError> {
        let mut cmd = match &self.run_as {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-u").arg(user).arg(&self.php);
                cmd
            }
            None => Command::new(&self.php),
        };
        cmd.arg(self.occ.as_path())
            .arg("--no-warnings") //suppress maintenance mode is enabled warning
            .arg(command)
            .args(args);

        let output = command::run(&mut cmd, self.timeout)?;

        // relay stderr
        if !output.stderr.trim().is_empty() {
            log::warn!(target: "nextcloud::occ", "{}", output.stderr.trim_end());
        }

        Ok(output.stdout.trim_end().into())
    }

    pub fn maintenance(&self) -> Result<bool, OccError> {
        let msg = self.execute_command("maintenance:mode", &[])?;
        Ok(msg.contains("currently enabled"))
    }

    pub fn enable_maintenance(&self) -> Result<(), OccError> {
        self.execute_command("maintenance:mode", &["--on"])?;

        if !self.maintenance()? {
            return Err(OccError::UnexpectedState {
                command: "maintenance:mode --on".into(),
                message: "maintenance mode is still disabled".into(),
            });
        }
        log::debug!(target: "nextcloud::occ", "Maintenance Mode enabled.");
        Ok(())
    }

    pub fn disable_maintenance(&self) -> Result<(), OccError> {
        self.execute_command("maintenance:mode", &["--off"])?;

        if self.maintenance()? {
            return Err(OccError::UnexpectedState {
                command: "maintenance:mode --off".into(),
                message: "maintenance mode is still enabled".into(),
            });
        }
        log::debug!(target: "nextcloud::occ", "Maintenance Mode disabled.");
        Ok(())
    }

    /// Value of a key in the system config, [None] if it isn't set.
    pub fn system_value(&self, key: &str) -> Result<Option<String>, OccError> {
        match self.execute_command("config:system:get", &[key]) {
            Ok(value) => Ok(Some(value)),
            // occ exits with 1 for unset keys
            Err(OccError::Command(CommandError::Failed { status, .. })) if status.code() == Some(1) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn required_system_value(&self, key: &str) -> Result<String, OccError> {
        self.system_value(key)?
            .ok_or_else(|| OccError::UnexpectedState {
                command: format!("config:system:get {key}"),
                message: "key is not set".into(),
            })
    }

    pub fn data_directory(&self) -> Result<PathBuf, OccError> {
        let data_directory: PathBuf = self.required_system_value("datadirectory")?.into();
        if !data_directory.is_dir() {
            return Err(OccError::UnexpectedState {
                command: "config:system:get datadirectory".into(),
                message: format!("{} is not an accessible directory", data_directory.display()),
            });
        }

        Ok(data_directory)
    }

    pub fn db_name(&self) -> Result<String, OccError> {
        self.required_system_value("dbname")
    }

    pub fn db_user(&self) -> Result<String, OccError> {
        self.required_system_value("dbuser")
    }

    pub fn db_password(&self) -> Result<Option<String>, OccError> {
        self.system_value("dbpassword")
    }

    pub fn db_host(&self) -> Result<Option<String>, OccError> {
        self.system_value("dbhost")
    }

    /// Result of `occ status`.
    pub fn status(&self) -> Result<serde_json::Value, OccError> {
        let status = self.execute_command("status", &["--output=json"])?;
        Ok(serde_json::from_str(&status)?)
    }

    /// Human readable version, e.g. `29.0.4`.
    pub fn version(&self) -> Result<Option<String>, OccError> {
        let status = self.status()?;
        Ok(status
            .get("versionstring")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string))
    }

    /// Raw output of `occ update:check`.
    pub fn update_check(&self) -> Result<String, OccError> {
        self.execute_command("update:check", &[])
    }

    pub fn update_apps(&self, show_only: bool) -> Result<(), OccError> {
        let opts = if show_only {
            ["--showonly"]
        } else {
            ["--all"]
        };

        let update_log = self.execute_command("app:update", &opts)?;
        for line in update_log.lines() {
            log::info!(target: "nextcloud::occ", "Update Apps: {line}");
        }
        Ok(())
    }

    /// Updates the data fingerprint so clients notice restored files.
    pub fn data_fingerprint(&self) -> Result<(), OccError> {
        self.execute_command("maintenance:data-fingerprint", &[])?;
        Ok(())
    }

    pub fn notify(&self, user: &str, subject: &str, message: &str) -> Result<(), OccError> {
        self.execute_command("notification:generate", &[user, subject, "-l", message])?;
        Ok(())
    }
}

/// Maintenance mode held for the lifetime of the guard.
///
/// Maintenance is disabled again when the guard is dropped, also on early
/// returns and errors. If maintenance was already enabled before, it stays
/// enabled.
#[derive(Debug)]
pub struct MaintenanceGuard<'a> {
    occ: &'a Occ,
    was_enabled: bool,
}

impl<'a> MaintenanceGuard<'a> {
    pub fn enable(occ: &'a Occ) -> Result<Self, OccError> {
        let was_enabled = occ.maintenance()?;
        if was_enabled {
            log::warn!(target: "nextcloud::occ", "Maintenance mode was already enabled, leaving it enabled afterwards");
        } else {
            occ.enable_maintenance()?;
        }
        log::info!(target: "nextcloud::occ", "Nextcloud is in maintenance mode");

        Ok(Self { occ, was_enabled })
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            return;
        }
        match self.occ.disable_maintenance() {
            Ok(()) => log::info!(target: "nextcloud::occ", "Nextcloud left maintenance mode"),
            Err(e) => log::error!(
                target: "nextcloud::occ",
                "Disabling maintenance mode failed, disable it manually: {e}"
            ),
        }
    }
}
