//! Notifications about finished runs.

use std::process::Command;
use std::time::Duration;

use crate::nextcloud::Occ;
use crate::util::command;

/// Receivers of notifications.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    /// Nextcloud account receiving a Nextcloud notification.
    pub nextcloud_user: Option<String>,

    /// URL receiving a JSON `POST`.
    pub webhook_url: Option<String>,

    /// Notify about successful runs as well, not only about failures.
    pub on_success: bool,
}

/// Body posted to the webhook.
pub fn webhook_payload(subject: &str, message: &str, success: bool) -> serde_json::Value {
    serde_json::json!({
        "source": "nc_guard",
        "success": success,
        "subject": subject,
        "message": message,
    })
}

/// Sends `message` to every configured receiver.
///
/// Failures are only logged, a notification never fails a run.
pub fn send(
    settings: &NotifySettings,
    occ: Option<&Occ>,
    success: bool,
    message: &str,
    timeout: Option<Duration>,
) {
    if success && !settings.on_success {
        return;
    }
    let subject = if success {
        "Nextcloud backup succeeded"
    } else {
        "Nextcloud backup failed"
    };

    if let Some(user) = &settings.nextcloud_user {
        match occ {
            Some(occ) => match occ.notify(user, subject, message) {
                Ok(()) => log::debug!(target: "notify", "Notified Nextcloud user {user}"),
                Err(e) => log::warn!(target: "notify", "Nextcloud notification failed: {e}"),
            },
            None => log::warn!(target: "notify", "Nextcloud unavailable, {user} not notified"),
        }
    }

    if let Some(url) = &settings.webhook_url {
        let payload = webhook_payload(subject, message, success).to_string();
        let mut curl = Command::new("curl");
        curl.args(["--fail", "--silent", "--show-error", "--request", "POST"])
            .args(["--header", "Content-Type: application/json"])
            .arg("--data")
            .arg(&payload)
            .arg(url);
        match command::run(&mut curl, timeout) {
            Ok(_) => log::debug!(target: "notify", "Posted notification to webhook"),
            Err(e) => log::warn!(target: "notify", "Webhook notification failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload() {
        let payload = webhook_payload("Nextcloud backup failed", "Step `database` failed", false);
        assert_eq!(payload["success"], false);
        assert_eq!(payload["message"], "Step `database` failed");
    }
}
