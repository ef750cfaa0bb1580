//! Notification sinks for backup outcomes.
//!
//! Sinks are strictly fire-and-forget: the pipeline calls
//! [`notify_outcome`] after storage dispatch and every failure here is
//! swallowed into a warning. Supported sinks are generic JSON webhooks,
//! Slack incoming webhooks, and Discord webhooks.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use pmxpack_types::{BackupStats, Reporter};

/// Webhook flavor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookKind {
    /// Plain JSON POST
    #[default]
    Generic,
    /// Slack incoming webhook
    Slack,
    /// Discord webhook
    Discord,
}

impl std::str::FromStr for WebhookKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(WebhookKind::Generic),
            "slack" => Ok(WebhookKind::Slack),
            "discord" => Ok(WebhookKind::Discord),
            _ => anyhow::bail!("unknown webhook type: {}", s),
        }
    }
}

/// Webhook sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub kind: WebhookKind,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

/// Notification content distilled from the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub message: String,
    pub success: bool,
    pub hostname: String,
    pub host_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    pub archive_size: u64,
    pub duration_secs: u64,
    pub has_warnings: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotifyPayload {
    /// Build a payload from the final pipeline stats.
    pub fn from_stats(stats: &BackupStats, error: Option<String>) -> Self {
        let success = error.is_none();
        let message = if success {
            format!(
                "backup of {} finished: {} bytes in {}s",
                stats.hostname, stats.archive_size, stats.duration_secs
            )
        } else {
            format!("backup of {} FAILED", stats.hostname)
        };
        Self {
            message,
            success,
            hostname: stats.hostname.clone(),
            host_type: stats.proxmox_type.to_string(),
            archive: stats
                .archive_path
                .as_ref()
                .map(|p| p.display().to_string()),
            archive_size: stats.archive_size,
            duration_secs: stats.duration_secs,
            has_warnings: stats.has_warnings,
            error,
        }
    }
}

/// Send the payload to one webhook sink.
pub fn send_webhook(config: &WebhookConfig, payload: &NotifyPayload) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("failed to create HTTP client")?;

    let body = match config.kind {
        WebhookKind::Generic => serde_json::to_string(payload)?,
        WebhookKind::Slack => slack_payload(payload)?,
        WebhookKind::Discord => discord_payload(payload)?,
    };

    let response = client
        .post(&config.url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .context("failed to send webhook request")?;

    if !response.status().is_success() {
        anyhow::bail!(
            "webhook request failed with status {}: {}",
            response.status(),
            response.text().unwrap_or_default()
        );
    }

    Ok(())
}

/// Notify all configured sinks; failures are reported as warnings and
/// otherwise ignored.
pub fn notify_outcome(
    sinks: &[WebhookConfig],
    payload: &NotifyPayload,
    reporter: &mut dyn Reporter,
) {
    for sink in sinks {
        if let Err(err) = send_webhook(sink, payload) {
            reporter.warn(&format!("notification to {} failed: {:#}", sink.url, err));
        }
    }
}

fn slack_payload(payload: &NotifyPayload) -> Result<String> {
    let color = if payload.success { "good" } else { "danger" };

    let mut fields = vec![
        json!({"title": "Host", "value": payload.hostname, "short": true}),
        json!({"title": "Type", "value": payload.host_type, "short": true}),
    ];
    if let Some(archive) = &payload.archive {
        fields.push(json!({"title": "Archive", "value": archive, "short": false}));
    }
    if let Some(error) = &payload.error {
        fields.push(json!({"title": "Error", "value": error, "short": false}));
    }

    let slack_json = json!({
        "attachments": [{
            "color": color,
            "title": "pmxpack backup",
            "text": payload.message,
            "fields": fields,
        }]
    });
    Ok(slack_json.to_string())
}

fn discord_payload(payload: &NotifyPayload) -> Result<String> {
    let color = if payload.success { 0x2e_cc71 } else { 0xe7_4c3c };
    let discord_json = json!({
        "embeds": [{
            "title": "pmxpack backup",
            "description": payload.message,
            "color": color,
            "fields": [
                {"name": "Host", "value": payload.hostname, "inline": true},
                {"name": "Duration", "value": format!("{}s", payload.duration_secs), "inline": true},
            ],
        }]
    });
    Ok(discord_json.to_string())
}

#[cfg(test)]
mod tests {
    use pmxpack_types::{HostType, NullReporter};

    use super::*;

    fn stats() -> BackupStats {
        let mut stats = BackupStats::new("pve1", HostType::Pve);
        stats.archive_size = 2048;
        stats.duration_secs = 42;
        stats
    }

    #[test]
    fn payload_reflects_outcome() {
        let ok = NotifyPayload::from_stats(&stats(), None);
        assert!(ok.success);
        assert!(ok.message.contains("finished"));

        let failed = NotifyPayload::from_stats(&stats(), Some("disk full".to_string()));
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
    }

    #[test]
    fn slack_payload_shape() {
        let payload = NotifyPayload::from_stats(&stats(), None);
        let body = slack_payload(&payload).expect("format");
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(value["attachments"][0]["color"], "good");
    }

    #[test]
    fn discord_payload_shape() {
        let payload = NotifyPayload::from_stats(&stats(), Some("boom".to_string()));
        let body = discord_payload(&payload).expect("format");
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(value["embeds"][0]["color"], 0xe7_4c3c);
    }

    #[test]
    fn failures_are_swallowed() {
        let sinks = vec![WebhookConfig {
            url: "http://127.0.0.1:1/unreachable".to_string(),
            kind: WebhookKind::Generic,
            timeout_secs: 1,
        }];
        let payload = NotifyPayload::from_stats(&stats(), None);
        // Must not panic or error out.
        notify_outcome(&sinks, &payload, &mut NullReporter);
    }

    #[test]
    fn webhook_round_trip_against_local_server() {
        let server = match tiny_http::Server::http("127.0.0.1:0") {
            Ok(server) => server,
            Err(_) => return,
        };
        let addr = server.server_addr();
        let handle = std::thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(tiny_http::Response::from_string("ok"));
            }
        });

        let config = WebhookConfig {
            url: format!("http://{}/hook", addr),
            kind: WebhookKind::Generic,
            timeout_secs: 5,
        };
        let payload = NotifyPayload::from_stats(&stats(), None);
        send_webhook(&config, &payload).expect("send");
        handle.join().expect("server thread");
    }
}
