//! Daily export of the incident table to the admin chat.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use insera_bot::{BotService, ChatTransport};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const CRATE_NAME: &str = "insera-sync";

/// Midnight every day, seconds-resolution cron.
pub const DEFAULT_EXPORT_CRON: &str = "0 0 0 * * *";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub export_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            export_cron: DEFAULT_EXPORT_CRON.to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("INSERA_SCHEDULER_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            export_cron: std::env::var("INSERA_EXPORT_CRON")
                .unwrap_or_else(|_| DEFAULT_EXPORT_CRON.to_string()),
        }
    }
}

/// Builds the daily export job in the process-local time zone. The returned
/// scheduler is not started. Returns `None` when disabled.
pub async fn maybe_build_scheduler(
    config: &SchedulerConfig,
    service: Arc<BotService>,
    transport: Arc<dyn ChatTransport>,
) -> Result<Option<JobScheduler>> {
    if !config.enabled {
        info!("daily export disabled");
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.export_cron.as_str();
    let job = Job::new_async_tz(cron, Local, move |job_id, _sched| {
        let service = service.clone();
        let transport = transport.clone();
        Box::pin(async move {
            info!(%job_id, "daily export triggered");
            run_daily_export(&service, transport.as_ref()).await;
        })
    })
    .with_context(|| format!("creating daily export job for cron {cron}"))?;
    sched.add(job).await.context("adding daily export job")?;
    info!(cron, "daily export scheduled");
    Ok(Some(sched))
}

/// Sends the table to the admin chat. Failures are logged and not retried.
pub async fn run_daily_export(service: &BotService, transport: &dyn ChatTransport) -> bool {
    let chat = service.admin_chat();
    match service.export(chat, transport).await {
        Ok(()) => {
            info!(chat = chat.0, "daily export delivered");
            true
        }
        Err(err) => {
            error!(chat = chat.0, error = %format!("{err:#}"), "daily export failed");
            false
        }
    }
}
