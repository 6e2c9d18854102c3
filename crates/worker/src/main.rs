#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Dunning Background Worker
//!
//! Handles scheduled jobs:
//! - Automatic payment retries (every 15 minutes)
//! - Replay of webhook events that errored (every 5 minutes)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use dunning_billing::{
    DunningService, ProcessingResult, RetryAction, RetryResult, WebhookDisposition,
    WebhookReplayResult,
};
use dunning_shared::{create_pool_with, run_migrations, PoolSettings};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_RETRY_CRON: &str = "0 */15 * * * *";
const DEFAULT_REPLAY_CRON: &str = "0 */5 * * * *";
const HEARTBEAT_CRON: &str = "30 */5 * * * *";

/// Payments retried per run
const RETRY_BATCH_SIZE: i64 = 100;
/// Dead-lettered events replayed per run
const REPLAY_BATCH_SIZE: i64 = 50;

#[derive(Debug, Default, PartialEq, Eq)]
struct RetryCounts {
    recovered: usize,
    pending: usize,
    rescheduled: usize,
    exhausted: usize,
    deferred: usize,
}

fn count_retries(results: &[RetryResult]) -> RetryCounts {
    let mut counts = RetryCounts::default();
    for result in results {
        match result.action {
            RetryAction::Recovered | RetryAction::AlreadyRecovered => counts.recovered += 1,
            RetryAction::Pending => counts.pending += 1,
            RetryAction::Rescheduled => counts.rescheduled += 1,
            RetryAction::Exhausted => counts.exhausted += 1,
            RetryAction::Deferred(_) => counts.deferred += 1,
        }
    }
    counts
}

/// Log results of a retry run
fn log_retry_results(results: &[RetryResult]) {
    let counts = count_retries(results);
    info!(
        recovered = counts.recovered,
        pending = counts.pending,
        rescheduled = counts.rescheduled,
        exhausted = counts.exhausted,
        deferred = counts.deferred,
        "Retry cycle complete"
    );

    for result in results {
        if let RetryAction::Deferred(reason) = &result.action {
            warn!(
                failed_payment_id = result.failed_payment_id,
                reason = %reason,
                "Retry deferred"
            );
        }
    }
}

/// Log results of a dead-letter replay run
fn log_replay_results(results: &[WebhookReplayResult]) {
    for result in results {
        if let WebhookDisposition::Failed(reason) = &result.disposition {
            error!(
                event_id = %result.stripe_event_id,
                reason = %reason,
                "Webhook event still failing after replay"
            );
        }
    }
}

fn cron_from_env(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Dunning Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool_with(
        &database_url,
        PoolSettings {
            max_connections: 5,
            ..PoolSettings::default()
        },
    )
    .await?;
    run_migrations(&pool).await?;

    let dunning = Arc::new(DunningService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry failed payments whose next_retry_at has passed
    let retry_cron = cron_from_env("RETRY_CRON", DEFAULT_RETRY_CRON);
    let retry_service = dunning.clone();
    scheduler
        .add(Job::new_async(retry_cron.as_str(), move |_uuid, _l| {
            let service = retry_service.clone();
            Box::pin(async move {
                match service
                    .retry
                    .run_due_retries(OffsetDateTime::now_utc(), RETRY_BATCH_SIZE)
                    .await
                {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_retry_results(&results),
                    Err(e) => error!(error = %e, "Retry cycle failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %retry_cron, "Scheduled: Payment retries");

    // Job 2: Replay webhook events recorded as errors
    let replay_cron = cron_from_env("REPLAY_CRON", DEFAULT_REPLAY_CRON);
    let replay_service = dunning.clone();
    scheduler
        .add(Job::new_async(replay_cron.as_str(), move |_uuid, _l| {
            let service = replay_service.clone();
            Box::pin(async move {
                let results = match service.webhooks.replay_failed(REPLAY_BATCH_SIZE).await {
                    Ok(results) => results,
                    Err(e) => {
                        error!(error = %e, "Webhook replay cycle failed");
                        return;
                    }
                };
                if results.is_empty() {
                    return;
                }
                log_replay_results(&results);

                match service
                    .webhooks
                    .list_webhook_events(Some(ProcessingResult::Error), REPLAY_BATCH_SIZE)
                    .await
                {
                    Ok(remaining) if !remaining.is_empty() => {
                        warn!(count = remaining.len(), "Webhook events remain in error");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to count errored webhook events"),
                }
            })
        })?)
        .await?;
    info!(cron = %replay_cron, "Scheduled: Webhook dead-letter replay");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async(HEARTBEAT_CRON, |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Dunning Worker started successfully with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: i64, action: RetryAction) -> RetryResult {
        RetryResult {
            failed_payment_id: id,
            action,
        }
    }

    #[test]
    fn test_count_retries_groups_actions() {
        let results = vec![
            result(1, RetryAction::Recovered),
            result(2, RetryAction::AlreadyRecovered),
            result(3, RetryAction::Rescheduled),
            result(4, RetryAction::Exhausted),
            result(5, RetryAction::Deferred("stripe unavailable".to_string())),
            result(6, RetryAction::Pending),
        ];

        assert_eq!(
            count_retries(&results),
            RetryCounts {
                recovered: 2,
                pending: 1,
                rescheduled: 1,
                exhausted: 1,
                deferred: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_default_crons_parse() {
        for cron in [DEFAULT_RETRY_CRON, DEFAULT_REPLAY_CRON, HEARTBEAT_CRON] {
            assert!(
                Job::new_async(cron, |_uuid, _l| Box::pin(async {})).is_ok(),
                "{} should parse",
                cron
            );
        }
    }
}
