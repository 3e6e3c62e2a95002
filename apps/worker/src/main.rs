//! Tether command runner.
//!
//! Registers and starts an execution under a named lock, streams the
//! command's output to the API in batches and completes the execution with
//! the command's result.

#![forbid(unsafe_code)]

mod api_client;
mod line_batcher;
mod worker_config;

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tether_core::{AppError, AppResult};
use tether_domain::{ExecutionStatus, LogLine};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api_client::ApiClient;
use crate::line_batcher::LineBatcher;
use crate::worker_config::{WorkerConfig, init_tracing};

const LINE_BUFFER: usize = 1024;
const MAX_BATCH_ATTEMPTS: u32 = 5;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let client = ApiClient::new(&config)?;

    match client.register_execution().await {
        Ok(registered) => debug!(
            execution_id = %config.execution_id,
            status = %registered.status,
            "execution registered"
        ),
        Err(AppError::Conflict(message)) => debug!(
            execution_id = %config.execution_id,
            message = %message,
            "execution was registered beforehand"
        ),
        Err(error) => return Err(error),
    }

    let started = client
        .start_execution(
            config.lock_name.as_str(),
            config.holder_identity.as_str(),
            config.lock_ttl_seconds,
        )
        .await?;
    info!(
        execution_id = %config.execution_id,
        lock_name = %config.lock_name,
        lock_id = %started.lock.lock_id,
        expires_at = %started.lock.expires_at,
        "execution started"
    );

    let mut child = match Command::new(config.program.as_str())
        .args(&config.arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            finish(&client, &config, ExecutionStatus::Failed).await?;
            return Err(AppError::Internal(format!(
                "failed to spawn '{}': {error}",
                config.program
            )));
        }
    };

    let (line_sender, line_receiver) = mpsc::channel(LINE_BUFFER);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_line_reader(stdout, line_sender.clone(), "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_line_reader(stderr, line_sender.clone(), "stderr"));
    }
    drop(line_sender);

    let shipper = tokio::spawn(ship_batches(
        client.clone(),
        line_receiver,
        config.batch_max_lines,
        config.flush_interval(),
    ));
    let renewer = spawn_lock_renewer(client.clone(), config.clone());

    let exit_status = child.wait().await;
    for reader in readers {
        if let Err(error) = reader.await {
            warn!(error = %error, "command output reader stopped abnormally");
        }
    }
    match shipper.await {
        Ok(0) => {}
        Ok(dropped_batches) => warn!(
            execution_id = %config.execution_id,
            dropped_batches,
            "some log batches could not be delivered"
        ),
        Err(error) => warn!(error = %error, "log shipper stopped abnormally"),
    }
    renewer.abort();

    let succeeded = matches!(&exit_status, Ok(status) if status.success());
    let final_status = if succeeded {
        ExecutionStatus::Succeeded
    } else {
        ExecutionStatus::Failed
    };
    finish(&client, &config, final_status).await?;

    match exit_status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(AppError::Internal(format!("command exited with {status}"))),
        Err(error) => Err(AppError::Internal(format!(
            "failed to wait for command: {error}"
        ))),
    }
}

fn spawn_line_reader<R>(
    stream: R,
    sender: mpsc::Sender<LogLine>,
    source: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(message)) => {
                    let line = LogLine {
                        timestamp: Utc::now().timestamp_millis(),
                        message,
                    };
                    if sender.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(source, error = %error, "failed to read command output");
                    break;
                }
            }
        }
    })
}

/// Ships batches until every reader is done; returns how many batches were dropped.
async fn ship_batches(
    client: ApiClient,
    mut lines: mpsc::Receiver<LogLine>,
    max_lines: usize,
    flush_interval: Duration,
) -> usize {
    let mut batcher = LineBatcher::new(max_lines);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dropped_batches = 0;

    loop {
        let (batch, finished) = tokio::select! {
            line = lines.recv() => match line {
                Some(line) => (batcher.push(line), false),
                None => (batcher.take(), true),
            },
            _ = ticker.tick() => (batcher.take(), false),
        };

        if let Some(batch) = batch {
            if !ship_batch(&client, batch).await {
                dropped_batches += 1;
            }
        }
        if finished {
            return dropped_batches;
        }
    }
}

/// Posts one batch, retrying with the same batch id so a redelivery reuses
/// the indices of the first attempt.
async fn ship_batch(client: &ApiClient, lines: Vec<LogLine>) -> bool {
    let batch_id = uuid::Uuid::new_v4().to_string();
    let mut delay = INITIAL_RETRY_DELAY;

    for attempt in 1..=MAX_BATCH_ATTEMPTS {
        match client.ingest_logs(batch_id.as_str(), &lines).await {
            Ok(ingested) => {
                debug!(
                    batch_id = %batch_id,
                    start_index = ingested.start_index,
                    end_index = ingested.end_index,
                    replayed = ingested.replayed,
                    "log batch shipped"
                );
                return true;
            }
            Err(error) if attempt < MAX_BATCH_ATTEMPTS && should_retry(&error) => {
                warn!(
                    batch_id = %batch_id,
                    attempt,
                    error = %error,
                    "log batch rejected; retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(error) => {
                warn!(
                    batch_id = %batch_id,
                    lines = lines.len(),
                    error = %error,
                    "dropping log batch"
                );
                return false;
            }
        }
    }

    false
}

// A batch whose first delivery is still in flight answers with a conflict.
fn should_retry(error: &AppError) -> bool {
    error.is_retryable() || matches!(error, AppError::Conflict(_))
}

fn spawn_lock_renewer(client: ApiClient, config: WorkerConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.renew_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match client
                .renew_lock(config.lock_name.as_str(), config.lock_ttl_seconds)
                .await
            {
                Ok(lock) => debug!(
                    lock_name = %config.lock_name,
                    expires_at = %lock.expires_at,
                    "lock renewed"
                ),
                Err(AppError::Conflict(message)) => {
                    warn!(
                        lock_name = %config.lock_name,
                        execution_id = %config.execution_id,
                        message = %message,
                        "lock is no longer held; renewal stopped"
                    );
                    break;
                }
                Err(error) => warn!(
                    lock_name = %config.lock_name,
                    error = %error,
                    "failed to renew lock"
                ),
            }
        }
    })
}

async fn finish(client: &ApiClient, config: &WorkerConfig, status: ExecutionStatus) -> AppResult<()> {
    let completed = client.complete_execution(status).await?;
    info!(
        execution_id = %config.execution_id,
        status = status.as_str(),
        notified_viewers = completed.notified_viewers,
        "execution completed"
    );
    Ok(())
}
