use std::time::Duration;

use anyhow::{bail, Context, Result};
use flume::unbounded;
use tracing_subscriber::EnvFilter;

use trainwatch::api::{ApiClient, CredentialProvider};
use trainwatch::config::WatchConfig;
use trainwatch::sentiment;
use trainwatch::sync::{StatusSynchronizer, SyncSettings};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,trainwatch=debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;

    match args.first().map(String::as_str) {
        Some("sentiment") => {
            let conversation_id = args
                .get(1)
                .context("usage: trainwatch sentiment <conversation-id>")?;
            rt.block_on(report_sentiment(conversation_id))
        }
        Some(other) => bail!("unknown command {:?}; run without arguments to watch, or `trainwatch sentiment <conversation-id>`", other),
        None => rt.block_on(watch()),
    }
}

/// Fetches a conversation's score series and prints the trend report.
async fn report_sentiment(conversation_id: &str) -> Result<()> {
    let client = ApiClient::from_env()?;
    let scores = client
        .conversation_sentiment_scores(conversation_id)
        .await?;
    let report = sentiment::analyze(&scores);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Watches every configured subject until all are terminal or the
/// synchronizer faults.
async fn watch() -> Result<()> {
    let config = WatchConfig::load();
    if config.subjects.is_empty() {
        bail!("no subjects configured; add [[subjects]] entries to trainwatch.toml");
    }

    let client = ApiClient::new(config.api_url.clone(), config.api_token.clone())?;
    tracing::info!("Backend API: {}", client.base_url());
    if client.token().is_none() {
        tracing::warn!(
            "TRAINWATCH_API_TOKEN is unset/empty; subscriptions will be refused until a credential is available"
        );
    }

    let settings = SyncSettings {
        poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        auth_failure_limit: config.auth_failure_limit.max(1),
    };
    let (fault_tx, fault_rx) = unbounded();
    let sync = StatusSynchronizer::new(client.clone(), client.clone(), settings, fault_tx);

    let (done_tx, done_rx) = unbounded();
    for subject in &config.subjects {
        let done_tx = done_tx.clone();
        sync.subscribe(&subject.id, subject.kind, move |event| {
            match event.progress {
                Some(progress) => tracing::info!(
                    "{} {} is {:?} ({}%)",
                    event.subject_kind.as_str(),
                    event.subject_id,
                    event.status,
                    progress
                ),
                None => tracing::info!(
                    "{} {} is {:?}",
                    event.subject_kind.as_str(),
                    event.subject_id,
                    event.status
                ),
            }
            if event.status.is_terminal() {
                let _ = done_tx.send(event);
            }
        });
    }
    drop(done_tx);

    if config.enable_push_stream {
        let (event_tx, event_rx) = unbounded();
        tokio::spawn(client.clone().stream_training_events_forever(event_tx));
        let push_sync = sync.clone();
        tokio::spawn(async move {
            while let Ok(event) = event_rx.recv_async().await {
                push_sync.ingest(event);
            }
        });
    }

    let mut remaining = sync.stats().active_subscriptions;
    if remaining == 0 {
        bail!("no active subscriptions (missing credential?)");
    }
    tracing::info!("Watching {} subject(s)", remaining);

    loop {
        tokio::select! {
            fault = fault_rx.recv_async() => {
                match fault {
                    Ok(fault) => bail!("{}", fault),
                    Err(_) => bail!("synchronizer fault channel closed unexpectedly"),
                }
            }
            event = done_rx.recv_async() => {
                let Ok(event) = event else {
                    // A halt drops every registration, which also closes
                    // this channel; prefer reporting the fault.
                    if let Ok(fault) = fault_rx.try_recv() {
                        bail!("{}", fault);
                    }
                    return Ok(());
                };
                if let Some(message) = &event.message {
                    tracing::info!(
                        "{} {} finished as {:?}: {}",
                        event.subject_kind.as_str(),
                        event.subject_id,
                        event.status,
                        message
                    );
                }
                remaining -= 1;
                if remaining == 0 {
                    tracing::info!("All watched subjects reached a terminal state");
                    return Ok(());
                }
            }
        }
    }
}
