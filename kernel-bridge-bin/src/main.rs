use std::io;
use std::sync::Arc;

use tether_kernel_config::{load_settings, StaticSettings};
use tether_kernel_core::{KernelConfig, KernelRuntime};
use tether_kernel_model::StreamingChatEngine;
use tether_kernel_protocol::{EventMsg, Submission};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "TETHER_LOG";

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> io::Result<()> {
    init_tracing();

    let settings = load_settings().map_err(|err| {
        error!(%err, "failed to load chat settings");
        io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
    })?;
    if let Err(err) = settings.validate_api_key() {
        warn!(%err, "streams will fail until an API key is configured");
    }
    info!(
        model = %settings.model,
        base_url = %settings.base_url,
        responses_api = settings.use_responses_api,
        "starting stream bridge"
    );

    let chat_engine = Arc::new(StreamingChatEngine::new(Arc::new(StaticSettings(settings))));
    let mut runtime = KernelRuntime::spawn_with_engine(KernelConfig::default(), chat_engine);
    let submission_tx = runtime.submission_sender();

    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let submission = match serde_json::from_str::<Submission>(&line) {
                Ok(item) => item,
                Err(err) => {
                    warn!(%err, "invalid submission json");
                    continue;
                }
            };

            if submission_tx.send(submission).await.is_err() {
                break;
            }
        }

        Ok::<(), io::Error>(())
    });

    let mut stdout = tokio::io::stdout();
    while let Some(event) = runtime.events_mut().recv().await {
        let line = serde_json::to_string(&event)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;

        if matches!(event.msg, EventMsg::ShutdownComplete) {
            break;
        }
    }

    stdin_task.abort();
    runtime.join().await.map_err(io::Error::other)?;

    Ok(())
}
