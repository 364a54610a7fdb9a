//! KTC Upload CLI
//!
//! Uploads one file through the chunked upload protocol:
//!
//! ```text
//! ktc-upload <file> <owner-reference>
//! ```
//!
//! With `UPLOAD_SESSION_FILE` set, an interrupted upload leaves its session
//! snapshot there and the next run resumes it.

use std::path::Path;

use anyhow::{bail, Context};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ktc_upload::config::Config;
use ktc_upload::upload::{
    FileSource, RetryPolicy, TransportClient, UploadOrchestrator, UploadSession, UploadSource,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ktc_upload=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    let mut args = std::env::args().skip(1);
    let (Some(file), Some(owner_reference), None) = (args.next(), args.next(), args.next()) else {
        bail!("usage: ktc-upload <file> <owner-reference>");
    };

    let source = FileSource::open(&file)
        .await
        .with_context(|| format!("Cannot upload {}", file))?;
    let transport = TransportClient::from_config(&config.client)?;

    let mut orchestrator = UploadOrchestrator::new(transport, config.client.chunk_size)
        .with_retry_policy(RetryPolicy::from(&config.client.retry))
        .on_progress(|progress| {
            tracing::info!(
                chunks = progress.chunks_uploaded,
                total_chunks = progress.total_chunks,
                percent = progress.percent(),
                "Upload progress"
            );
        });

    let session_file = config.client.session_file.clone();
    if let Some(path) = &session_file {
        if let Some(session) = load_session(path, &source).await? {
            tracing::info!(
                upload_id = %session.upload_id(),
                path = %path.display(),
                "Resuming saved upload session"
            );
            orchestrator = orchestrator.with_session(session);
        }
    }

    let abort = orchestrator.abort_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping after the current chunk");
            abort.abort();
        }
    });

    match orchestrator.upload(&source, &owner_reference).await {
        Ok(outcome) => {
            if let Some(path) = &session_file {
                remove_session(path).await?;
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(err) => {
            if let Some(path) = &session_file {
                // The orchestrator drops sessions that can never be resumed
                match orchestrator.session() {
                    Some(session) => {
                        save_session(path, session).await?;
                        tracing::info!(path = %path.display(), "Saved upload session for resume");
                    }
                    None => remove_session(path).await?,
                }
            }
            Err(err).with_context(|| format!("Upload of {} failed", file))
        }
    }
}

/// Load a saved session if it belongs to `source`
async fn load_session(path: &Path, source: &FileSource) -> anyhow::Result<Option<UploadSession>> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let session: UploadSession = match serde_json::from_str(&json) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Ignoring invalid session file, starting a new upload"
            );
            return Ok(None);
        }
    };

    let size = source.size().await?;
    if session.filename() != source.filename() || session.total_size() != size {
        tracing::warn!(
            upload_id = %session.upload_id(),
            "Saved session is for a different file, starting a new upload"
        );
        return Ok(None);
    }

    Ok(Some(session))
}

async fn save_session(path: &Path, session: &UploadSession) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(session)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn remove_session(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
