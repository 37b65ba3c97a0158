//! Persistent stream mode: network source on `input_port`, network sink to
//! `output_host:output_port`, running until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use anyhow::Context;
use tracing::{info, warn};
use voxbridge_core::{
    open_sink, open_source, ConversionSession, EndpointDescriptor,
};

use crate::settings::ServerSettings;
use crate::state::AppState;
use crate::{http, shutdown_signal};

fn network_endpoint(settings: &ServerSettings, host: &str, port: u16) -> EndpointDescriptor {
    EndpointDescriptor::Network {
        host: host.to_owned(),
        port,
        latency_ms: settings.jitter_latency_ms,
        framing: settings.framing,
    }
}

fn log_stats(session: &ConversionSession) {
    let stats = session.stats();
    info!(
        state = %session.state(),
        chunks = stats.chunks_processed,
        samples_in = stats.samples_in,
        samples_out = stats.samples_out,
        errors = stats.error_count,
        passthrough = stats.passthrough_chunks,
        overwritten = stats.overwritten_samples,
        input_level = session.input_level().unwrap_or(0.0),
        "stream stats"
    );
}

pub async fn run(state: web::Data<AppState>) -> anyhow::Result<()> {
    let settings = &state.settings;
    let reference = settings
        .reference
        .clone()
        .context("stream mode needs --reference")?;

    let session = Arc::new(ConversionSession::with_label(
        state.model.clone(),
        settings.session_config(settings.generation_params()),
        "stream",
    )?);
    let priming = Arc::clone(&session);
    tokio::task::spawn_blocking(move || priming.prepare_reference_file(&reference))
        .await
        .context("reference priming task failed")?
        .context("cannot prime the stream session")?;

    let cfg = settings.transport_config(session.sample_rate());
    let source = open_source(
        &network_endpoint(settings, &settings.bind_host, settings.input_port),
        &cfg,
    )?;
    let sink = open_sink(
        &network_endpoint(settings, &settings.output_host, settings.output_port),
        &cfg,
    )?;
    session
        .start(source, sink)
        .with_context(|| format!("cannot start streaming on port {}", settings.input_port))?;
    state.set_stream(Arc::clone(&session));
    info!(
        input = %format!("{}:{}", settings.bind_host, settings.input_port),
        output = %format!("{}:{}", settings.output_host, settings.output_port),
        framing = ?settings.framing,
        "stream session running"
    );

    let mut api = None;
    if settings.http_port != 0 {
        match http::serve(state.clone()) {
            Ok(server) => {
                let handle = server.handle();
                api = Some((handle, actix_web::rt::spawn(server)));
            }
            Err(e) => {
                stop_session(Arc::clone(&session)).await;
                return Err(e).context(format!("cannot bind HTTP port {}", settings.http_port));
            }
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.stats_interval_secs));
    ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                log_stats(&session);
                if session.is_finished() {
                    warn!("stream session ended on its own");
                    break;
                }
            }
        }
    }

    if let Some((handle, task)) = api {
        handle.stop(true).await;
        if let Ok(Err(e)) = task.await {
            warn!(error = %e, "HTTP API exited with an error");
        }
    }
    stop_session(Arc::clone(&session)).await;
    log_stats(&session);
    Ok(())
}

/// Release the session's endpoints. Also needed after the loop ended on
/// its own, since the source stays open until `stop()`.
async fn stop_session(session: Arc<ConversionSession>) {
    match tokio::task::spawn_blocking(move || session.stop()).await {
        Ok(Ok(())) => info!("stream session stopped"),
        Ok(Err(e)) => warn!(error = %e, "stream session stop reported an error"),
        Err(e) => warn!(error = %e, "stream session stop task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_core::Framing;

    #[test]
    fn endpoints_follow_settings() {
        let settings = ServerSettings {
            framing: Framing::RawUdp,
            jitter_latency_ms: 80,
            ..ServerSettings::default()
        };
        let desc = network_endpoint(&settings, &settings.output_host, settings.output_port);
        assert_eq!(
            desc,
            EndpointDescriptor::Network {
                host: "127.0.0.1".into(),
                port: 5005,
                latency_ms: 80,
                framing: Framing::RawUdp,
            }
        );
    }
}
