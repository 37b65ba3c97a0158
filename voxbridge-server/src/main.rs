//! voxbridge server entry point.
//!
//! Three modes share one warmed-up model:
//! - `stream` (default): RTP/UDP in, converted RTP/UDP out, plus the HTTP
//!   health API unless `--http-port 0`.
//! - `http`: request/response conversion API.
//! - `file`: convert `--source` into `--output` and exit.

mod batch;
mod cli;
mod error;
mod http;
mod settings;
mod state;
mod stream;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use actix_web::web;
use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voxbridge_core::{ModelHandle, StubVoiceModel, VoiceModel};

use crate::batch::{convert_file, FileJob};
use crate::cli::{Cli, Mode};
use crate::settings::ServerSettings;
use crate::state::AppState;

const DEFAULT_LOG_FILTER: &str = "voxbridge=info,voxbridge_core=info,actix_web=info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on the first SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_model() -> anyhow::Result<ModelHandle> {
    let mut model = StubVoiceModel::new();
    model.warm_up().context("model warm-up failed")?;
    let accel = model.accelerator();
    info!(
        sample_rate = model.sample_rate(),
        accelerator = accel.name.as_deref().unwrap_or("cpu"),
        "voice model ready"
    );
    Ok(ModelHandle::new(model))
}

fn check_startup(settings: &ServerSettings, cli: &Cli) -> anyhow::Result<()> {
    match (&settings.reference, settings.mode) {
        (Some(path), _) if !path.is_file() => {
            bail!("reference file {} does not exist", path.display())
        }
        (None, Mode::Stream | Mode::File) => {
            bail!("--reference is required in {} mode", settings.mode)
        }
        _ => {}
    }
    if settings.mode == Mode::File && (cli.source.is_none() || cli.output.is_none()) {
        bail!("file mode needs --source and --output");
    }
    settings
        .session_config(settings.generation_params())
        .validate()
        .context("invalid session configuration")?;
    settings
        .transport_config(22_050)
        .validate()
        .context("invalid transport configuration")?;
    Ok(())
}

fn scratch_dir() -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir().join("voxbridge");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create scratch directory {}", dir.display()))?;
    Ok(dir)
}

async fn run_http(state: web::Data<AppState>) -> anyhow::Result<()> {
    let port = state.settings.http_port;
    let server = http::serve(state).with_context(|| format!("cannot bind HTTP port {port}"))?;
    let handle = server.handle();
    let mut task = actix_web::rt::spawn(server);
    tokio::select! {
        res = &mut task => {
            res.context("HTTP server task failed")??;
            return Ok(());
        }
        _ = shutdown_signal() => info!("shutdown requested"),
    }
    handle.stop(true).await;
    task.await.context("HTTP server task failed")??;
    Ok(())
}

async fn run_file(state: web::Data<AppState>, cli: &Cli) -> anyhow::Result<()> {
    let (Some(source), Some(output), Some(reference)) = (
        cli.source.clone(),
        cli.output.clone(),
        state.settings.reference.clone(),
    ) else {
        bail!("file mode needs --reference, --source and --output");
    };
    let model = state.model.clone();
    let config = state
        .settings
        .session_config(state.settings.generation_params());
    let timeout = Duration::from_secs(state.settings.request_timeout_secs);
    let out = output.clone();
    let stats = tokio::task::spawn_blocking(move || {
        convert_file(
            &model,
            config,
            FileJob {
                reference: &reference,
                source: &source,
                output: &out,
            },
            timeout,
            "file",
        )
    })
    .await
    .context("conversion task failed")?
    .context("conversion failed")?;
    info!(
        output = %output.display(),
        samples = stats.samples_out,
        errors = stats.error_count,
        "wrote converted audio"
    );
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = settings::resolve(&cli)?;
    check_startup(&settings, &cli)?;
    info!(mode = %settings.mode, "starting voxbridge");

    let model = init_model()?;
    let mode = settings.mode;
    let state = web::Data::new(AppState::new(settings, model, scratch_dir()?));
    match mode {
        Mode::Stream => stream::run(state).await,
        Mode::Http => run_http(state).await,
        Mode::File => run_file(state, &cli).await,
    }
}

#[actix_web::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["voxbridge"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn stream_mode_requires_a_reference() {
        let c = cli(&["--mode", "stream"]);
        let s = settings::resolve(&c).unwrap();
        let err = check_startup(&s, &c).unwrap_err();
        assert!(err.to_string().contains("--reference"));
    }

    #[test]
    fn missing_reference_file_is_fatal_in_every_mode() {
        let c = cli(&["--mode", "http", "--reference", "/no/such/ref.wav"]);
        let s = settings::resolve(&c).unwrap();
        assert!(check_startup(&s, &c).is_err());
    }

    #[test]
    fn http_mode_runs_without_a_default_reference() {
        let c = cli(&["--mode", "http"]);
        let s = settings::resolve(&c).unwrap();
        check_startup(&s, &c).unwrap();
    }

    #[test]
    fn file_mode_needs_source_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref.wav");
        voxbridge_core::audio::write_wav_mono(&reference, &vec![0.1; 22_050], 22_050).unwrap();
        let c = cli(&["--mode", "file", "--reference", reference.to_str().unwrap()]);
        let s = settings::resolve(&c).unwrap();
        assert!(check_startup(&s, &c).is_err());
    }
}
