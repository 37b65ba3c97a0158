//! HTTP façade: `GET /`, `GET /health` and `POST /convert`.
//!
//! `/convert` takes a multipart form with a `source` WAV, an optional
//! `reference` WAV and generation fields, runs one file-to-file session on the
//! blocking pool and answers with the converted `audio/wav`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use actix_multipart::{Field, Multipart};
use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer};
use futures_util::stream::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;
use voxbridge_core::{GenerationParams, VoxError};

use crate::batch::{convert_file, FileJob};
use crate::error::AppError;
use crate::state::AppState;

/// Form values are short; anything longer is a client bug.
const MAX_TEXT_FIELD_BYTES: usize = 1_024;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/health", web::get().to(health))
        .route("/convert", web::post().to(convert));
}

/// Bind the API on `bind_host:http_port`. The returned server is not yet
/// polled; await it or spawn it. Signals are left to the caller, which stops
/// the server through its handle.
pub fn serve(state: web::Data<AppState>) -> io::Result<Server> {
    let addr = (state.settings.bind_host.clone(), state.settings.http_port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(actix_web::middleware::Logger::default())
            .configure(configure)
    })
    .disable_signals()
    .shutdown_timeout(5)
    .bind(addr.clone())?
    .run();
    info!(host = %addr.0, port = addr.1, "HTTP API listening");
    Ok(server)
}

async fn index(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": "voxbridge",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.settings.mode.to_string(),
        "endpoints": {
            "GET /": "this index",
            "GET /health": "service status, accelerator, sessions and stats",
            "POST /convert": "multipart: source (wav), reference (wav, optional), \
                fidelity_steps, inference_cfg_rate, convert_style, f0_condition, \
                anonymization_only",
        },
    }))
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.health())
}

/// Deletes its file when dropped, whatever path the request took.
struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    fn new(dir: &Path, request: Uuid, role: &str) -> Self {
        Self {
            path: dir.join(format!("voxbridge-{request}-{role}.wav")),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "temp file not removed"),
        }
    }
}

#[derive(Default)]
struct ConvertForm {
    source: Option<TempFileGuard>,
    reference: Option<TempFileGuard>,
    fidelity_steps: Option<String>,
    cfg_rate: Option<String>,
    convert_style: Option<String>,
    f0_condition: Option<String>,
    anonymization_only: Option<String>,
}

impl ConvertForm {
    fn params(&self) -> Result<GenerationParams, AppError> {
        let defaults = GenerationParams::default();
        let params = GenerationParams {
            fidelity_steps: parse_field(&self.fidelity_steps, "fidelity_steps")?
                .unwrap_or(defaults.fidelity_steps),
            cfg_rate: parse_field(&self.cfg_rate, "inference_cfg_rate")?
                .unwrap_or(defaults.cfg_rate),
            convert_style: parse_flag(&self.convert_style, "convert_style")?
                .unwrap_or(defaults.convert_style),
            f0_condition: parse_flag(&self.f0_condition, "f0_condition")?
                .unwrap_or(defaults.f0_condition),
        };
        params
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        Ok(params)
    }

    fn anonymization_only(&self) -> Result<bool, AppError> {
        Ok(parse_flag(&self.anonymization_only, "anonymization_only")?.unwrap_or(false))
    }
}

fn parse_field<T: std::str::FromStr>(raw: &Option<String>, name: &str) -> Result<Option<T>, AppError> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("`{name}` has invalid value '{v}'"))),
    }
}

fn parse_flag(raw: &Option<String>, name: &str) -> Result<Option<bool>, AppError> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(AppError::Validation(format!("`{name}` must be a boolean, got '{v}'"))),
        },
    }
}

async fn read_field(field: &mut Field, limit: usize, name: &str) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > limit {
            return Err(AppError::Validation(format!(
                "field `{name}` exceeds {limit} bytes"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_form(
    mut payload: Multipart,
    scratch: &Path,
    request: Uuid,
    upload_limit: usize,
) -> Result<ConvertForm, AppError> {
    let mut form = ConvertForm::default();
    while let Some(item) = payload.next().await {
        let mut field = item?;
        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(str::to_owned)
            .ok_or_else(|| AppError::Validation("form field without a name".into()))?;

        match name.as_str() {
            "source" | "reference" => {
                let upload = if name == "source" {
                    &mut form.source
                } else {
                    &mut form.reference
                };
                // Each upload owns one scratch path per request.
                if upload.is_some() {
                    return Err(AppError::Validation(format!(
                        "field `{name}` appears more than once"
                    )));
                }
                // Guard first, so a failed write still cleans up.
                let guard = TempFileGuard::new(scratch, request, &name);
                let bytes = read_field(&mut field, upload_limit, &name).await?;
                tokio::fs::write(guard.path(), &bytes).await?;
                debug!(field = %name, bytes = bytes.len(), "upload stored");
                *upload = Some(guard);
            }
            _ => {
                let slot = match name.as_str() {
                    "fidelity_steps" | "diffusion_steps" => &mut form.fidelity_steps,
                    "inference_cfg_rate" | "cfg_rate" => &mut form.cfg_rate,
                    "convert_style" => &mut form.convert_style,
                    "f0_condition" => &mut form.f0_condition,
                    "anonymization_only" => &mut form.anonymization_only,
                    other => {
                        debug!(field = other, "ignoring unknown form field");
                        while let Some(chunk) = field.next().await {
                            chunk?;
                        }
                        continue;
                    }
                };
                let bytes = read_field(&mut field, MAX_TEXT_FIELD_BYTES, &name).await?;
                let value = String::from_utf8(bytes)
                    .map_err(|_| AppError::Validation(format!("field `{name}` is not UTF-8")))?;
                *slot = Some(value);
            }
        }
    }
    Ok(form)
}

async fn convert(state: web::Data<AppState>, payload: Multipart) -> Result<HttpResponse, AppError> {
    let _slot = state.try_acquire_slot()?;
    let request = Uuid::new_v4();
    let upload_limit = state.settings.max_upload_mb * 1024 * 1024;
    let form = read_form(payload, &state.scratch_dir, request, upload_limit).await?;

    let source = form
        .source
        .as_ref()
        .ok_or_else(|| AppError::Validation("missing `source` file field".into()))?;
    let params = form.params()?;
    let reference: PathBuf = if form.anonymization_only()? {
        source.path().to_path_buf()
    } else if let Some(uploaded) = &form.reference {
        uploaded.path().to_path_buf()
    } else if let Some(default) = &state.default_reference {
        default.clone()
    } else {
        state.record_finished(None);
        return Err(VoxError::Reference(
            "no reference clip uploaded and no server default configured".into(),
        )
        .into());
    };

    let output = TempFileGuard::new(&state.scratch_dir, request, "output");
    let job_source = source.path().to_path_buf();
    let job_output = output.path().to_path_buf();
    let model = state.model.clone();
    let config = state.settings.session_config(params);
    let timeout = Duration::from_secs(state.settings.request_timeout_secs);
    let label = format!("http-{}", &request.simple().to_string()[..8]);

    info!(%label, steps = params.fidelity_steps, "conversion request");
    let result = web::block(move || {
        convert_file(
            &model,
            config,
            FileJob {
                reference: &reference,
                source: &job_source,
                output: &job_output,
            },
            timeout,
            &label,
        )
    })
    .await?;

    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            warn!(error = %e, kind = e.kind(), "conversion request failed");
            state.record_finished(None);
            return Err(e.into());
        }
    };
    let wav = tokio::fs::read(output.path()).await?;
    state.record_finished(Some(&stats));
    Ok(HttpResponse::Ok()
        .content_type("audio/wav")
        .insert_header((
            "Content-Disposition",
            "attachment; filename=\"converted.wav\"",
        ))
        .body(wav))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header;
    use actix_web::{test, App};
    use std::io::Cursor;
    use voxbridge_core::audio::ToneGenerator;
    use voxbridge_core::{ModelHandle, StubVoiceModel};

    use crate::settings::ServerSettings;

    const BOUNDARY: &str = "voxbridge-test-boundary";

    fn wav_bytes(secs: f32, rate: u32) -> Vec<u8> {
        let n = (secs * rate as f32) as usize;
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in ToneGenerator::new(180.0, 0.4, rate).next_block(n) {
                writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    enum Part<'a> {
        File(&'a str, Vec<u8>),
        Text(&'a str, &'a str),
    }

    fn multipart(parts: Vec<Part<'_>>) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::File(name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}.wav\"\r\n\
                             Content-Type: audio/wav\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(&bytes);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}")
                            .as_bytes(),
                    );
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn app_state(scratch: &Path, reference: Option<PathBuf>) -> web::Data<AppState> {
        let settings = ServerSettings {
            mode: crate::cli::Mode::Http,
            reference,
            ..ServerSettings::default()
        };
        web::Data::new(AppState::new(
            settings,
            ModelHandle::new(StubVoiceModel::new()),
            scratch.to_path_buf(),
        ))
    }

    fn convert_request(parts: Vec<Part<'_>>) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/convert")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart(parts))
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[actix_web::test]
    async fn health_reports_without_inference() {
        let scratch = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(app_state(scratch.path(), None))
                .configure(configure),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "http");
        assert_eq!(body["activeSessions"], 0);
        assert!(body["stream"].is_null());

        let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["endpoints"]["POST /convert"].is_string());
    }

    #[actix_web::test]
    async fn missing_reference_without_default_is_reference_error() {
        let scratch = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(app_state(scratch.path(), None))
                .configure(configure),
        )
        .await;
        let req = convert_request(vec![Part::File("source", wav_bytes(1.0, 22_050))]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "reference_error");
        assert!(dir_is_empty(scratch.path()));
    }

    #[actix_web::test]
    async fn converts_with_uploaded_reference() {
        let scratch = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(app_state(scratch.path(), None))
                .configure(configure),
        )
        .await;
        let req = convert_request(vec![
            Part::File("source", wav_bytes(1.0, 16_000)),
            Part::File("reference", wav_bytes(2.0, 22_050)),
            Part::Text("diffusion_steps", "4"),
            Part::Text("f0_condition", "true"),
        ]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "audio/wav"
        );
        let wav = test::read_body(resp).await;
        let reader = hound::WavReader::new(Cursor::new(wav.to_vec())).unwrap();
        assert_eq!(reader.spec().sample_rate, 22_050);
        // One second at 22.05 kHz, less one 441-sample overlap per chunk boundary.
        assert!(reader.len() >= 22_050 - 5 * 441 - 64);
        assert!(dir_is_empty(scratch.path()));
    }

    #[actix_web::test]
    async fn anonymization_uses_the_source_as_reference() {
        let scratch = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(app_state(scratch.path(), None))
                .configure(configure),
        )
        .await;
        let req = convert_request(vec![
            Part::File("source", wav_bytes(1.0, 22_050)),
            Part::Text("anonymization_only", "1"),
        ]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status().as_u16(), 200);
        assert!(dir_is_empty(scratch.path()));
    }

    #[actix_web::test]
    async fn invalid_fields_are_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let reference = scratch.path().join("default-ref.wav");
        std::fs::write(&reference, wav_bytes(1.0, 22_050)).unwrap();
        let app = test::init_service(
            App::new()
                .app_data(app_state(scratch.path(), Some(reference)))
                .configure(configure),
        )
        .await;

        let req = convert_request(vec![
            Part::File("source", wav_bytes(0.5, 22_050)),
            Part::Text("fidelity_steps", "0"),
        ]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "validation_error");

        let req = convert_request(vec![Part::Text("convert_style", "maybe")]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[actix_web::test]
    async fn full_server_answers_busy() {
        let scratch = tempfile::tempdir().unwrap();
        let state = app_state(scratch.path(), None);
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;
        let _a = state.try_acquire_slot().unwrap();
        let _b = state.try_acquire_slot().unwrap();
        let req = convert_request(vec![Part::File("source", wav_bytes(0.5, 22_050))]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status().as_u16(), 503);
    }

    #[actix_web::test]
    async fn repeated_upload_field_is_rejected_and_cleaned_up() {
        let scratch = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(app_state(scratch.path(), None))
                .configure(configure),
        )
        .await;
        let req = convert_request(vec![
            Part::File("source", wav_bytes(0.5, 22_050)),
            Part::File("reference", wav_bytes(1.0, 22_050)),
            Part::File("source", wav_bytes(0.5, 16_000)),
        ]);
        let resp = test::call_service(&app, req.to_request()).await;
        assert_eq!(resp.status().as_u16(), 400);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "validation_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("`source`"));
        assert!(dir_is_empty(scratch.path()));
    }
}
