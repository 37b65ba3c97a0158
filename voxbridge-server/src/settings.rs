//! Server settings (optional JSON file), normalised on load and overridden by
//! CLI flags.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use voxbridge_core::session::FadeCurve;
use voxbridge_core::transport::{
    Backpressure, DEFAULT_INPUT_PORT, DEFAULT_JITTER_LATENCY_MS, DEFAULT_OUTPUT_PORT,
    DEFAULT_STREAM_RATE, MAX_JITTER_LATENCY_MS,
};
use voxbridge_core::{Framing, GenerationParams, SessionConfig, TransportConfig};

use crate::cli::{Cli, Mode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ServerSettings {
    pub mode: Mode,
    pub reference: Option<PathBuf>,
    pub bind_host: String,
    pub input_port: u16,
    pub output_host: String,
    pub output_port: u16,
    pub http_port: u16,
    pub framing: Framing,
    pub jitter_latency_ms: u32,
    pub stream_rate: u32,
    pub fidelity_steps: u32,
    pub cfg_rate: f32,
    pub chunk_ms: u32,
    pub overlap_ms: u32,
    pub fade_curve: FadeCurve,
    /// Settings-file only; see `SessionConfig::carry_context`.
    pub carry_context: bool,
    pub max_concurrent_sessions: usize,
    pub max_upload_mb: usize,
    pub request_timeout_secs: u64,
    pub stats_interval_secs: u64,
    pub backpressure: Backpressure,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Stream,
            reference: None,
            bind_host: "0.0.0.0".into(),
            input_port: DEFAULT_INPUT_PORT,
            output_host: "127.0.0.1".into(),
            output_port: DEFAULT_OUTPUT_PORT,
            http_port: 8080,
            framing: Framing::Rtp,
            jitter_latency_ms: DEFAULT_JITTER_LATENCY_MS,
            stream_rate: DEFAULT_STREAM_RATE,
            fidelity_steps: 10,
            cfg_rate: 0.7,
            chunk_ms: 180,
            overlap_ms: 20,
            fade_curve: FadeCurve::Cosine,
            carry_context: false,
            max_concurrent_sessions: 2,
            max_upload_mb: 50,
            request_timeout_secs: 300,
            stats_interval_secs: 10,
            backpressure: Backpressure::default(),
        }
    }
}

impl ServerSettings {
    /// Clamp every value into its supported range.
    pub fn normalize(&mut self) {
        self.bind_host = normalize_host(&self.bind_host, "0.0.0.0");
        self.output_host = normalize_host(&self.output_host, "127.0.0.1");
        if self.input_port == 0 {
            self.input_port = DEFAULT_INPUT_PORT;
        }
        if self.output_port == 0 {
            self.output_port = DEFAULT_OUTPUT_PORT;
        }
        self.jitter_latency_ms = self.jitter_latency_ms.min(MAX_JITTER_LATENCY_MS);
        self.stream_rate = self.stream_rate.clamp(8_000, 192_000);
        self.fidelity_steps = self
            .fidelity_steps
            .clamp(1, GenerationParams::MAX_FIDELITY_STEPS);
        self.cfg_rate = if self.cfg_rate.is_finite() {
            self.cfg_rate.clamp(0.0, 1.0)
        } else {
            0.7
        };
        self.chunk_ms = self.chunk_ms.clamp(20, 5_000);
        self.overlap_ms = self.overlap_ms.min(self.chunk_ms / 2);
        self.max_concurrent_sessions = self.max_concurrent_sessions.clamp(1, 64);
        self.max_upload_mb = self.max_upload_mb.clamp(1, 1_024);
        self.request_timeout_secs = self.request_timeout_secs.clamp(5, 3_600);
        self.stats_interval_secs = self.stats_interval_secs.clamp(1, 3_600);
        self.reference = self
            .reference
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }

    /// Overlay flags the user actually passed.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(mode) = cli.mode {
            self.mode = mode;
        }
        if let Some(reference) = &cli.reference {
            self.reference = Some(reference.clone());
        }
        if let Some(port) = cli.input_port {
            self.input_port = port;
        }
        if let Some(port) = cli.output_port {
            self.output_port = port;
        }
        if let Some(host) = &cli.output_host {
            self.output_host = host.clone();
        }
        if let Some(host) = &cli.bind_host {
            self.bind_host = host.clone();
        }
        if let Some(port) = cli.http_port {
            self.http_port = port;
        }
        if let Some(framing) = cli.framing {
            self.framing = framing.into();
        }
        if let Some(ms) = cli.jitter_latency_ms {
            self.jitter_latency_ms = ms;
        }
        if let Some(steps) = cli.fidelity_steps {
            self.fidelity_steps = steps;
        }
        if let Some(ms) = cli.chunk_ms {
            self.chunk_ms = ms;
        }
        if let Some(ms) = cli.overlap_ms {
            self.overlap_ms = ms;
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            fidelity_steps: self.fidelity_steps,
            cfg_rate: self.cfg_rate,
            ..GenerationParams::default()
        }
    }

    pub fn session_config(&self, params: GenerationParams) -> SessionConfig {
        let defaults = SessionConfig::default();
        // Rings must hold at least two chunks plus their overlap.
        let min_ring = 4.0 * (self.chunk_ms + self.overlap_ms) as f32 / 1_000.0;
        SessionConfig {
            chunk_ms: self.chunk_ms,
            overlap_ms: self.overlap_ms,
            fade_curve: self.fade_curve,
            carry_context: self.carry_context,
            ring_seconds: defaults.ring_seconds.max(min_ring),
            params,
            ..defaults
        }
    }

    /// Endpoint settings for a session running at `canonical_rate`.
    pub fn transport_config(&self, canonical_rate: u32) -> TransportConfig {
        TransportConfig {
            canonical_rate,
            stream_rate: self.stream_rate,
            backpressure: self.backpressure,
            ..TransportConfig::default()
        }
    }
}

fn normalize_host(raw: &str, fallback: &str) -> String {
    let host = raw.trim();
    if host.is_empty() {
        fallback.into()
    } else {
        host.into()
    }
}

/// Read and normalise a settings file. A file the user named explicitly must
/// exist and parse.
pub fn load_settings(path: &Path) -> anyhow::Result<ServerSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("cannot read settings file {}", path.display()))?;
    let mut settings: ServerSettings = serde_json::from_str(&raw)
        .with_context(|| format!("invalid settings file {}", path.display()))?;
    settings.normalize();
    Ok(settings)
}

/// Settings from `--settings` (or defaults) with CLI flags on top.
pub fn resolve(cli: &Cli) -> anyhow::Result<ServerSettings> {
    let mut settings = match &cli.settings {
        Some(path) => load_settings(path)?,
        None => ServerSettings::default(),
    };
    settings.apply_cli(cli);
    settings.normalize();
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut s = ServerSettings {
            fidelity_steps: 0,
            cfg_rate: 3.0,
            chunk_ms: 1,
            overlap_ms: 500,
            jitter_latency_ms: 10_000,
            bind_host: "  ".into(),
            input_port: 0,
            max_concurrent_sessions: 0,
            ..ServerSettings::default()
        };
        s.normalize();
        assert_eq!(s.fidelity_steps, 1);
        assert_eq!(s.cfg_rate, 1.0);
        assert_eq!(s.chunk_ms, 20);
        assert_eq!(s.overlap_ms, 10);
        assert_eq!(s.jitter_latency_ms, MAX_JITTER_LATENCY_MS);
        assert_eq!(s.bind_host, "0.0.0.0");
        assert_eq!(s.input_port, DEFAULT_INPUT_PORT);
        assert_eq!(s.max_concurrent_sessions, 1);
        s.session_config(s.generation_params()).validate().unwrap();
    }

    #[test]
    fn file_values_are_overridden_by_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"mode":"http","httpPort":9000,"chunkMs":200,"framing":"udp","fidelitySteps":400,"carryContext":true}"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "voxbridge",
            "--settings",
            path.to_str().unwrap(),
            "--chunk-ms",
            "300",
        ])
        .unwrap();
        let s = resolve(&cli).unwrap();
        assert_eq!(s.mode, Mode::Http);
        assert_eq!(s.http_port, 9000);
        assert_eq!(s.framing, Framing::RawUdp);
        assert_eq!(s.chunk_ms, 300);
        assert_eq!(s.fidelity_steps, GenerationParams::MAX_FIDELITY_STEPS);
        assert!(s.session_config(s.generation_params()).carry_context);
        assert_eq!(s.input_port, DEFAULT_INPUT_PORT);
    }

    #[test]
    fn missing_or_broken_settings_file_is_an_error() {
        assert!(load_settings(Path::new("/no/such/settings.json")).is_err());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_settings(&path).is_err());
    }
}
