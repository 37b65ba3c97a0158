//! Command-line interface.
//!
//! Every tuning flag is optional: unset flags fall back to the settings file
//! (`--settings`), then to built-in defaults.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use voxbridge_core::Framing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Persistent RTP/UDP stream conversion until SIGINT/SIGTERM.
    #[default]
    #[value(alias = "rtp")]
    Stream,
    /// HTTP request/response conversion API.
    Http,
    /// Convert one file and exit.
    File,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Stream => "stream",
            Mode::Http => "http",
            Mode::File => "file",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FramingArg {
    Rtp,
    Udp,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Rtp => Framing::Rtp,
            FramingArg::Udp => Framing::RawUdp,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "voxbridge", version, about = "Real-time voice conversion server")]
pub struct Cli {
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Target-voice reference WAV (required for stream and file modes; the
    /// HTTP default when requests carry none).
    #[arg(long)]
    pub reference: Option<PathBuf>,

    #[arg(long)]
    pub input_port: Option<u16>,

    #[arg(long)]
    pub output_port: Option<u16>,

    #[arg(long)]
    pub output_host: Option<String>,

    /// Address the RTP input and the HTTP API bind to.
    #[arg(long)]
    pub bind_host: Option<String>,

    /// HTTP API port. In stream mode, 0 disables the health API.
    #[arg(long)]
    pub http_port: Option<u16>,

    #[arg(long, value_enum)]
    pub framing: Option<FramingArg>,

    #[arg(long)]
    pub jitter_latency_ms: Option<u32>,

    #[arg(long, alias = "diffusion-steps")]
    pub fidelity_steps: Option<u32>,

    #[arg(long)]
    pub chunk_ms: Option<u32>,

    #[arg(long)]
    pub overlap_ms: Option<u32>,

    /// JSON settings file.
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Input WAV for file mode.
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Output WAV for file mode.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_flags() {
        let cli = Cli::try_parse_from([
            "voxbridge",
            "--mode",
            "stream",
            "--reference",
            "ref.wav",
            "--input-port",
            "6000",
            "--framing",
            "udp",
            "--chunk-ms",
            "240",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(Mode::Stream));
        assert_eq!(cli.reference, Some(PathBuf::from("ref.wav")));
        assert_eq!(cli.input_port, Some(6000));
        assert_eq!(cli.framing.map(Framing::from), Some(Framing::RawUdp));
        assert_eq!(cli.chunk_ms, Some(240));
        assert_eq!(cli.output_port, None);
    }

    #[test]
    fn rtp_is_an_alias_for_stream() {
        let cli = Cli::try_parse_from(["voxbridge", "--mode", "rtp"]).unwrap();
        assert_eq!(cli.mode, Some(Mode::Stream));
    }

    #[test]
    fn diffusion_steps_alias() {
        let cli = Cli::try_parse_from(["voxbridge", "--diffusion-steps", "25"]).unwrap();
        assert_eq!(cli.fidelity_steps, Some(25));
    }

    #[test]
    fn rejects_unknown_mode_and_bad_port() {
        assert!(Cli::try_parse_from(["voxbridge", "--mode", "gui"]).is_err());
        assert!(Cli::try_parse_from(["voxbridge", "--input-port", "70000"]).is_err());
    }
}
