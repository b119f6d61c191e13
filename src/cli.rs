//! Command-line surface: exactly `-c <path>`, `-t`, `--help`, `--version`.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "sni-gateway", version, about = "A Layer-4 TLS-aware reverse proxy that routes on the ClientHello SNI")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: String,

    /// Parse and validate the configuration, then exit without starting
    /// the proxy. Exits nonzero if the config is invalid.
    #[arg(short = 't', long = "test")]
    pub test: bool,
}

/// Exit codes: 0 success, 1 config error, 2 bind error, 3
/// runtime fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    ConfigError = 1,
    BindError = 2,
    RuntimeFatal = 3,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}
