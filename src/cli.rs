//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OCR Gateway - authentication, authorization, and rate limiting for the
/// receipt OCR services
#[derive(Parser, Debug)]
#[command(name = "ocr-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OCR_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OCR_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OCR_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OCR_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OCR_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Mark this instance as production (forbids the credential fallback)
    #[arg(long)]
    pub production: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate the configuration, then exit
    CheckConfig,
}
