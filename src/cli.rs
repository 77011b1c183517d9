use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "genroute")]
#[command(about = "Multi-provider generation gateway with ranked fallback and per-model cooldown")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Also write logs to a daily rotated file in the data directory
    #[arg(long)]
    pub log_file: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one request through the fallback cascade
    Generate {
        /// Logical endpoint id (lesson-plan, exercises, flux-images, ...)
        #[arg(short, long)]
        endpoint: String,

        /// Content type: text or image
        #[arg(long, default_value = "text")]
        content_type: String,

        /// Prompt text, used when no --payload is given
        #[arg(short, long)]
        prompt: Option<String>,

        /// Raw JSON object payload
        #[arg(long)]
        payload: Option<String>,

        /// Try this provider first
        #[arg(long)]
        provider: Option<String>,

        /// Try this model first within each provider
        #[arg(short, long)]
        model: Option<String>,

        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Attempts per model
        #[arg(long)]
        max_retries: Option<u32>,

        /// Deadline for the whole request in seconds
        #[arg(long)]
        deadline: Option<f64>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,

        /// Afterwards print provider stats, metrics and recommendations to stderr
        #[arg(long)]
        stats: bool,
    },

    /// List providers and model status
    Providers {
        /// Restrict to one content type
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Probe every provider and print health status
    Health,

    /// Write the default configuration file
    ConfigInit {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
