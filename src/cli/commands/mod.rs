//! CLI parser and command dispatch.

mod engines;
mod process;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use docsift::config::{load_settings, MergePolicyKind};
use docsift::export::ExportFormat;

#[derive(Parser)]
#[command(name = "docsift")]
#[command(about = "Confidence-scored form and text extraction from scanned documents")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Extract text and fields from documents
    Process {
        /// PDF or image files to process, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: ExportFormat,
        /// Output file (one input) or directory (several inputs); stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Learn a template from each completed document
        #[arg(long)]
        learn: bool,
        /// Template JSON files to load before processing
        #[arg(short, long = "template")]
        templates: Vec<PathBuf>,
        /// Write learned templates as JSON into this directory
        #[arg(long)]
        save_templates: Option<PathBuf>,
        /// Merge policy for the OCR ensemble (overrides config)
        #[arg(long, value_enum)]
        merge_policy: Option<MergePolicyKind>,
        /// Hide progress bars
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show configured OCR engines and whether they can run
    Engines,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Process {
            files,
            format,
            output,
            learn,
            templates,
            save_templates,
            merge_policy,
            quiet,
        } => {
            if let Some(policy) = merge_policy {
                settings.ocr.merge_policy = policy;
            }
            process::cmd_process(
                settings,
                process::ProcessOptions {
                    files,
                    format,
                    output,
                    learn,
                    templates,
                    save_templates,
                    quiet,
                },
            )
            .await
        }
        Commands::Engines => engines::cmd_engines(settings).await,
    }
}
