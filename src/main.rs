use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use ltbvc_audio::config;
use ltbvc_audio::midi;
use ltbvc_audio::pipeline::TargetState;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Audio track generation for lilypond-derived MIDI files
#[derive(Parser)]
#[command(name = "ltbvc-audio")]
#[command(about = "Render per-voice stems from a MIDI file and mix them into audio targets")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// More log output (repeat for debug and trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a MIDI file in the editable text format
    ToText {
        /// Input MIDI file
        input: PathBuf,

        /// Output text file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Build a MIDI file from the text format
    FromText {
        /// Input text file
        input: PathBuf,

        /// Output MIDI file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Render stems and mix targets
    Render {
        /// Project configuration file
        config: PathBuf,

        /// Target to render (repeatable; all targets when omitted)
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },
    /// Validate a project configuration file
    ValidateConfig {
        /// Configuration file to validate
        config: PathBuf,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose > 0 && cli.quiet {
        anyhow::bail!("Cannot specify both --verbose and --quiet");
    }
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::ToText { input, output } => {
            let file = midi::read_file(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let text = midi::to_text(&file);
            match output {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => print!("{}", text),
            }
        }
        Commands::FromText { input, output } => {
            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let file = midi::from_text(&text)
                .with_context(|| format!("Failed to parse {}", input.display()))?;
            midi::write_file(&output, &file)
                .with_context(|| format!("Failed to write {}", output.display()))?;
        }
        Commands::Render { config, targets } => {
            let project = config::load_config(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            let source = midi::read_file(&project.midi_file)
                .with_context(|| format!("Failed to read {}", project.midi_file.display()))?;

            let orchestrator = project.orchestrator(source)?;
            let names = if targets.is_empty() {
                project.target_names()
            } else {
                targets
            };
            let reports = orchestrator.run_batch(&names).await?;

            let mut failed = 0;
            for report in &reports {
                match &report.state {
                    TargetState::Done(path) => {
                        if !cli.quiet {
                            println!("{}: done ({})", report.target, path.display());
                        }
                    }
                    TargetState::Failed(failure) => {
                        failed += 1;
                        println!("{}: failed: {}", report.target, failure);
                    }
                    other => println!("{}: {}", report.target, other.label()),
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} target(s) failed", failed, reports.len());
            }
        }
        Commands::ValidateConfig { config } => {
            let project = config::load_config(&config)?;
            println!("Configuration is valid");
            println!("{}", serde_json::to_string_pretty(&project)?);
        }
    }

    Ok(())
}
