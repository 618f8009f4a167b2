use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use upstream_sync::git::credentials::{mask_credentials, upstream_remote_url};
use upstream_sync::{init_telemetry, run_blocking, AppContext, SyncOutcome, UpdaterConfig};

#[derive(Parser)]
#[command(name = "upstream-sync")]
#[command(about = "Keep a bot deployment in step with its upstream repository")]
#[command(long_about = "Runs the startup self-update: initializes the working directory as a checkout \
                       of the upstream branch when it is not a repository yet, resets diverged history \
                       to upstream and reinstalls dependencies. Failures are logged, never fatal.")]
struct Cli {
    /// Deployment directory (defaults to the current directory)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync with the upstream repository (default)
    Sync,
    /// Report whether git tooling is available
    Probe,
    /// Run a command line in the deployment directory, the way the dependency install is run
    Run {
        /// Command line, split with shell quoting rules
        command: String,
    },
    /// Print the remote URL that would be used, credentials masked
    Url,
    /// Print the effective configuration, credentials masked
    ShowConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workdir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };

    UpdaterConfig::load_env_file(&workdir)?;
    let config = UpdaterConfig::load_from(&workdir).context("Failed to load configuration")?;
    init_telemetry(&config.observability)?;

    let context = AppContext::new(config, workdir);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            if let SyncOutcome::Failed(failure) = context.sync_upstream() {
                tracing::debug!(error = ?failure, "continuing startup after failed sync");
            }
            Ok(())
        }
        Commands::Probe => {
            println!("{}", context.git);
            Ok(())
        }
        Commands::Run { command } => {
            let result = run_blocking(context.runner.as_ref(), &command, &context.workdir)
                .with_context(|| format!("Failed to run '{command}'"))?;
            if !result.stdout.is_empty() {
                println!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr);
            }
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
            Ok(())
        }
        Commands::Url => {
            let upstream = context.config.sync_config();
            let url = upstream_remote_url(&upstream.repo_url, upstream.git_token.as_deref())?;
            println!("{}", mask_credentials(&url));
            Ok(())
        }
        Commands::ShowConfig => {
            print!("{}", context.config.to_masked_toml()?);
            Ok(())
        }
    }
}
