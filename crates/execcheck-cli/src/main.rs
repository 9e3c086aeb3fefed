mod config;
mod run_cmd;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use config::{ResolvedConfig, RunOverrides};
use run_cmd::RunArgs;

#[derive(Parser)]
#[command(
    name = "execcheck",
    version,
    about = "Verify stdout isolation of concurrent exec processes in a container"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an execcheck config file with default values
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run concurrent exec processes and check each one's stdout
    Run {
        /// Concurrent processes per round
        #[arg(long)]
        count: Option<usize>,
        /// Number of rounds
        #[arg(long)]
        repeat: Option<usize>,
        /// Keep running rounds until one fails (--repeat becomes an upper bound)
        #[arg(long)]
        until_fails: bool,
        /// Per-process timeout in seconds (0 waits forever)
        #[arg(long)]
        timeout: Option<u64>,
        /// Image for the container fixture
        #[arg(long, conflicts_with = "container")]
        image: Option<String>,
        /// Use an existing running container instead of creating one
        #[arg(long)]
        container: Option<String>,
        /// Do not pull the image before creating the container
        #[arg(long)]
        no_pull: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a shell completion script
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Execute the `execcheck init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::default();
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  runtime.image = {}", cfg.runtime.image);
    println!("  run.count = {}", cfg.run.count);
    println!("  run.timeout_secs = {}", cfg.run.timeout_secs);
    println!();
    println!("Next: run `execcheck run` to start a verification.");

    Ok(())
}

fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            if let Err(e) = cmd_init(force) {
                eprintln!("{e:#}");
                std::process::exit(1);
            }
        }
        Commands::Run {
            count,
            repeat,
            until_fails,
            timeout,
            image,
            container,
            no_pull,
            json,
        } => {
            let overrides = RunOverrides {
                image,
                count,
                timeout_secs: timeout,
                repeat,
                no_pull,
                until_fails,
            };
            let result = match ResolvedConfig::resolve(&overrides) {
                Ok(config) => {
                    run_cmd::run_verify(RunArgs {
                        config,
                        container,
                        until_fails,
                        json,
                    })
                    .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => {
                    let code = outcome.exit_code();
                    if code != 0 {
                        std::process::exit(code);
                    }
                }
                Err(e) => {
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Completions { shell } => cmd_completions(shell),
    }

    Ok(())
}
