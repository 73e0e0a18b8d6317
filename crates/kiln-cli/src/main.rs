//! kiln CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Run CI jobs in containers or virtual machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job script with the configured executor
    Run {
        /// Path to the runner configuration
        #[arg(long, env = "KILN_CONFIG", default_value = "runner.kdl")]
        config: String,
        /// Job script fed to the build shell
        #[arg(long)]
        script: String,
        /// Unique project name, used to name containers and caches
        #[arg(long)]
        project: String,
        /// Runner identity, defaults to the project name
        #[arg(long)]
        runner: Option<String>,
        /// Cache the working directory between jobs
        #[arg(long)]
        allow_fetch: bool,
        /// Job variable as KEY=VALUE
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,
    },
    /// Validate a runner configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "runner.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            script,
            project,
            runner,
            allow_fetch,
            env,
        } => {
            commands::run::run_job(commands::run::RunArgs {
                config,
                script,
                project,
                runner,
                allow_fetch,
                env,
            })
            .await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
