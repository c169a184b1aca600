//! BSvn Administration CLI

mod commands;

use anyhow::{Context, Result};
use bsvn_core::Revnum;
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bsvn-admin")]
#[command(author = "BSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "BSvn repository administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty repository
    Create { path: PathBuf },

    /// Print the youngest revision number
    Youngest { repo: PathBuf },

    /// Print the contents of a file
    Cat {
        repo: PathBuf,
        path: String,
        #[arg(short, long)]
        revision: Option<Revnum>,
    },

    /// List a directory
    Ls {
        repo: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        revision: Option<Revnum>,
        #[arg(short, long)]
        verbose: bool,
        #[arg(short = 'R', long)]
        recursive: bool,
    },

    /// List uncommitted transactions
    Lstxns { repo: PathBuf },

    /// Remove uncommitted transactions
    Rmtxns {
        repo: PathBuf,
        #[arg(required = true)]
        txns: Vec<String>,
    },

    /// Replace the log message of a revision ("-" reads stdin)
    Setlog {
        repo: PathBuf,
        #[arg(short, long)]
        revision: Revnum,
        file: PathBuf,
    },

    /// List locks on and below a path
    Lslocks {
        repo: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },

    /// Remove locks
    Rmlocks {
        repo: PathBuf,
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn read_message(file: &PathBuf) -> Result<Vec<u8>> {
    let mut message = Vec::new();
    if file.as_os_str() == "-" {
        std::io::stdin().read_to_end(&mut message)?;
    } else {
        message = std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
    }
    Ok(message)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Commands::Create { path } => commands::create(&path, &mut out)?,
        Commands::Youngest { repo } => commands::youngest(&commands::open(&repo)?, &mut out)?,
        Commands::Cat { repo, path, revision } => {
            commands::cat(&commands::open(&repo)?, &path, revision, &mut out)?
        }
        Commands::Ls {
            repo,
            path,
            revision,
            verbose,
            recursive,
        } => commands::ls(&commands::open(&repo)?, &path, revision, verbose, recursive, &mut out)?,
        Commands::Lstxns { repo } => commands::lstxns(&commands::open(&repo)?, &mut out)?,
        Commands::Rmtxns { repo, txns } => commands::rmtxns(&commands::open(&repo)?, &txns, &mut out)?,
        Commands::Setlog { repo, revision, file } => {
            let message = read_message(&file)?;
            commands::setlog(&commands::open(&repo)?, revision, &message)?
        }
        Commands::Lslocks { repo, path } => commands::lslocks(&commands::open(&repo)?, &path, &mut out)?,
        Commands::Rmlocks { repo, paths } => commands::rmlocks(&commands::open(&repo)?, &paths, &mut out)?,
    }

    Ok(())
}
