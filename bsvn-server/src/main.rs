//! bsvnserve - serve bsvn repositories over the svn protocol

use anyhow::{Context, Result};
use bsvn_ra::Conn;
use bsvn_server::{ServeConfig, ServeContext, serve_connection};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "bsvnserve")]
#[command(author = "BSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Serve bsvn repositories over the svn protocol", long_about = None)]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:3690")]
    listen: String,

    /// Directory the served repositories live under
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Server configuration file (default: <root>/conf/svnserve.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve a single session over stdin/stdout
    #[arg(short, long)]
    tunnel: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };

    // stdout carries the protocol in tunnel mode
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn serve_stdio(ctx: &ServeContext) -> Result<()> {
    let mut conn = Conn::new(Box::new(std::io::stdin()), Box::new(std::io::stdout()));
    serve_connection(&mut conn, ctx).context("tunnel session failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("repository root {} not found", cli.root.display()))?;
    let config = ServeConfig::locate(&root, cli.config.as_deref())?;
    let ctx = Arc::new(ServeContext::new(root, config));

    if cli.tunnel {
        return tokio::task::spawn_blocking(move || serve_stdio(&ctx)).await?;
    }

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("failed to listen on {}", cli.listen))?;
    info!("Serving {} on {}", ctx.root.display(), cli.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let stream = match stream.into_std().and_then(|s| s.set_nonblocking(false).map(|()| s)) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("could not hand off connection from {}: {}", peer, e);
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::task::spawn_blocking(move || {
                    info!("connection from {}", peer);
                    let result = Conn::from_tcp(stream).and_then(|mut conn| serve_connection(&mut conn, &ctx));
                    match result {
                        Ok(()) => info!("connection from {} closed", peer),
                        Err(e) => error!("connection from {} failed: {}", peer, e),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                ctx.shutdown.store(true, Ordering::Relaxed);
                break;
            }
        }
    }

    Ok(())
}
