// FFLC node: listener, direct messages, group chat consensus, console.

mod console;

use std::path::PathBuf;

use anyhow::Context;
use fflc_core::Identity;
use fflc_node::{config, Node};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fflc-node {}", VERSION);
                return Ok(());
            }
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cfg = match config_path {
        Some(path) => config::load_from(&path)?,
        None => config::load(),
    };
    let identity = Identity::generate();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads.max(1))
        .enable_all()
        .build()?;
    rt.block_on(async {
        let (node, mut inbound) = Node::bind(cfg, identity).await?;
        eprintln!("fflc-node v{}", VERSION);
        eprintln!("id:  {}", node.local_id());
        eprintln!("key: {}", node.public_key());
        eprintln!("listening on {}", node.local_addr());

        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                console::print_inbound(&message);
            }
        });

        tokio::select! {
            r = console::run(&node) => r?,
            r = shutdown_signal() => r?,
        }
        node.shutdown();
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
