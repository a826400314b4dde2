// Meshlink Linux: LAN beacon discovery, peer mesh, console.

mod config;
mod discovery;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use meshlink_core::Coordinator;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, PartialEq)]
struct Args {
    version: bool,
    name: Option<String>,
    config: Option<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--name" => out.name = Some(args.next().context("--name needs a value")?),
            "--config" => {
                out.config = Some(args.next().context("--config needs a value")?.into())
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("meshlink-linux {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(name) = args.name {
        cfg.service_name = name;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg));
    // Stdin is read on a blocking thread that never returns on its own.
    rt.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let discovery = discovery::BeaconDiscovery::bind(cfg.beacon_settings()?)
        .with_context(|| format!("binding discovery port {}", cfg.discovery_port))?;
    let mesh = Coordinator::new(cfg.mesh_config(), Arc::new(discovery), Arc::new(sink::ConsoleSink));

    let port = mesh.start(&cfg.service_name).await?;
    println!(
        "meshlink {} listening on port {}, service {:?}",
        VERSION, port, cfg.service_name
    );

    let outcome = tokio::select! {
        r = command_loop(&mesh) => r,
        r = shutdown_signal() => r,
    };
    mesh.tear_down_all().await;
    outcome
}

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Peers,
    Refresh,
    Pause,
    Resume,
    Close,
    Quit,
    Send(&'a str),
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(match line {
            "/peers" => Command::Peers,
            "/refresh" => Command::Refresh,
            "/pause" => Command::Pause,
            "/resume" => Command::Resume,
            "/close" => Command::Close,
            "/quit" => Command::Quit,
            cmd if cmd.starts_with('/') => Command::Unknown(cmd),
            text => Command::Send(text),
        })
    }
}

async fn command_loop(mesh: &Coordinator) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        match command {
            Command::Peers => {
                let peers = mesh.peers().await;
                if peers.is_empty() {
                    println!("* no peers");
                }
                for p in peers {
                    let port = p.dial_port.map_or_else(|| "-".to_string(), |p| p.to_string());
                    let published = if p.published { "published" } else { "unpublished" };
                    println!("* {} port {} {} {}", p.identity, port, p.state, published);
                }
            }
            Command::Refresh => mesh.refresh_all().await?,
            Command::Pause => {
                mesh.pause().await;
                println!("* discovery paused");
            }
            Command::Resume => mesh.resume().await?,
            Command::Close => mesh.close_all().await,
            Command::Quit => return Ok(()),
            Command::Send(text) => {
                let sent = mesh.broadcast(text).await;
                println!("* sent to {sent} peer(s)");
            }
            Command::Unknown(cmd) => {
                println!("* unknown command {cmd}; try /peers /refresh /pause /resume /close /quit")
            }
        }
    }
    Ok(())
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
    tracing::info!("Shutdown signal received");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_flags() {
        assert_eq!(
            args(&["--name", "lab", "--config", "/tmp/m.toml"]).unwrap(),
            Args {
                version: false,
                name: Some("lab".into()),
                config: Some("/tmp/m.toml".into()),
            }
        );
        assert!(args(&["-V"]).unwrap().version);
        assert!(args(&["--name"]).is_err());
        assert!(args(&["--bogus"]).is_err());
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("  "), None);
        assert_eq!(Command::parse("/peers"), Some(Command::Peers));
        assert_eq!(Command::parse("/quit\n"), Some(Command::Quit));
        assert_eq!(Command::parse("/nope"), Some(Command::Unknown("/nope")));
        assert_eq!(Command::parse(" hello there "), Some(Command::Send("hello there")));
    }
}
