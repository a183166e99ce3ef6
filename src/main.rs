// ABOUTME: Command-line entry point: one-shot execution commands plus the long-running serve mode

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use execbox::policy::DataSensitivity;
use execbox::{AppConfig, ExecService, SessionKey};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "execbox", version, about = "Sandboxed code execution for autonomous agents")]
struct Cli {
    /// Config file path; overrides EXECBOX_CONFIG and ~/.execbox/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a code cell in a session's notebook
    Exec {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
        /// Inline source; reads stdin when neither this nor --file is given
        code: Option<String>,
        #[arg(long, short = 'f', conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Invoke a capability script inside the session's sandbox
    Invoke {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
        capability: String,
        script: String,
        /// Arguments passed through to the script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Raise a session's data sensitivity level (never lowers it)
    Mark {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
        /// public, internal, confidential or secret
        level: DataSensitivity,
    },
    /// Export a session's notebook as a Jupyter document
    Export {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
        /// Write to this file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Inspect or clean up sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Run the egress gateway with periodic idle cleanup
    Serve {
        /// TCP listen address; falls back to gateway.listen_addr in config
        #[arg(long)]
        listen: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List every session
    List,
    /// Destroy environments idle past the configured threshold
    Cleanup,
    /// Permanently delete a session, workspace included
    Delete {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let service = ExecService::new(config)?;

    match cli.command {
        Commands::Exec {
            tenant,
            session,
            code,
            file,
            timeout,
        } => {
            let source = read_source(code, file)?;
            let key = SessionKey::new(tenant, session);
            let record = service
                .execute(&key, &source, timeout.map(Duration::from_secs))
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Invoke {
            tenant,
            session,
            capability,
            script,
            args,
            timeout,
        } => {
            let key = SessionKey::new(tenant, session);
            let result = service
                .invoke_capability(
                    &key,
                    &capability,
                    &script,
                    &args,
                    timeout.map(Duration::from_secs),
                )
                .await?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if !result.success() {
                std::process::exit(if result.timed_out { 124 } else { result.exit_code.max(1) });
            }
        }
        Commands::Mark {
            tenant,
            session,
            level,
        } => {
            let key = SessionKey::new(tenant, session);
            let record = service.mark_sensitivity(&key, level).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Export {
            tenant,
            session,
            output,
        } => {
            let key = SessionKey::new(tenant, session);
            let ipynb = service.export_notebook(&key).await?;
            let json = serde_json::to_string_pretty(&ipynb)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Commands::Sessions { command } => match command {
            SessionsCommand::List => {
                let sessions = service.list_sessions()?;
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            }
            SessionsCommand::Cleanup => {
                let destroyed = service.cleanup_idle();
                println!("destroyed {destroyed} idle environment(s)");
            }
            SessionsCommand::Delete { tenant, session } => {
                let key = SessionKey::new(tenant, session);
                service.delete_session(&key)?;
                println!("deleted {key}");
            }
        },
        Commands::Serve { listen } => serve(&service, listen).await?,
    }

    Ok(())
}

/// Runs the shared TCP gateway (sessions always get their unix-socket legs
/// regardless) and sweeps idle environments on the configured interval.
async fn serve(service: &ExecService, listen: Option<String>) -> Result<()> {
    let gateway = service
        .gateway()
        .context("serve requires at least one [gateway] allow entry in the config")?;

    let addr = listen
        .or_else(|| service.config().gateway.listen_addr.clone())
        .unwrap_or_else(|| "127.0.0.1:3128".to_string());
    let addr = addr
        .parse()
        .with_context(|| format!("invalid listen address '{addr}'"))?;

    let handle = gateway.serve_tcp(addr).await?;
    info!(addr = %handle.local_addr(), "gateway up; press ctrl-c to stop");

    let mut ticker = tokio::time::interval(service.config().cleanup_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let destroyed = service.cleanup_idle();
                if destroyed > 0 {
                    info!(destroyed, "idle environments destroyed");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                info!("shutting down");
                break;
            }
        }
    }

    drop(handle);
    Ok(())
}

fn read_source(code: Option<String>, file: Option<PathBuf>) -> Result<String> {
    match (code, file) {
        (Some(code), _) => Ok(code),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display())),
        (None, None) => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("failed to read source from stdin")?;
            Ok(source)
        }
    }
}

fn setup_logging() {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "execbox=info".into()),
        )
        .init();
}
