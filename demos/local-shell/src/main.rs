//! Line-oriented shell over a resilient local session.
//!
//! Run with: cargo run -p local-shell-demo
//!
//! Each line is executed in the same shell, so `cd` and `export` persist.
//! `:quit` detaches and leaves the shell running, `:close` ends it, and
//! `:sweep` runs one reaper pass.
//!
//! Environment:
//! - `RSH_HOST` - host name the local platform answers to (default `localhost`)
//! - `RSH_CONVERSATION` / `RSH_AGENT` - session key (default `demo` / `shell`)
//! - `RSH_DATABASE_URL` - SQLite registry, when built with `--features sqlite`

use std::{env, error::Error, sync::Arc, time::Duration};

use remote_shell_core::{
    ClientConfig, ExecOptions, ReaperConfig, RemotePlatform, SessionRegistry,
};
use remote_shell_pty::LocalPtyPlatform;
use remote_shell_session::{ResolveOptions, SessionManager, StaleSessionReaper};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[cfg(feature = "sqlite")]
async fn open_registry() -> Result<Arc<dyn SessionRegistry>, Box<dyn Error>> {
    use remote_shell_session::storage::{MemoryRegistry, SqliteRegistry};

    match env::var("RSH_DATABASE_URL") {
        Ok(url) => {
            tracing::info!(%url, "Using SQLite registry");
            Ok(Arc::new(SqliteRegistry::new(&url).await?))
        }
        Err(_) => Ok(Arc::new(MemoryRegistry::new())),
    }
}

#[cfg(not(feature = "sqlite"))]
#[allow(clippy::unused_async)]
async fn open_registry() -> Result<Arc<dyn SessionRegistry>, Box<dyn Error>> {
    if env::var_os("RSH_DATABASE_URL").is_some() {
        tracing::warn!("RSH_DATABASE_URL ignored; rebuild with --features sqlite");
    }
    Ok(Arc::new(remote_shell_session::storage::MemoryRegistry::new()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let host = var_or("RSH_HOST", "localhost");
    let conversation = var_or("RSH_CONVERSATION", "demo");
    let agent = var_or("RSH_AGENT", "shell");

    let platform: Arc<dyn RemotePlatform> = Arc::new(LocalPtyPlatform::new(host.clone()));
    let registry = open_registry().await?;

    let reaper = StaleSessionReaper::new(Arc::clone(&platform), Arc::clone(&registry));
    let reaper_config = ReaperConfig::default();
    let reaper_handle = reaper.clone().spawn(reaper_config.clone());

    let manager = SessionManager::new(
        platform,
        registry,
        ClientConfig::default().with_exec_timeout(Duration::from_secs(120)),
    );

    let cwd = env::current_dir()
        .ok()
        .map(|dir| dir.to_string_lossy().into_owned());
    let resolve_options = match cwd {
        Some(cwd) => ResolveOptions::new().cwd(cwd),
        None => ResolveOptions::new(),
    };

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout.write_all(b"rsh> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            ":quit" => break,
            ":close" => {
                let closed = manager.close_for_conversation(&conversation, &agent).await?;
                println!("closed {closed} session(s)");
                break;
            }
            ":sweep" => {
                let report = reaper
                    .sweep(reaper_config.max_idle, reaper_config.retention)
                    .await?;
                println!(
                    "closed {} stale, deleted {} old",
                    report.closed_stale, report.deleted
                );
                continue;
            }
            _ => {}
        }

        let (mut client, reused) = manager
            .resolve(&host, &conversation, &agent, &resolve_options)
            .await?;
        if !reused {
            println!("[new session {}]", client.remote_session_id());
        }

        match client.execute(line, &ExecOptions::new()).await {
            Ok(result) => {
                if !result.stdout.is_empty() {
                    println!("{}", result.stdout);
                }
                if !result.stderr.is_empty() {
                    eprintln!("{}", result.stderr);
                }
                if !result.success() {
                    println!("[exit {} in {} ms]", result.exit_code, result.duration_ms);
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    reaper_handle.shutdown().await;
    Ok(())
}
