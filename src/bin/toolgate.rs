use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use toolgate::ca::CaStore;
use toolgate::config::Config;
use toolgate::launcher::Launcher;
use toolgate::progress::TerminalProgress;
use toolgate::{Error, Session};
use toolgate_release::{NoProgress, Platform, Progress};
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "toolgate", version, about)]
struct Cli {
    /// YAML or JSON config file
    #[arg(short, long, global = true, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch the tool and run it behind the intercepting proxy
    Run {
        /// Tool version to run (`latest` or `x.y.z`)
        #[arg(long)]
        tool_version: Option<String>,

        /// Client identifier forwarded to the tool
        #[arg(long)]
        client_id: Option<Uuid>,

        /// Run the tool without the proxy
        #[arg(long)]
        no_proxy: bool,

        /// Arguments passed through to the tool
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Resolve and verify the tool binary, then print its cache path
    Fetch {
        #[arg(long)]
        tool_version: Option<String>,

        /// Target platform as `os/arch`, defaults to the host
        #[arg(long)]
        platform: Option<String>,
    },
    /// Serve the intercepting proxy until interrupted
    Proxy,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let guard = init_logging(cli.verbose, cli.log_file.as_deref());

    let code = match run(cli).await {
        Ok(code) => code,
        Err(Error::ChildNonZeroExit { code }) => {
            debug!(code, "tool exited with non-zero status");
            code
        }
        Err(e) => {
            eprintln!("toolgate: {}", e);
            1
        }
    };

    drop(guard);
    std::process::exit(code);
}

async fn run(cli: Cli) -> toolgate::Result<i32> {
    let mut config = Config::resolve(cli.config.as_deref())?;
    let ca = Arc::new(CaStore::new(config.cache_dir.clone()));

    let result = match cli.command {
        Command::Run {
            tool_version,
            client_id,
            no_proxy,
            args,
        } => {
            if let Some(version) = tool_version {
                config.tool.version = version;
            }
            if no_proxy {
                config.proxy.enabled = false;
            }
            config.validate()?;
            let session = Session::new(config, Arc::clone(&ca))?;
            let progress = progress_bar();
            let code = session.run(&args, client_id, progress.as_ref()).await?;
            Ok(code)
        }
        Command::Fetch {
            tool_version,
            platform,
        } => {
            if let Some(version) = tool_version {
                config.tool.version = version;
            }
            config.validate()?;
            let mut session = Session::new(config, Arc::clone(&ca))?;
            if let Some(platform) = platform {
                session = session.with_platform(Platform::parse(&platform)?);
            }
            let progress = progress_bar();
            let path = session.fetch(progress.as_ref()).await?;
            println!("{}", path.display());
            Ok(0)
        }
        Command::Proxy => {
            let launcher = Launcher::from_config(&config.proxy);
            let session = Session::new(config, Arc::clone(&ca))?;
            session
                .serve_proxy(
                    |info| {
                        for (key, value) in launcher.child_env(info) {
                            println!("export {}='{}'", key, value);
                        }
                        eprintln!("proxy listening on 127.0.0.1:{}, Ctrl-C to stop", info.port);
                    },
                    async {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            warn!(error = %e, "failed to wait for Ctrl-C");
                        }
                    },
                )
                .await?;
            Ok(0)
        }
    };

    if let Err(e) = ca.cleanup() {
        warn!(error = %e, "failed to remove CA certificate");
    }
    result
}

fn progress_bar() -> Box<dyn Progress> {
    if std::io::stderr().is_terminal() {
        Box::new(TerminalProgress::new())
    } else {
        Box::new(NoProgress)
    }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "toolgate.log".into());
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Some(guard)
}
