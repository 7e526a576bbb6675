//! Isolate server - Linux sandbox with an HTTP API and persistent sessions.
//!
//! Usage:
//!   isolate-server serve [--port 8080]                 # Start HTTP server
//!   isolate-server run --language python [FILE]        # One-shot execution

#[cfg(target_os = "linux")]
use clap::{Args, Parser, Subcommand};

#[cfg(target_os = "linux")]
#[derive(Parser, Debug)]
#[command(name = "isolate-server")]
#[command(about = "Linux sandbox with HTTP API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory for sandbox roots and kept library templates
    #[arg(long, global = true, default_value = "/tmp/isolate")]
    sandbox_dir: std::path::PathBuf,

    #[command(flatten)]
    limits: LimitArgs,
}

#[cfg(target_os = "linux")]
#[derive(Args, Debug)]
struct LimitArgs {
    /// CPU time limit in milliseconds
    #[arg(long, global = true, default_value = "300000")]
    time: u64,

    /// Memory limit in KB
    #[arg(long, global = true, default_value = "2097152")]
    mem: u64,

    /// Maximum file size in KB
    #[arg(long, global = true, default_value = "1048576")]
    fsize: u64,

    /// Maximum number of open files
    #[arg(long, global = true, default_value = "256")]
    nofile: u64,
}

#[cfg(target_os = "linux")]
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: std::net::IpAddr,

        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Run code once in a fresh sandbox and exit with its exit code
    Run {
        #[arg(long, value_enum, default_value = "python")]
        language: isolate_server::Language,

        /// Keep installed libraries for later runs of the same language
        #[arg(long)]
        keep_template: bool,

        /// Library to install before running (repeatable)
        #[arg(long = "library")]
        libraries: Vec<String>,

        /// Source file; reads stdin when omitted or "-"
        file: Option<std::path::PathBuf>,
    },
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use anyhow::Context;
    use isolate_server::sandbox::NamespaceSandboxFactory;
    use isolate_server::{AppState, SandboxLimits, ServerConfig};
    use std::sync::Arc;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Must be root
    if !nix::unistd::geteuid().is_root() {
        anyhow::bail!("must run as root (need CAP_SYS_ADMIN for namespaces)");
    }

    let limits = SandboxLimits {
        time_ms: cli.limits.time,
        mem_kb: cli.limits.mem,
        fsize_kb: cli.limits.fsize,
        nofile: cli.limits.nofile,
    };
    std::fs::create_dir_all(&cli.sandbox_dir)
        .with_context(|| format!("creating {}", cli.sandbox_dir.display()))?;
    let environments = Arc::new(NamespaceSandboxFactory::new(&cli.sandbox_dir, limits.clone()));
    let state = AppState::new(environments);

    match cli.command {
        Commands::Serve { host, port } => {
            let config = ServerConfig {
                host,
                port,
                sandbox_dir: cli.sandbox_dir,
                limits,
            };
            isolate_server::http_server::run_server(&config, state, shutdown_signal()).await?;
        }
        Commands::Run {
            language,
            keep_template,
            libraries,
            file,
        } => {
            let code = read_source(file.as_deref()).await?;
            let output = state
                .ephemeral
                .execute(code, language, keep_template, libraries)
                .await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            std::process::exit(output.exit_code);
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn read_source(file: Option<&std::path::Path>) -> anyhow::Result<String> {
    use anyhow::Context;
    use tokio::io::AsyncReadExt;

    match file {
        Some(path) if path != std::path::Path::new("-") => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        _ => {
            let mut code = String::new();
            tokio::io::stdin()
                .read_to_string(&mut code)
                .await
                .context("reading stdin")?;
            Ok(code)
        }
    }
}

#[cfg(target_os = "linux")]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("This program only works on Linux.");
    std::process::exit(1);
}
