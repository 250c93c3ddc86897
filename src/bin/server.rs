//! ZRP Server Binary
//!
//! Usage: zrp-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a configuration template
//!   -h, --help           Print help information

use std::env;

use zrp::server::{Server, ServerConfig};

fn main() -> anyhow::Result<()> {
    // Initialize tracing — respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            print!("{}", ServerConfig::template());
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                std::process::exit(2);
            }
            let config = ServerConfig::load(&args[2])?;
            runtime()?.block_on(run_server(config))?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
            std::process::exit(2);
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"ZRP Server - reverse SOCKS5 proxy, public end

USAGE:
    zrp-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (TOML)
    -g, --generate       Print a configuration template
    -h, --help           Print help information

EXAMPLES:
    Generate a configuration:
        zrp-server --generate > server.toml

    Run the server:
        zrp-server --config server.toml
"#
    );
}

/// Accept loops are I/O bound; size the runtime like the event-loop pools
/// it replaces (2×CPU).
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let server = Server::bind(config)?;

    tokio::select! {
        res = server.run() => res?,
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
