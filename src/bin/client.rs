//! ZRP Client Binary
//!
//! Usage: zrp-client [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a configuration template
//!   -h, --help           Print help information

use std::env;

use zrp::client::{Client, ClientConfig};

fn main() -> anyhow::Result<()> {
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
            print!("{}", ClientConfig::template());
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                std::process::exit(2);
            }
            let config = ClientConfig::load(&args[2])?;
            runtime()?.block_on(run_client(config))?;
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
        r#"ZRP Client - reverse SOCKS5 proxy, private-network end

USAGE:
    zrp-client [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file (JSON)
    -g, --generate       Print a configuration template
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "server_host": "proxy.example.com",
        "server_port": 4900,
        "client_key": "ZC-BCE92F671DD2"   (optional, generated when absent)
    }}

EXAMPLES:
    Generate a configuration:
        zrp-client --generate > client.json

    Run the client:
        zrp-client --config client.json
"#
    );
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4);
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
}

async fn run_client(config: ClientConfig) -> anyhow::Result<()> {
    let client = Client::new(config)?;
    tracing::info!("client key: {}", client.client_key());

    tokio::select! {
        res = client.run() => res?,
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
