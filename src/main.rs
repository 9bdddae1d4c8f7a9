use std::env;

use redprobe::{app, build_state_from_env, run_ci, AppConfig, CiConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        None | Some("serve") => serve().await,
        Some("ci") => {
            let Some(path) = args.next() else {
                eprintln!("usage: redprobe ci <config.toml>");
                std::process::exit(redprobe::scan::EXIT_CONFIG_ERROR);
            };
            let ci = match CiConfig::load(&path) {
                Ok(ci) => ci,
                Err(err) => {
                    eprintln!("{err:#}");
                    std::process::exit(redprobe::scan::EXIT_CONFIG_ERROR);
                }
            };
            let config = match AppConfig::from_env() {
                Ok(cfg) => cfg,
                Err(err) => {
                    eprintln!("{err:#}");
                    std::process::exit(redprobe::scan::EXIT_CONFIG_ERROR);
                }
            };
            let code = run_ci(&config, &ci).await;
            std::process::exit(code);
        }
        Some(other) => {
            eprintln!("unknown mode {other:?}; usage: redprobe [serve|ci <config.toml>]");
            std::process::exit(redprobe::scan::EXIT_CONFIG_ERROR);
        }
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    // Build application state from environment variables
    let state = build_state_from_env().await?;
    let app = app(state);

    // Determine port to bind on. Default to 8080 if unspecified.
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();

    // Run the server with graceful shutdown on Ctrl+C
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
