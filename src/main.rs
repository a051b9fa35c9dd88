use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // RUST_LOG overrides; library `log` records are bridged into the subscriber.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = memberdir_lib::serve().await {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }
}
