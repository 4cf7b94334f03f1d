use anyhow::Result;
use presenced::commands::Cli;
use presenced::libs::messages::macros::is_debug_mode;

#[tokio::main]
async fn main() -> Result<()> {
    if is_debug_mode() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "presenced=debug".into()),
            )
            .init();
    }

    Cli::menu().await
}
