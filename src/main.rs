use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use webhookhub::config::Config;
use webhookhub::http_server::{self, AppState};
use webhookhub::logging;
use webhookhub::store::{EventStore, FileStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;
    logging::init(config.log_format);

    let store: Arc<dyn EventStore> = match &config.data_dir {
        Some(dir) => {
            info!("using durable store at {}", dir.display());
            Arc::new(
                FileStore::open(dir.clone())
                    .await
                    .with_context(|| format!("failed to open store at {}", dir.display()))?,
            )
        }
        None => {
            info!("no data dir configured, history is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let state = Arc::new(AppState::new(
        store,
        config.public_url(),
        config.subscriber_buffer,
    ));
    http_server::start(&config, state).await
}
