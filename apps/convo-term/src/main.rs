mod bridge;
mod config;
mod logging;

use std::{error::Error, sync::Arc};

use config::TermConfig;
use convo_net::{HttpChatApi, RuntimeConfig, WsConnector, spawn_runtime};
use convo_platform::{FileStateStore, StateStore};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logging::init();

    let config = TermConfig::from_env()?;
    info!(
        server = %config.server_url,
        push = %config.ws_url,
        state_file = %config.state_file.display(),
        page_size = config.pagination.page_size,
        "starting convo-term"
    );

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&config.state_file));
    let api = HttpChatApi::new(config.server_url.clone())?;
    let connector = WsConnector::new(config.ws_url.clone());
    let handle = spawn_runtime(
        api,
        connector,
        store,
        RuntimeConfig {
            pagination: config.pagination,
            ..RuntimeConfig::default()
        },
    );

    bridge::run(handle).await?;
    Ok(())
}
