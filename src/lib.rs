pub mod riverpool;
#[cfg(test)]
mod tests;

pub use crate::riverpool::*;

use std::io;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::riverpool::config::{load_config, ConfigHandle, Settings};
use crate::riverpool::pg::NodeStatusTable;
use crate::riverpool::server::{PoolService, Shared};

/// init_tracing installs the global subscriber. Filtering follows RIVERPOOL_LOG
/// (e.g. RIVERPOOL_LOG=riverpool=debug), defaulting to info.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_env("RIVERPOOL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::new(format!("setting default subscriber failed: {}", e)))
}

/// Load the configuration settings from riverpool.yaml
/// See riverpool::config::load_config for more info.
pub fn init_settings() -> Result<Arc<ConfigHandle>> {
    Ok(ConfigHandle::new(load_config("riverpool.yaml")?))
}

pub fn init_runtime(conf: &Settings) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(conf.num_workers as usize)
        .enable_all()
        .build()
}

pub fn run_servers(config: Arc<ConfigHandle>, tokio: &Runtime) -> Result<()> {
    tokio.block_on(async move {
        let conf = config.get();
        let status = Arc::new(NodeStatusTable::new(conf.num_backends()));
        let shared = Shared::new(config.clone(), status);

        #[cfg(unix)]
        {
            let config = config.clone();
            tokio::spawn(async move {
                if let Err(e) = crate::riverpool::config::watch_reload_signal(config).await {
                    error!(%e, "could not install the SIGHUP handler");
                }
            });
        }

        // With reuseport there's one listener per worker thread, which spreads accepted sockets
        // across workers and reduces contention in accept.
        let num_listeners = if conf.reuseport { conf.num_workers } else { 1 };
        let mut handles = Vec::new();
        for _ in 0..num_listeners {
            let service = PoolService::new(conf.listen_address(), conf.reuseport, shared.clone())?;
            handles.push(tokio::spawn(async move { service.run().await }));
        }
        info!(listeners = num_listeners, backends = conf.num_backends(), "riverpool started");

        // Wait for all listener tasks to shutdown
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!(%e, "listener task failed");
            }
        }
        Ok::<(), Error>(())
    })
}
