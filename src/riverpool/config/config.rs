use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing::{info, error};

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::node_set::MAX_BACKENDS;

// Things that are not configurable, but might be one day
pub const LISTEN_BACKLOG: u32 = 1024;
/// Read timeout for each reset statement
pub const RESET_TIMEOUT_SECONDS: u64 = 10;
/// How often to check on the client while waiting on a strict statement
pub const KEEPALIVE_INTERVAL_SECONDS: u64 = 30;
/// Pause after a backend reports an administrator or crash shutdown
pub const ADMIN_SHUTDOWN_GRACE_SECONDS: u64 = 5;
/// Pause after asking sessions to drop idle connections before DROP DATABASE
pub const DROP_DATABASE_GRACE_SECONDS: u64 = 5;

#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    /// config_path is the path of the loaded config file
    #[serde(skip)]
    pub config_path: PathBuf,
    /// host to listen on, defaults to 0.0.0.0
    #[serde(default = "default_host")]
    pub host: String,
    /// port to listen on for client connections, default 9999
    #[serde(default = "default_port")]
    pub port: u16,
    /// reuseport is unix only, if true we create a listening socket per worker thread with SO_REUSEPORT options.
    /// this reduces lock contention in the kernel when calling accept. Default false.
    #[serde(default)]
    pub reuseport: bool,
    /// num_workers is the number of tokio worker threads. Default is the number of hardware threads for the host.
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
    /// max_connections to allow before rejecting new clients. Default 1000.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// connect_timeout_seconds bounds connecting to a backend. Default 10.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u32,
    /// backends are the database nodes, in order. The first valid one is the reference node.
    pub backends: Vec<BackendConfig>,
    /// replication_mode sends every write to all backends
    #[serde(default = "default_true")]
    pub replication_mode: bool,
    /// load_balance_mode sends eligible reads to one backend chosen by weight
    #[serde(default)]
    pub load_balance_mode: bool,
    /// parallel_mode runs simple queries on every backend concurrently and sums write row counts
    #[serde(default)]
    pub parallel_mode: bool,
    /// replication_stop_on_mismatch ends the session when backends answer with different message kinds,
    /// otherwise the statement fails and the session ends with an error
    #[serde(default)]
    pub replication_stop_on_mismatch: bool,
    /// reset_query_list runs in order on every backend when a client disconnects
    #[serde(default = "default_reset_query_list")]
    pub reset_query_list: Vec<String>,
    /// client_idle_limit closes a client after this many seconds without activity. 0 disables it.
    #[serde(default)]
    pub client_idle_limit: i32,
    /// client_idle_limit_in_recovery applies while a node is being recovered.
    /// 0 disables it, -1 closes clients as soon as recovery starts.
    #[serde(default)]
    pub client_idle_limit_in_recovery: i32,
    /// ignore_leading_white_space skips white space before deciding whether a query is a SELECT
    #[serde(default = "default_true")]
    pub ignore_leading_white_space: bool,
    /// log_statement logs every client statement
    #[serde(default)]
    pub log_statement: bool,
    /// log_per_node_statement logs every statement sent to each node
    #[serde(default)]
    pub log_per_node_statement: bool,
    /// load_balance_seed makes the load balancing choices repeatable
    #[serde(default)]
    pub load_balance_seed: Option<u64>,
    /// relcache_size is the number of relation cache entries per session
    #[serde(default = "default_relcache_size")]
    pub relcache_size: usize,
}

#[derive(Deserialize, Clone, Debug)]
pub struct BackendConfig {
    /// host to connect to, defaults to localhost
    #[serde(default = "default_backend_host")]
    pub host: String,
    /// port to connect to, defaults to 5432
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// weight is the relative share of load balanced reads, default 1
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_num_workers() -> u32 { num_cpus::get() as u32 }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_backend_host() -> String { "localhost".to_string() }
fn default_reset_query_list() -> Vec<String> { vec!["ABORT".to_string(), "DISCARD ALL".to_string()] }
const fn default_port() -> u16 { 9999 }
const fn default_backend_port() -> u16 { 5432 }
const fn default_max_connections() -> u32 { 1000 }
const fn default_connect_timeout_seconds() -> u32 { 10 }
const fn default_weight() -> f64 { 1.0 }
const fn default_relcache_size() -> usize { 256 }
const fn default_true() -> bool { true }

impl Settings {
    /// load validates the settings after they are deserialized
    pub(crate) fn load(&mut self, path: PathBuf) -> Result<()> {
        self.config_path = path;
        if self.backends.is_empty() {
            return Err(Error::new("at least one backend is required"));
        }
        if self.backends.len() > MAX_BACKENDS {
            return Err(Error::new(format!("too many backends, the maximum is {}", MAX_BACKENDS)));
        }
        for (i, backend) in self.backends.iter().enumerate() {
            if !(backend.weight >= 0.0) {
                return Err(Error::new(format!("backend {} weight cannot be negative", i)));
            }
        }
        if self.reset_query_list.iter().any(|q| q.trim().is_empty()) {
            return Err(Error::new("reset_query_list cannot contain empty statements"));
        }
        if self.client_idle_limit < 0 {
            return Err(Error::new("client_idle_limit cannot be negative"));
        }
        if self.client_idle_limit_in_recovery < -1 {
            return Err(Error::new("client_idle_limit_in_recovery cannot be less than -1"));
        }
        if self.num_workers == 0 {
            self.num_workers = default_num_workers();
        }
        if self.relcache_size == 0 {
            self.relcache_size = default_relcache_size();
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn num_backends(&self) -> usize {
        self.backends.len()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.backends.iter().map(|b| b.weight).collect()
    }

    /// has_idle_limits is true when the dispatch loop needs a periodic tick
    pub fn has_idle_limits(&self) -> bool {
        self.client_idle_limit > 0 || self.client_idle_limit_in_recovery != 0
    }
}

/// ConfigHandle holds the current settings snapshot. A reload swaps in a new snapshot and bumps
/// the generation. Sessions compare generations between requests and pick up the new snapshot.
pub struct ConfigHandle {
    current: RwLock<Arc<Settings>>,
    generation: AtomicU64,
}

impl ConfigHandle {
    pub fn new(settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(settings)),
            generation: AtomicU64::new(0),
        })
    }

    /// get returns the current snapshot
    pub fn get(&self) -> Arc<Settings> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// replace installs settings as the new snapshot
    pub fn replace(&self, settings: Settings) -> Result<()> {
        let mut guard = self.current.write()?;
        *guard = Arc::new(settings);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// reload re-reads the file the current snapshot came from. On error the old snapshot is kept.
    pub fn reload(&self) -> Result<()> {
        let path = self.get().config_path.clone();
        match super::load::load_config_file(path) {
            Ok(settings) => {
                if settings.num_backends() != self.get().num_backends() {
                    error!("the number of backends cannot change on reload, keeping the old configuration");
                    return Err(Error::new("number of backends changed"));
                }
                self.replace(settings)?;
                info!(generation = self.generation(), "reloaded configuration");
                Ok(())
            },
            Err(e) => {
                error!(%e, "reloading configuration failed, keeping the old configuration");
                Err(e)
            }
        }
    }
}

/// watch_reload_signal reloads the configuration on every SIGHUP
#[cfg(unix)]
pub async fn watch_reload_signal(handle: Arc<ConfigHandle>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    while hangups.recv().await.is_some() {
        info!("received SIGHUP");
        let _ = handle.reload();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(yaml: &str) -> Result<Settings> {
        let mut s: Settings = serde_yaml::from_str(yaml)?;
        s.load(PathBuf::from("riverpool.yaml"))?;
        Ok(s)
    }

    #[test]
    fn test_defaults() {
        let s = settings("backends:\n  - host: db1\n  - port: 5433\n    weight: 2\n").unwrap();
        assert_eq!(s.port, 9999);
        assert_eq!(s.backends[0].host, "db1");
        assert_eq!(s.backends[0].port, 5432);
        assert_eq!(s.backends[1].host, "localhost");
        assert_eq!(s.weights(), vec![1.0, 2.0]);
        assert_eq!(s.reset_query_list, vec!["ABORT", "DISCARD ALL"]);
        assert!(s.replication_mode);
        assert!(!s.has_idle_limits());
        assert_eq!(s.listen_address(), "0.0.0.0:9999");
    }

    #[test]
    fn test_validation() {
        assert!(settings("backends: []\n").is_err());
        assert!(settings("backends:\n  - weight: -1\n").is_err());
        assert!(settings("client_idle_limit_in_recovery: -2\nbackends:\n  - host: a\n").is_err());
        assert!(settings("reset_query_list: ['  ']\nbackends:\n  - host: a\n").is_err());
        let s = settings("client_idle_limit_in_recovery: -1\nbackends:\n  - host: a\n").unwrap();
        assert!(s.has_idle_limits());
    }

    #[test]
    fn test_handle_generation() {
        let s = settings("backends:\n  - host: a\n").unwrap();
        let handle = ConfigHandle::new(s.clone());
        assert_eq!(handle.generation(), 0);
        let mut next = s;
        next.log_statement = true;
        handle.replace(next).unwrap();
        assert_eq!(handle.generation(), 1);
        assert!(handle.get().log_statement);
    }
}
