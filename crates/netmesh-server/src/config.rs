use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Pending + authenticated connections admitted at once.
    pub max_connections: usize,
    /// Base inactivity unit; a connection is closed after two of these
    /// pass without a successful read.
    pub connection_timeout: Duration,
    /// Write-idle interval after which the server emits a HEARTBEAT.
    pub heartbeat_interval: Duration,
    /// Outbound queue capacity per connection, in frames.
    pub buffer_size: usize,
    /// Tokio worker threads; 0 keeps the runtime default.
    pub worker_threads: usize,
    pub rate_limit_per_minute: u32,
    /// Holds the server key file and the SQLite database.
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 100,
            connection_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            buffer_size: 256,
            worker_threads: 0,
            rate_limit_per_minute: 60,
            data_dir: PathBuf::from("./netmesh-data"),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("NETMESH_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("NETMESH_PORT") {
            config.port = port;
        }
        if let Some(n) = env_parse("NETMESH_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(secs) = env_parse::<u64>("NETMESH_CONNECTION_TIMEOUT_SECS") {
            config.connection_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("NETMESH_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("NETMESH_BUFFER_SIZE") {
            config.buffer_size = n;
        }
        if let Some(n) = env_parse("NETMESH_WORKER_THREADS") {
            config.worker_threads = n;
        }
        if let Some(n) = env_parse("NETMESH_RATE_LIMIT_PER_MINUTE") {
            config.rate_limit_per_minute = n;
        }
        if let Ok(dir) = std::env::var("NETMESH_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The fatal read-idle window. Strictly greater than the heartbeat
    /// interval so a responsive peer never trips it.
    pub fn reader_idle(&self) -> Duration {
        self.connection_timeout * 2
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.data_dir.join("server_key.pem")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("netmesh.db")
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(var = name, value = %value, "invalid value, using default");
            None
        }
    }
}
