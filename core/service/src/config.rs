use brain_memory_schemas::SWEEP_INTERVAL_SECS;

/// Runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: String,
    pub redis_url: Option<String>,
    pub upstream_url: String,
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(21956),
            db_path: std::env::var("DB_PATH")
                .unwrap_or_else(|_| "brain_memory.db".to_string()),
            redis_url: std::env::var("REDIS_URL").ok(),
            upstream_url: std::env::var("UPSTREAM_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            sweep_interval_secs: std::env::var("SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(SWEEP_INTERVAL_SECS),
        }
    }
}
