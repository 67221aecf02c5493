pub use config::Config;
pub use once_cell::sync::OnceCell;
use std::error::Error;
use std::time::Duration;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(config::Environment::default())
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone utilities and tests
pub fn load_config() -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(config::Environment::default())
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

fn u64_or(config: &Config, key: &str, default: u64) -> u64 {
    config.get_int(key).map(|v| v.max(0) as u64).unwrap_or(default)
}

fn string_or(config: &Config, key: &str, default: &str) -> String {
    config
        .get_string(key)
        .unwrap_or_else(|_| default.to_string())
}

pub fn database_url() -> Result<String, Box<dyn Error>> {
    get_global_config()
        .get_string("database_url")
        .map_err(|e| format!("Missing database_url in config: {}", e).into())
}

pub fn db_max_connections() -> u32 {
    u64_or(get_global_config(), "database_max_connections", 10) as u32
}

pub fn http_bind() -> String {
    string_or(get_global_config(), "http_bind", "0.0.0.0:3005")
}

/// Interval between top-level ticks, which is also the single-flight
/// lock window for the dispatcher.
pub fn check_all_expiry() -> Duration {
    Duration::from_secs(u64_or(get_global_config(), "chain_check_all_expiry", 60))
}

/// Single-flight lock window for one per-job tick. Pending blocks whose
/// schedule time is older than this are considered dead and requeued.
pub fn check_job_expiry() -> Duration {
    Duration::from_secs(u64_or(get_global_config(), "chain_check_job_expiry", 300))
}

/// How long a bad or failed block rests before it is retried.
pub fn check_job_retry() -> Duration {
    Duration::from_secs(u64_or(get_global_config(), "chain_check_job_retry", 43_200))
}

/// How long superseded fetch records are kept before the sweeper
/// deletes them.
pub fn fetch_retention() -> Duration {
    Duration::from_secs(u64_or(get_global_config(), "chain_fetch_retention", 604_800))
}

/// Interval between retention sweeps.
pub fn clean_all_interval() -> Duration {
    Duration::from_secs(u64_or(get_global_config(), "chain_clean_all_interval", 3_600))
}

pub fn block_workers() -> usize {
    u64_or(get_global_config(), "chain_block_workers", 8) as usize
}

pub fn canonical_url() -> Result<String, Box<dyn Error>> {
    get_global_config()
        .get_string("canonical_url")
        .map_err(|e| format!("Missing canonical_url in config: {}", e).into())
}

pub fn canonical_token() -> Result<String, Box<dyn Error>> {
    get_global_config()
        .get_string("canonical_token")
        .map_err(|e| format!("Missing canonical_token in config: {}", e).into())
}

pub fn blockset_url() -> Result<String, Box<dyn Error>> {
    get_global_config()
        .get_string("blockset_url")
        .map_err(|e| format!("Missing blockset_url in config: {}", e).into())
}

pub fn blockset_token() -> Result<String, Box<dyn Error>> {
    get_global_config()
        .get_string("blockset_token")
        .map_err(|e| format!("Missing blockset_token in config: {}", e).into())
}

pub fn infura_project_id() -> Result<String, Box<dyn Error>> {
    get_global_config()
        .get_string("infura_project_id")
        .map_err(|e| format!("Missing infura_project_id in config: {}", e).into())
}
