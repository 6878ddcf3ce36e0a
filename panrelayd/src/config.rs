use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:16544";
const DEFAULT_ROOT_DIR_ID: i64 = 0;
const DEFAULT_POLL_SECS: u64 = 3;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_TOKEN_SKEW_SECS: u64 = 3600;
const DEFAULT_LIST_LIMIT: u64 = 100;

/// Runtime configuration, read once at startup from `PANRELAY_*` variables.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub api_base_url: Option<String>,
    pub root_dir_id: i64,
    pub poll_interval: Duration,
    pub download_timeout: Duration,
    pub token_refresh_skew: Duration,
    pub list_limit: u32,
    pub credentials: GlobalCredentials,
}

/// Fallback provider credentials used for tenants with no row of their own.
#[derive(Clone, Debug, Default)]
pub struct GlobalCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("PANRELAY_BIND").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let database_url = std::env::var("PANRELAY_DB").ok();
        let api_base_url = std::env::var("PANRELAY_API_BASE").ok();
        let root_dir_id = read_i64_env("PANRELAY_ROOT_DIR_ID", DEFAULT_ROOT_DIR_ID);
        let poll_interval =
            Duration::from_secs(read_u64_env("PANRELAY_POLL_SECS", DEFAULT_POLL_SECS));
        let download_timeout = Duration::from_secs(read_u64_env(
            "PANRELAY_DOWNLOAD_TIMEOUT_SECS",
            DEFAULT_DOWNLOAD_TIMEOUT_SECS,
        ));
        let token_refresh_skew = Duration::from_secs(read_u64_env(
            "PANRELAY_TOKEN_SKEW_SECS",
            DEFAULT_TOKEN_SKEW_SECS,
        ));
        let list_limit = read_u64_env("PANRELAY_LIST_LIMIT", DEFAULT_LIST_LIMIT) as u32;
        let credentials = GlobalCredentials {
            client_id: std::env::var("PANRELAY_CLIENT_ID").ok(),
            client_secret: std::env::var("PANRELAY_CLIENT_SECRET").ok(),
            username: std::env::var("PANRELAY_USERNAME").ok(),
            password: std::env::var("PANRELAY_PASSWORD").ok(),
        };

        Self {
            bind_addr,
            database_url,
            api_base_url,
            root_dir_id,
            poll_interval,
            download_timeout,
            token_refresh_skew,
            list_limit,
            credentials,
        }
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_i64_env(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}
