//! Node configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Peer node base URLs ("backends") to push to and pull from.
    pub backends: Vec<String>,

    /// Whether the caretaker re-runs stale scheduled queries.
    pub retrieval_enabled: bool,

    /// HTTP port announced to peers.
    pub http_port: u16,

    /// HTTPS port announced to peers (0 = none).
    pub https_port: u16,

    /// Peer name announced to peers.
    pub peername: String,

    /// Data directory holding the dump log and import directories.
    pub data_dir: PathBuf,

    /// Deadline for peer HTTP requests.
    pub search_timeout: Duration,

    /// Result-count cap for searches issued to peers.
    pub search_count_max: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - None (all have defaults for local development)
    ///
    /// Optional:
    /// - `MAGPIE_BACKENDS`: Comma-separated peer base URLs (default: none)
    /// - `MAGPIE_RETRIEVAL_ENABLED`: Scheduled re-retrieval on/off (default: "true")
    /// - `MAGPIE_HTTP_PORT`: Announced HTTP port (default: 9000)
    /// - `MAGPIE_HTTPS_PORT`: Announced HTTPS port, 0 for none (default: 0)
    /// - `MAGPIE_PEERNAME`: Name announced to peers (default: "anonymous")
    /// - `MAGPIE_DATA_DIR`: Data directory (default: "./data")
    /// - `MAGPIE_SEARCH_TIMEOUT_MS`: Peer request deadline (default: 10000)
    /// - `MAGPIE_SEARCH_COUNT_MAX`: Peer search result cap (default: 100)
    pub fn from_env() -> anyhow::Result<Self> {
        let backends = parse_peer_list(&std::env::var("MAGPIE_BACKENDS").unwrap_or_default());

        let retrieval_enabled = std::env::var("MAGPIE_RETRIEVAL_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let http_port = std::env::var("MAGPIE_HTTP_PORT")
            .unwrap_or_else(|_| "9000".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("MAGPIE_HTTP_PORT: {e}"))?;

        let https_port = std::env::var("MAGPIE_HTTPS_PORT")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("MAGPIE_HTTPS_PORT: {e}"))?;

        let peername =
            std::env::var("MAGPIE_PEERNAME").unwrap_or_else(|_| "anonymous".to_string());

        let data_dir =
            PathBuf::from(std::env::var("MAGPIE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let timeout_ms: u64 = std::env::var("MAGPIE_SEARCH_TIMEOUT_MS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("MAGPIE_SEARCH_TIMEOUT_MS: {e}"))?;

        let search_count_max = std::env::var("MAGPIE_SEARCH_COUNT_MAX")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("MAGPIE_SEARCH_COUNT_MAX: {e}"))?;

        tracing::info!(
            backends = backends.len(),
            retrieval_enabled,
            http_port,
            peername = %peername,
            data_dir = %data_dir.display(),
            "node configuration loaded"
        );

        Ok(Self {
            backends,
            retrieval_enabled,
            http_port,
            https_port,
            peername,
            data_dir,
            search_timeout: Duration::from_millis(timeout_ms),
            search_count_max,
        })
    }
}

/// Parse a comma-separated peer URL list, trimming whitespace and trailing
/// slashes and dropping empty entries.
pub fn parse_peer_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize config tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "MAGPIE_BACKENDS",
        "MAGPIE_RETRIEVAL_ENABLED",
        "MAGPIE_HTTP_PORT",
        "MAGPIE_HTTPS_PORT",
        "MAGPIE_PEERNAME",
        "MAGPIE_DATA_DIR",
        "MAGPIE_SEARCH_TIMEOUT_MS",
        "MAGPIE_SEARCH_COUNT_MAX",
    ];

    /// Helper to run config tests with isolated env vars.
    /// Uses a mutex to prevent concurrent env var races.
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap();

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
        for (k, v) in vars {
            std::env::set_var(k, v);
        }

        f();

        for (k, v) in &saved {
            match v {
                Some(val) => std::env::set_var(k, val),
                None => std::env::remove_var(k),
            }
        }
    }

    #[test]
    fn config_defaults() {
        with_env_vars(&[], || {
            let config = Config::from_env().unwrap();
            assert!(config.backends.is_empty());
            assert!(config.retrieval_enabled);
            assert_eq!(config.http_port, 9000);
            assert_eq!(config.peername, "anonymous");
            assert_eq!(config.search_count_max, 100);
        });
    }

    #[test]
    fn config_custom_values() {
        with_env_vars(
            &[
                ("MAGPIE_BACKENDS", "http://peer1:9000, http://peer2:9000/"),
                ("MAGPIE_RETRIEVAL_ENABLED", "false"),
                ("MAGPIE_HTTP_PORT", "9100"),
                ("MAGPIE_PEERNAME", "magpie-eu-1"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(
                    config.backends,
                    vec!["http://peer1:9000", "http://peer2:9000"]
                );
                assert!(!config.retrieval_enabled);
                assert_eq!(config.http_port, 9100);
                assert_eq!(config.peername, "magpie-eu-1");
            },
        );
    }

    #[test]
    fn peer_list_drops_empty_entries() {
        assert_eq!(
            parse_peer_list("http://a,,  ,http://b/"),
            vec!["http://a", "http://b"]
        );
        assert!(parse_peer_list("").is_empty());
    }
}
