use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration, sourced from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Compose project label value used in container filters and the CLI.
    pub project_name: String,

    /// Root of the compose manifest tree.
    pub demos_dir: PathBuf,

    /// Seconds of idleness before a reap-eligible service is stopped.
    pub idle_timeout: Duration,

    /// Optional PID file, held with an exclusive lock while running.
    pub pid_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            project_name: env_or("PROJECT_NAME", DEFAULT_PROJECT_NAME),
            demos_dir: PathBuf::from(env_or("DEMOS_DIR", DEFAULT_DEMOS_DIR)),
            idle_timeout: duration_secs(
                std::env::var("IDLE_TIMEOUT").ok(),
                DEFAULT_IDLE_TIMEOUT_SECS,
            ),
            pid_file: std::env::var("PID_FILE").ok().map(PathBuf::from),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            demos_dir: PathBuf::from(DEFAULT_DEMOS_DIR),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            pid_file: None,
        }
    }
}

const DEFAULT_PROJECT_NAME: &str = "demos";
const DEFAULT_DEMOS_DIR: &str = "/demos-dir";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 10;

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn duration_secs(value: Option<String>, fallback: u64) -> Duration {
    match value.as_deref().map(str::parse::<u64>) {
        Some(Ok(secs)) => Duration::from_secs(secs),
        Some(Err(_)) => {
            warn!(
                value = value.as_deref().unwrap_or_default(),
                fallback, "unparsable timeout value, using fallback"
            );
            Duration::from_secs(fallback)
        }
        None => Duration::from_secs(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_secs_parses_value() {
        assert_eq!(
            duration_secs(Some("5".to_string()), 10),
            Duration::from_secs(5)
        );
        assert_eq!(
            duration_secs(Some("0".to_string()), 10),
            Duration::from_secs(0)
        );
    }

    #[test]
    fn test_duration_secs_falls_back() {
        assert_eq!(duration_secs(None, 10), Duration::from_secs(10));
        assert_eq!(
            duration_secs(Some("not-a-number".to_string()), 10),
            Duration::from_secs(10)
        );
        assert_eq!(
            duration_secs(Some("-3".to_string()), 10),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.project_name, "demos");
        assert_eq!(config.demos_dir, PathBuf::from("/demos-dir"));
        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert!(config.pid_file.is_none());
    }

    #[test]
    fn test_from_env_overrides() {
        // Set and clear in one test to avoid races with parallel env mutation.
        std::env::set_var("PROJECT_NAME", "fleet");
        std::env::set_var("DEMOS_DIR", "/srv/fleet");
        std::env::set_var("IDLE_TIMEOUT", "42");

        let config = Config::from_env();
        assert_eq!(config.project_name, "fleet");
        assert_eq!(config.demos_dir, PathBuf::from("/srv/fleet"));
        assert_eq!(config.idle_timeout, Duration::from_secs(42));

        std::env::remove_var("PROJECT_NAME");
        std::env::remove_var("DEMOS_DIR");
        std::env::remove_var("IDLE_TIMEOUT");
    }
}
