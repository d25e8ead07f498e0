use std::path::Path;

use anyhow::Context;
use netbench_logging::LogConfig;
use netbench_rdma::RcConfig;
use netbench_transport::LoopbackConfig;
use serde::Deserialize;

/// File read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "netbench.toml";

/// Contents of the TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub rdma: RcConfig,
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

impl BenchConfig {
    /// Load `path`, or the default file if it exists when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbench_rdma::ConnectMode;

    #[test]
    fn test_empty_file() {
        let config = BenchConfig::parse("").unwrap();
        assert_eq!(config.rdma, RcConfig::default());
        assert_eq!(config.loopback, LoopbackConfig::default());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_sections() {
        let config = BenchConfig::parse(
            r#"
            [log]
            level = "debug"

            [rdma]
            path_mtu = 2048
            connect_mode = "eager"
            max_completion_retries = 3

            [loopback]
            chunk_size = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.rdma.path_mtu.bytes(), 2048);
        assert_eq!(config.rdma.connect_mode, ConnectMode::Eager);
        assert_eq!(config.rdma.max_completion_retries, Some(3));
        assert_eq!(config.loopback.chunk_size, 1500);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        assert!(BenchConfig::load(Some(Path::new("/nonexistent/netbench.toml"))).is_err());
    }

    #[test]
    fn test_bad_value_is_error() {
        assert!(BenchConfig::parse("[rdma]\npath_mtu = 1500\n").is_err());
    }
}
