//! Configuration types for the warehouse and its network layer
//!
//! All of these are plain serde structs loaded from YAML by whichever app
//! hosts the warehouse; credentials arrive as an opaque token/password pair
//! and are never interpreted beyond basic-auth encoding.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use weft_core::model::FetchPolicy;

/// The four storage roots every app in the suite agrees on. The warehouse
/// only ever touches `cache_common`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePaths {
    pub shared_data: PathBuf,
    pub shared_config: PathBuf,
    pub per_app_config: PathBuf,
    pub cache_common: PathBuf,
}

impl StoragePaths {
    /// Derive all four roots beneath a single base directory.
    pub fn beneath(base: &Path) -> Self {
        Self {
            shared_data: base.join("data"),
            shared_config: base.join("config"),
            per_app_config: base.join("config").join("app"),
            cache_common: base.join("cache"),
        }
    }

    /// Default layout under the platform data directory.
    pub fn platform_default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("weft");
        Self::beneath(&base)
    }

    pub fn warehouse_db_path(&self) -> PathBuf {
        self.cache_common.join("warehouse.db3")
    }

    /// Root beneath which the stem cache creates its `stem/` shard tree.
    pub fn stem_cache_root(&self) -> &Path {
        &self.cache_common
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.cache_common.join("quarantine")
    }

    pub fn ensure_exists(&self) -> std::io::Result<()> {
        for dir in [
            &self.shared_data,
            &self.shared_config,
            &self.per_app_config,
            &self.cache_common,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Opaque upstream credential blob; used verbatim for HTTP basic auth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
    pub password: String,
}

impl Auth {
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty()
    }
}

/// Upstream API tuning. The `default`/`unstable` pairs are selected by the
/// host's performance configuration; unstable suits 4G-grade connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Hostname of the metadata service
    pub data_domain: String,
    pub user_agent_app: String,
    pub user_agent_db: String,

    pub network_timeout_secs_default: u32,
    pub network_timeout_secs_unstable: u32,
    pub network_retry_limit_default: u32,
    pub network_retry_limit_unstable: u32,

    /// Treat this connection as unstable (longer timeouts, more retries)
    pub connection_unstable: bool,

    /// Accept CDN sizes that disagree with the stored stem record
    pub hack_allow_stem_size_mismatch: bool,
    /// Accept truncated CDN bodies, clamping the decoded PCM
    pub hack_allow_stem_underflow: bool,
    /// Let stems without app-version data through validation; very old jams
    /// predate versioning entirely
    pub allow_stems_without_version_data: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            data_domain: "data.example.invalid".to_owned(),
            user_agent_app: "weft-app/0.4".to_owned(),
            user_agent_db: "weft-db/0.4".to_owned(),
            network_timeout_secs_default: 2,
            network_timeout_secs_unstable: 6,
            network_retry_limit_default: 2,
            network_retry_limit_unstable: 5,
            connection_unstable: false,
            hack_allow_stem_size_mismatch: true,
            hack_allow_stem_underflow: false,
            allow_stems_without_version_data: false,
        }
    }
}

impl ApiConfig {
    pub fn timeout_secs(&self) -> u32 {
        if self.connection_unstable {
            self.network_timeout_secs_unstable
        } else {
            self.network_timeout_secs_default
        }
    }

    pub fn retry_limit(&self) -> u32 {
        if self.connection_unstable {
            self.network_retry_limit_unstable
        } else {
            self.network_retry_limit_default
        }
    }

    /// Policy handed to the stem store's CDN fetch path.
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            timeout_secs: self.timeout_secs(),
            allow_stem_size_mismatch: self.hack_allow_stem_size_mismatch,
            allow_stem_underflow: self.hack_allow_stem_underflow,
            user_agent: self.user_agent_app.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_layout() {
        let paths = StoragePaths::beneath(Path::new("/tmp/weft"));
        assert_eq!(paths.warehouse_db_path(), Path::new("/tmp/weft/cache/warehouse.db3"));
        assert_eq!(paths.stem_cache_root(), Path::new("/tmp/weft/cache"));
    }

    #[test]
    fn test_unstable_profile_switches_tuning() {
        let mut config = ApiConfig::default();
        assert_eq!(config.timeout_secs(), 2);
        assert_eq!(config.retry_limit(), 2);
        config.connection_unstable = true;
        assert_eq!(config.timeout_secs(), 6);
        assert_eq!(config.retry_limit(), 5);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = ApiConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: ApiConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.data_domain, config.data_domain);
        assert_eq!(back.hack_allow_stem_size_mismatch, true);
    }
}
