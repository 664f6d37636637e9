use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::UserId;

/// Prefix for environment overrides, e.g. `ACL_ROOT_USER_ID=1`
pub const ENV_PREFIX: &str = "ACL";

/// Access-control engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AclConfig {
    /// The one principal whose token grants everything (default: 1)
    #[serde(default = "default_root_user_id")]
    pub root_user_id: UserId,

    /// Principal assumed by requests that presented no credentials (default: 2)
    #[serde(default = "default_nobody_user_id")]
    pub nobody_user_id: UserId,

    /// Ceiling on inheritance chain length before the walk gives up (default: 32)
    #[serde(default = "default_max_inheritance_depth")]
    pub max_inheritance_depth: usize,

    /// Keep resolved tokens in the engine until the next write (default: false)
    #[serde(default)]
    pub cache_tokens: bool,

    /// PostgreSQL connection string for the sqlx-backed store
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_root_user_id() -> UserId {
    1
}

fn default_nobody_user_id() -> UserId {
    2
}

fn default_max_inheritance_depth() -> usize {
    32
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            root_user_id: default_root_user_id(),
            nobody_user_id: default_nobody_user_id(),
            max_inheritance_depth: default_max_inheritance_depth(),
            cache_tokens: false,
            database_url: None,
        }
    }
}

impl AclConfig {
    /// Load configuration from a TOML/YAML/JSON file, with `ACL_*`
    /// environment variables taking precedence
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from `ACL_*` environment variables only
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn is_root(&self, user_id: UserId) -> bool {
        user_id == self.root_user_id
    }
}
