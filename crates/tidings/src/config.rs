//! Startup configuration.
//!
//! Values come from built-in defaults, an optional file, and `TIDINGS__*`
//! environment variables, in that order of precedence (last wins).

use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Mask/tag pair a producer stamps on the messages it publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIdentity {
    pub mask: u64,
    pub tag: String,
}

impl Default for MessageIdentity {
    fn default() -> Self {
        Self {
            mask: 1,
            tag: "RESPONSE".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Log every sent message at debug level.
    pub debug: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Identity of messages published by `RequestMode::ViaDispatch`.
    pub response: MessageIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    /// Priority of the root listener each component registers.
    pub listener_priority: i32,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            listener_priority: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TidingsConfig {
    pub queue: QueueConfig,
    pub resource: ResourceConfig,
    pub component: ComponentConfig,
}

impl TidingsConfig {
    /// Load defaults overridden by `TIDINGS__SECTION__KEY` variables.
    pub fn load() -> Result<Self> {
        Self::builder(None)
    }

    /// Like [`TidingsConfig::load`], with a config file layered in between.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder(Some(path.as_ref()))
    }

    fn builder(path: Option<&Path>) -> Result<Self> {
        let defaults = TidingsConfig::default();
        let mut builder = Config::builder()
            .set_default("queue.debug", defaults.queue.debug)?
            .set_default("resource.response.mask", defaults.resource.response.mask)?
            .set_default("resource.response.tag", defaults.resource.response.tag)?
            .set_default(
                "component.listener_priority",
                i64::from(defaults.component.listener_priority),
            )?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("TIDINGS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}
