use std::{fs, path::Path};

use serde::Deserialize;

use crate::{balancer, channel, logging, server, supervisor};

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: server::Config,
    pub balancer: balancer::Config,
    pub channel: channel::Config,
    pub supervisor: supervisor::Config,
    pub log: logging::Config,
}

impl AppConfig {
    /// Reads the config file, or falls back to defaults when none is given.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => {
                let config = fs::read_to_string(path)?;
                Ok(toml::from_str(&config)?)
            }
            None => Ok(Self::default()),
        }
    }
}
