// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # concurrent configuration
//!
//! Most of the node's configuration is read from a TOML file. The file is versioned (through a
//! top-level `version` key) so that the format can evolve without breaking existing deployments.
//! Keys are kebab-case:
//!
//! ```toml
//! version = "1"
//! fqdn = "example.com"
//! private-key = "…"
//! dimension = "cc-main"
//! public-address = "0.0.0.0:8000"
//! admins = ["con1…"]
//!
//! [storage-config.Postgres]
//! dsn = "postgres://concurrent@localhost/concurrent"
//! max-connections = 16
//!
//! [cache-config.Redis]
//! url = "redis://localhost:6379"
//!
//! [peer-origins]
//! "other.example" = "http://localhost:8001"
//! ```

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use snafu::{Backtrace, IntoError, Snafu};
use url::Url;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to read configuration file {}: {source}", pth.display()))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Error parsing configuration file {}: {source}", pth.display()))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where the configuration is looked for when no path is given
pub const DEFAULT_CONFIG: &str = "/etc/concurrent/config.toml";

/// Storage backend selection
#[derive(Clone, Debug, Default, Deserialize)]
pub enum StorageConfig {
    /// Keep everything in process memory; suitable for tests & throw-away single nodes
    #[default]
    Memory,
    Postgres {
        dsn: String,
        #[serde(rename = "max-connections", default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    16
}

/// Cache & message bus selection
#[derive(Clone, Debug, Default, Deserialize)]
pub enum CacheConfig {
    #[default]
    Memory,
    Redis { url: String },
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    pub endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    pub interval: Option<Duration>,
}

/// concurrent configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigV1 {
    /// The name by which this node is known to its peers
    pub fqdn: String,
    /// Hex-encoded secp256k1 private key with which the node signs on its own behalf
    pub private_key: String,
    /// The domain's account id; derived from `private-key` if not given
    pub ccid: Option<String>,
    /// The domain's signing id; derived from `private-key` if not given
    pub csid: Option<String>,
    /// Only nodes in the same dimension federate
    pub dimension: String,
    /// Accounts granted the `_admin` tag
    pub admins: Vec<String>,
    /// Local address at which to listen for requests; specify as "address:port"
    pub public_address: SocketAddr,
    /// Directory beneath which per-owner commit logs are kept; None disables them
    pub repository_path: Option<PathBuf>,
    pub user_agent: String,
    /// A file containing the global policy; None selects the built-in default
    pub global_policy: Option<PathBuf>,
    /// Origins at which particular peers are to be reached, overriding `https://<fqdn>`
    pub peer_origins: HashMap<String, Url>,
    pub storage_config: StorageConfig,
    pub cache_config: CacheConfig,
    /// OTLP export target; None means don't export
    pub otlp_export: Option<OtelExportConfig>,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            fqdn: "localhost".to_owned(),
            private_key: String::new(),
            ccid: None,
            csid: None,
            dimension: "concurrent-dev".to_owned(),
            admins: Vec::new(),
            public_address: SocketAddr::from(([0, 0, 0, 0], 8000)),
            repository_path: None,
            user_agent: format!(
                "concurrent/{}; +sp1ff@pobox.com",
                env!("CARGO_PKG_VERSION")
            ),
            global_policy: None,
            peer_origins: HashMap::new(),
            storage_config: StorageConfig::default(),
            cache_config: CacheConfig::default(),
            otlp_export: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse configuration text
pub fn parse_config_text(text: &str, pth: &Path) -> Result<ConfigV1> {
    match toml::from_str::<Configuration>(text) {
        Ok(Configuration::V1(cfg)) => Ok(cfg),
        Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
    }
}

/// Parse the concurrent configuration file
///
/// If no path was given & there's nothing at the default location, fall back to defaults.
pub fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg
        .as_ref()
        .map_or_else(|| (PathBuf::from(DEFAULT_CONFIG), true), |p| (p.clone(), false));
    match std::fs::read_to_string(&pth) {
        Ok(text) => parse_config_text(&text, &pth),
        Err(_) if defaulted => Ok(ConfigV1::default()),
        Err(err) => Err(ConfigNotFoundSnafu { pth }.into_error(err)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_config() {
        let text = r#"
version = "1"
fqdn = "ours.example"
private-key = "4646464646464646464646464646464646464646464646464646464646464646"
dimension = "cc-test"
admins = ["con1admin"]
public-address = "127.0.0.1:8000"
repository-path = "/var/lib/concurrent"

[storage-config.Postgres]
dsn = "postgres://concurrent@localhost/concurrent"

[cache-config.Redis]
url = "redis://localhost:6379"

[peer-origins]
"peer.example" = "http://localhost:8001"

[otlp-export]
endpoint = "http://localhost:4318/v1/metrics"
"#;
        let cfg = parse_config_text(text, Path::new("test.toml")).unwrap();
        assert_eq!(cfg.fqdn, "ours.example");
        assert_eq!(cfg.admins, vec!["con1admin"]);
        assert_eq!(cfg.public_address.port(), 8000);
        assert!(matches!(
            cfg.storage_config,
            StorageConfig::Postgres {
                max_connections: 16,
                ..
            }
        ));
        assert!(matches!(cfg.cache_config, CacheConfig::Redis { .. }));
        assert_eq!(
            cfg.peer_origins["peer.example"].as_str(),
            "http://localhost:8001/"
        );
        assert!(cfg.otlp_export.unwrap().interval.is_none());
        assert!(cfg.ccid.is_none());
    }

    #[test]
    fn defaults_and_versions() {
        let cfg = parse_config_text(
            "version = \"1\"\nfqdn = \"tiny.example\"\n",
            Path::new("tiny.toml"),
        )
        .unwrap();
        assert_eq!(cfg.fqdn, "tiny.example");
        assert!(matches!(cfg.storage_config, StorageConfig::Memory));
        assert!(matches!(cfg.cache_config, CacheConfig::Memory));
        assert!(cfg.user_agent.starts_with("concurrent/"));

        assert!(parse_config_text("version = \"2\"\n", Path::new("v2.toml")).is_err());
        assert!(parse_config(&Some(PathBuf::from("/no/such/concurrent.toml"))).is_err());
    }
}
