//! Connection and convention configuration.
//!
//! [`MongoConfig`] describes how the driver session is opened. It can be
//! built in code, read from the environment, or loaded from a
//! `docbridge.toml` file through [`DocbridgeConfig`]:
//!
//! ```toml
//! [connection]
//! uri = "mongodb://${MONGO_HOST:-localhost}:27017"
//! database = "billing"
//! max_pool_size = 20
//! read_preference = "secondary_preferred"
//!
//! [naming]
//! id_suffixes = ["_id", "Id"]
//! datetime_marker = "_datetime"
//! ```

use std::path::Path;
use std::time::Duration;

use mongodb::options::ClientOptions;
use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{DocbridgeError, DocbridgeResult, StoreError, StoreResult};
use crate::naming::NamingConvention;

/// Environment variable holding the connection URI.
pub const ENV_URI: &str = "DOCBRIDGE_URI";
/// Environment variable holding the default database.
pub const ENV_DATABASE: &str = "DOCBRIDGE_DATABASE";
/// Environment variable holding the application name.
pub const ENV_APP_NAME: &str = "DOCBRIDGE_APP_NAME";

const DEFAULT_URI: &str = "mongodb://localhost:27017";

/// MongoDB connection configuration.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// MongoDB connection URI.
    pub uri: String,
    /// Default database, used when a call names none.
    pub database: Option<String>,
    /// Application name (shown in server logs).
    pub app_name: Option<String>,
    /// Minimum connection pool size.
    pub min_pool_size: Option<u32>,
    /// Maximum connection pool size.
    pub max_pool_size: Option<u32>,
    /// Maximum idle time for connections.
    pub max_idle_time: Option<Duration>,
    /// Connection timeout.
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout.
    pub server_selection_timeout: Option<Duration>,
    /// Read preference.
    pub read_preference: Option<ReadPreference>,
    /// Write concern.
    pub write_concern: Option<WriteConcern>,
    /// Retry writes.
    pub retry_writes: Option<bool>,
    /// Retry reads.
    pub retry_reads: Option<bool>,
    /// Direct connection (bypass replica set discovery).
    pub direct_connection: Option<bool>,
}

/// MongoDB read preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    /// Read from primary only.
    #[default]
    Primary,
    /// Read from primary preferred, fallback to secondary.
    PrimaryPreferred,
    /// Read from secondary only.
    Secondary,
    /// Read from secondary preferred, fallback to primary.
    SecondaryPreferred,
    /// Read from nearest member.
    Nearest,
}

/// MongoDB write concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteConcern {
    /// Acknowledge writes from the specified number of nodes.
    W(u32),
    /// Acknowledge writes from majority of nodes.
    Majority,
    /// Custom tag set.
    Custom(String),
}

impl WriteConcern {
    /// Parse `"majority"`, a node count, or a tag set name.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "majority" => Self::Majority,
            other => other
                .parse::<u32>()
                .map(Self::W)
                .unwrap_or_else(|_| Self::Custom(other.to_string())),
        }
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            database: None,
            app_name: Some("docbridge".to_string()),
            min_pool_size: None,
            max_pool_size: Some(10),
            max_idle_time: Some(Duration::from_secs(300)),
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(30)),
            read_preference: Some(ReadPreference::Primary),
            write_concern: None,
            retry_writes: Some(true),
            retry_reads: Some(true),
            direct_connection: None,
        }
    }
}

impl MongoConfig {
    /// Create a new configuration from a URI and default database.
    pub fn from_uri(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: Some(database.into()),
            ..Self::default()
        }
    }

    /// Create a builder for configuration.
    pub fn builder() -> MongoConfigBuilder {
        MongoConfigBuilder::new()
    }

    /// Read `DOCBRIDGE_URI`, `DOCBRIDGE_DATABASE` and `DOCBRIDGE_APP_NAME`.
    pub fn from_env() -> Self {
        Self::from_env_source(|name| std::env::var(name).ok())
    }

    /// Read the environment through a lookup function.
    pub fn from_env_source(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(uri) = lookup(ENV_URI).filter(|v| !v.is_empty()) {
            config.uri = uri;
        }
        config.database = lookup(ENV_DATABASE).filter(|v| !v.is_empty());
        if let Some(app_name) = lookup(ENV_APP_NAME).filter(|v| !v.is_empty()) {
            config.app_name = Some(app_name);
        }
        config
    }

    /// The default database, if one is set and non-empty.
    pub fn default_database(&self) -> Option<&str> {
        self.database.as_deref().filter(|name| !name.is_empty())
    }

    /// Convert to MongoDB ClientOptions for `uri`.
    pub async fn to_client_options(&self, uri: &str) -> StoreResult<ClientOptions> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| StoreError::connection(format!("failed to parse URI: {}", e)))?;

        if let Some(ref app_name) = self.app_name {
            options.app_name = Some(app_name.clone());
        }

        if let Some(min_pool) = self.min_pool_size {
            options.min_pool_size = Some(min_pool);
        }

        if let Some(max_pool) = self.max_pool_size {
            options.max_pool_size = Some(max_pool);
        }

        if let Some(max_idle) = self.max_idle_time {
            options.max_idle_time = Some(max_idle);
        }

        if let Some(connect_timeout) = self.connect_timeout {
            options.connect_timeout = Some(connect_timeout);
        }

        if let Some(selection_timeout) = self.server_selection_timeout {
            options.server_selection_timeout = Some(selection_timeout);
        }

        if let Some(read_pref) = self.read_preference {
            use mongodb::options::{ReadPreference as Driver, SelectionCriteria};
            let preference = match read_pref {
                ReadPreference::Primary => Driver::Primary,
                ReadPreference::PrimaryPreferred => Driver::PrimaryPreferred {
                    options: Default::default(),
                },
                ReadPreference::Secondary => Driver::Secondary {
                    options: Default::default(),
                },
                ReadPreference::SecondaryPreferred => Driver::SecondaryPreferred {
                    options: Default::default(),
                },
                ReadPreference::Nearest => Driver::Nearest {
                    options: Default::default(),
                },
            };
            options.selection_criteria = Some(SelectionCriteria::ReadPreference(preference));
        }

        if let Some(ref wc) = self.write_concern {
            use mongodb::options::Acknowledgment;
            let w = match wc {
                WriteConcern::W(n) => Acknowledgment::Nodes(*n),
                WriteConcern::Majority => Acknowledgment::Majority,
                WriteConcern::Custom(tag) => Acknowledgment::Custom(tag.clone()),
            };
            options.write_concern = Some(mongodb::options::WriteConcern::builder().w(w).build());
        }

        if let Some(retry_writes) = self.retry_writes {
            options.retry_writes = Some(retry_writes);
        }

        if let Some(retry_reads) = self.retry_reads {
            options.retry_reads = Some(retry_reads);
        }

        if let Some(direct) = self.direct_connection {
            options.direct_connection = Some(direct);
        }

        Ok(options)
    }
}

/// Builder for MongoDB configuration.
#[derive(Debug, Default)]
pub struct MongoConfigBuilder {
    uri: Option<String>,
    database: Option<String>,
    app_name: Option<String>,
    min_pool_size: Option<u32>,
    max_pool_size: Option<u32>,
    max_idle_time: Option<Duration>,
    connect_timeout: Option<Duration>,
    server_selection_timeout: Option<Duration>,
    read_preference: Option<ReadPreference>,
    write_concern: Option<WriteConcern>,
    retry_writes: Option<bool>,
    retry_reads: Option<bool>,
    direct_connection: Option<bool>,
}

impl MongoConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the MongoDB URI.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the default database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Set the minimum pool size.
    pub fn min_pool_size(mut self, size: u32) -> Self {
        self.min_pool_size = Some(size);
        self
    }

    /// Set the maximum pool size.
    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    /// Set the maximum idle time for connections.
    pub fn max_idle_time(mut self, duration: Duration) -> Self {
        self.max_idle_time = Some(duration);
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = Some(duration);
        self
    }

    /// Set the server selection timeout.
    pub fn server_selection_timeout(mut self, duration: Duration) -> Self {
        self.server_selection_timeout = Some(duration);
        self
    }

    /// Set the read preference.
    pub fn read_preference(mut self, pref: ReadPreference) -> Self {
        self.read_preference = Some(pref);
        self
    }

    /// Set the write concern.
    pub fn write_concern(mut self, wc: WriteConcern) -> Self {
        self.write_concern = Some(wc);
        self
    }

    /// Enable or disable retry writes.
    pub fn retry_writes(mut self, enabled: bool) -> Self {
        self.retry_writes = Some(enabled);
        self
    }

    /// Enable or disable retry reads.
    pub fn retry_reads(mut self, enabled: bool) -> Self {
        self.retry_reads = Some(enabled);
        self
    }

    /// Enable direct connection (bypass replica set discovery).
    pub fn direct_connection(mut self, enabled: bool) -> Self {
        self.direct_connection = Some(enabled);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> MongoConfig {
        let defaults = MongoConfig::default();
        MongoConfig {
            uri: self.uri.unwrap_or(defaults.uri),
            database: self.database,
            app_name: self.app_name.or(defaults.app_name),
            min_pool_size: self.min_pool_size,
            max_pool_size: self.max_pool_size.or(defaults.max_pool_size),
            max_idle_time: self.max_idle_time.or(defaults.max_idle_time),
            connect_timeout: self.connect_timeout.or(defaults.connect_timeout),
            server_selection_timeout: self
                .server_selection_timeout
                .or(defaults.server_selection_timeout),
            read_preference: self.read_preference.or(defaults.read_preference),
            write_concern: self.write_concern,
            retry_writes: self.retry_writes.or(defaults.retry_writes),
            retry_reads: self.retry_reads.or(defaults.retry_reads),
            direct_connection: self.direct_connection,
        }
    }
}

/// Contents of a `docbridge.toml` file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DocbridgeConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionSection,

    /// Naming convention.
    #[serde(default)]
    pub naming: NamingConvention,
}

/// `[connection]` section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    /// Connection URI (supports `${ENV_VAR}` interpolation).
    pub uri: Option<String>,
    /// Default database.
    pub database: Option<String>,
    /// Application name.
    pub app_name: Option<String>,
    /// Minimum pool size.
    pub min_pool_size: Option<u32>,
    /// Maximum pool size.
    pub max_pool_size: Option<u32>,
    /// Maximum idle time, in seconds.
    pub max_idle_time_secs: Option<u64>,
    /// Connect timeout, in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Server selection timeout, in seconds.
    pub server_selection_timeout_secs: Option<u64>,
    /// Read preference.
    pub read_preference: Option<ReadPreference>,
    /// Write concern: `"majority"`, a node count, or a tag set.
    pub write_concern: Option<String>,
    /// Retry writes.
    pub retry_writes: Option<bool>,
    /// Retry reads.
    pub retry_reads: Option<bool>,
    /// Direct connection.
    pub direct_connection: Option<bool>,
}

impl DocbridgeConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> DocbridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DocbridgeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string, expanding `${VAR}` first.
    pub fn from_toml(content: &str) -> DocbridgeResult<Self> {
        Self::from_toml_with_env(content, |name| std::env::var(name).ok())
    }

    /// Parse configuration, resolving variables through `lookup`.
    pub fn from_toml_with_env(
        content: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> DocbridgeResult<Self> {
        let expanded = expand_env_vars(content, lookup)?;
        toml::from_str(&expanded).map_err(|e| DocbridgeError::config(e.to_string()))
    }

    /// Driver configuration described by the `[connection]` section.
    pub fn mongo_config(&self) -> MongoConfig {
        let section = &self.connection;
        let mut builder = MongoConfig::builder();
        if let Some(ref uri) = section.uri {
            builder = builder.uri(uri);
        }
        if let Some(ref database) = section.database {
            builder = builder.database(database);
        }
        if let Some(ref app_name) = section.app_name {
            builder = builder.app_name(app_name);
        }
        if let Some(size) = section.min_pool_size {
            builder = builder.min_pool_size(size);
        }
        if let Some(size) = section.max_pool_size {
            builder = builder.max_pool_size(size);
        }
        if let Some(secs) = section.max_idle_time_secs {
            builder = builder.max_idle_time(Duration::from_secs(secs));
        }
        if let Some(secs) = section.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = section.server_selection_timeout_secs {
            builder = builder.server_selection_timeout(Duration::from_secs(secs));
        }
        if let Some(pref) = section.read_preference {
            builder = builder.read_preference(pref);
        }
        if let Some(ref wc) = section.write_concern {
            builder = builder.write_concern(WriteConcern::parse(wc));
        }
        if let Some(enabled) = section.retry_writes {
            builder = builder.retry_writes(enabled);
        }
        if let Some(enabled) = section.retry_reads {
            builder = builder.retry_reads(enabled);
        }
        if let Some(enabled) = section.direct_connection {
            builder = builder.direct_connection(enabled);
        }
        builder.build()
    }
}

/// Expand `${VAR}` and `${VAR:-default}`. Unset variables without a default
/// are left as written.
fn expand_env_vars(
    content: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> DocbridgeResult<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| DocbridgeError::config(e.to_string()))?;
    let expanded = re.replace_all(content, |caps: &Captures<'_>| {
        match (lookup(&caps[1]), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => caps[0].to_string(),
        }
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_config_from_uri() {
        let config = MongoConfig::from_uri("mongodb://localhost:27017", "mydb");
        assert_eq!(config.uri, "mongodb://localhost:27017");
        assert_eq!(config.default_database(), Some("mydb"));
    }

    #[test]
    fn test_config_builder() {
        let config = MongoConfig::builder()
            .uri("mongodb://localhost:27017")
            .database("mydb")
            .app_name("test-app")
            .max_pool_size(20)
            .build();

        assert_eq!(config.database.as_deref(), Some("mydb"));
        assert_eq!(config.app_name, Some("test-app".to_string()));
        assert_eq!(config.max_pool_size, Some(20));
        assert_eq!(config.retry_writes, Some(true));
    }

    #[test]
    fn test_empty_database_is_unset() {
        let config = MongoConfig::builder().database("").build();
        assert_eq!(config.default_database(), None);
    }

    #[test]
    fn test_from_env_source() {
        let config = MongoConfig::from_env_source(env(&[
            (ENV_URI, "mongodb://db:27017"),
            (ENV_DATABASE, "sales"),
        ]));
        assert_eq!(config.uri, "mongodb://db:27017");
        assert_eq!(config.default_database(), Some("sales"));

        let config = MongoConfig::from_env_source(env(&[]));
        assert_eq!(config.uri, DEFAULT_URI);
        assert_eq!(config.default_database(), None);
    }

    #[test]
    fn test_write_concern_parse() {
        assert_eq!(WriteConcern::parse("majority"), WriteConcern::Majority);
        assert_eq!(WriteConcern::parse("2"), WriteConcern::W(2));
        assert_eq!(
            WriteConcern::parse("dc-east"),
            WriteConcern::Custom("dc-east".to_string())
        );
    }

    #[test]
    fn test_toml_with_env_expansion() {
        let content = r#"
            [connection]
            uri = "mongodb://${MONGO_HOST:-localhost}:${MONGO_PORT}"
            database = "${APP_DB}"
            max_pool_size = 25
            connect_timeout_secs = 3
            read_preference = "secondary_preferred"
            write_concern = "majority"

            [naming]
            id_suffixes = ["_ref"]
            id_match = "contains"
        "#;
        let config = DocbridgeConfig::from_toml_with_env(
            content,
            env(&[("MONGO_PORT", "27018"), ("APP_DB", "crm")]),
        )
        .unwrap();

        let mongo = config.mongo_config();
        assert_eq!(mongo.uri, "mongodb://localhost:27018");
        assert_eq!(mongo.default_database(), Some("crm"));
        assert_eq!(mongo.max_pool_size, Some(25));
        assert_eq!(mongo.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(mongo.read_preference, Some(ReadPreference::SecondaryPreferred));
        assert_eq!(mongo.write_concern, Some(WriteConcern::Majority));
        assert!(config.naming.is_id_field("author_ref"));
        assert_eq!(config.naming.datetime_marker.as_str(), "_datetime");
    }

    #[test]
    fn test_toml_unknown_field_rejected() {
        let err = DocbridgeConfig::from_toml_with_env("[connection]\nurl = \"x\"", env(&[]))
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docbridge.toml");
        std::fs::write(&path, "[connection]\ndatabase = \"inventory\"\n").unwrap();
        let config = DocbridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.mongo_config().default_database(), Some("inventory"));

        assert!(DocbridgeConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[tokio::test]
    async fn test_to_client_options() {
        let config = MongoConfig::builder()
            .app_name("svc")
            .max_pool_size(7)
            .write_concern(WriteConcern::W(1))
            .build();
        let options = config
            .to_client_options("mongodb://localhost:27017")
            .await
            .unwrap();
        assert_eq!(options.app_name.as_deref(), Some("svc"));
        assert_eq!(options.max_pool_size, Some(7));
    }
}
