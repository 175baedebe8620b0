//! Environment-aware connection configuration.
//!
//! Connection parameters are split across two files loaded once at startup:
//! a settings file (hosts, port, TLS, authentication database, startup
//! environment, read preference) and a credentials file (login, password and
//! target database per environment). Both are plain JSON.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use mongodb::options::{
    ClientOptions, Credential, SelectionCriteria, ServerAddress, Tls, TlsOptions,
};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// A logical database environment.
///
/// The same logical collection maps to a different physical database per
/// environment; every store operation accepts an optional environment
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// The production database.
    Production,
    /// The test database.
    Test,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Read preference for query routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadPreference {
    /// Read from the primary only.
    #[default]
    Primary,
    /// Read from the primary when available, otherwise a secondary.
    PrimaryPreferred,
}

/// Credentials and target database for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvCredentials {
    /// Login name.
    pub login: String,
    /// Password.
    pub password: String,
    /// Database the environment's collections live in.
    pub database: String,
}

/// Connection settings shared by every environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Server host names.
    pub hosts: Vec<String>,
    /// Server port, shared by all hosts.
    pub port: u16,
    /// Whether to connect over TLS.
    pub tls: bool,
    /// Authentication database.
    pub admin_database: String,
    /// Environment selected at startup.
    pub environment: Environment,
    /// Read preference for all queries.
    #[serde(default)]
    pub read_preference: ReadPreference,
}

/// Full store configuration: settings plus per-environment credentials.
///
/// Loaded once at startup and read-only afterward.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    settings: StoreSettings,
    credentials: HashMap<Environment, EnvCredentials>,
}

impl StoreConfig {
    /// Load configuration from the settings and credentials files.
    ///
    /// Any I/O or parse failure is a fatal configuration error.
    pub fn from_files(settings_path: &Path, credentials_path: &Path) -> StoreResult<Self> {
        let settings = read_json::<StoreSettings>(settings_path)?;
        let credentials = read_json::<HashMap<Environment, EnvCredentials>>(credentials_path)?;

        let config = Self {
            settings,
            credentials,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create a builder for in-process configuration.
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::new()
    }

    /// The environment selected at startup.
    pub fn environment(&self) -> Environment {
        self.settings.environment
    }

    /// The shared connection settings.
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Credentials for an environment.
    pub fn credentials(&self, env: Environment) -> StoreResult<&EnvCredentials> {
        self.credentials
            .get(&env)
            .ok_or_else(|| StoreError::config(format!("no credentials for environment {}", env)))
    }

    /// Name of the database an environment's collections live in.
    pub fn database_name(&self, env: Environment) -> StoreResult<&str> {
        Ok(self.credentials(env)?.database.as_str())
    }

    /// Build driver client options for an environment.
    ///
    /// Credentials are derived from the environment's own entry, sourced
    /// against the authentication database.
    pub fn client_options(&self, env: Environment) -> StoreResult<ClientOptions> {
        let creds = self.credentials(env)?;

        let hosts: Vec<ServerAddress> = self
            .settings
            .hosts
            .iter()
            .map(|host| ServerAddress::Tcp {
                host: host.clone(),
                port: Some(self.settings.port),
            })
            .collect();

        let credential = Credential::builder()
            .username(creds.login.clone())
            .password(creds.password.clone())
            .source(self.settings.admin_database.clone())
            .build();

        let mut options = ClientOptions::builder()
            .hosts(hosts)
            .credential(credential)
            .app_name("corral".to_string())
            .build();

        options.selection_criteria = Some(match self.settings.read_preference {
            ReadPreference::Primary => SelectionCriteria::ReadPreference(
                mongodb::options::ReadPreference::Primary,
            ),
            ReadPreference::PrimaryPreferred => SelectionCriteria::ReadPreference(
                mongodb::options::ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                },
            ),
        });

        if self.settings.tls {
            options.tls = Some(Tls::Enabled(TlsOptions::default()));
        }

        Ok(options)
    }

    fn validate(&self) -> StoreResult<()> {
        if self.settings.hosts.is_empty() {
            return Err(StoreError::config("at least one host is required"));
        }
        if self.settings.admin_database.is_empty() {
            return Err(StoreError::config("admin database name is required"));
        }
        // The startup environment must be usable immediately.
        self.credentials(self.settings.environment)?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let raw = fs::read_to_string(path)
        .map_err(|e| StoreError::config(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw).map_err(|e| StoreError::config(format!("{}: {}", path.display(), e)))
}

/// Builder for store configuration.
#[derive(Debug, Default)]
pub struct StoreConfigBuilder {
    hosts: Vec<String>,
    port: Option<u16>,
    tls: bool,
    admin_database: Option<String>,
    environment: Option<Environment>,
    read_preference: ReadPreference,
    credentials: HashMap<Environment, EnvCredentials>,
}

impl StoreConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    /// Set the server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enable or disable TLS.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Set the authentication database.
    pub fn admin_database(mut self, name: impl Into<String>) -> Self {
        self.admin_database = Some(name.into());
        self
    }

    /// Set the startup environment.
    pub fn environment(mut self, env: Environment) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the read preference.
    pub fn read_preference(mut self, pref: ReadPreference) -> Self {
        self.read_preference = pref;
        self
    }

    /// Add credentials for an environment.
    pub fn credentials(
        mut self,
        env: Environment,
        login: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        self.credentials.insert(
            env,
            EnvCredentials {
                login: login.into(),
                password: password.into(),
                database: database.into(),
            },
        );
        self
    }

    /// Build the configuration.
    pub fn build(self) -> StoreResult<StoreConfig> {
        let environment = self
            .environment
            .ok_or_else(|| StoreError::config("startup environment is required"))?;
        let admin_database = self
            .admin_database
            .ok_or_else(|| StoreError::config("admin database name is required"))?;

        let config = StoreConfig {
            settings: StoreSettings {
                hosts: self.hosts,
                port: self.port.unwrap_or(27017),
                tls: self.tls,
                admin_database,
                environment,
                read_preference: self.read_preference,
            },
            credentials: self.credentials,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn test_config() -> StoreConfig {
        StoreConfig::builder()
            .host("db1.internal")
            .host("db2.internal")
            .port(27018)
            .admin_database("admin")
            .environment(Environment::Test)
            .credentials(Environment::Test, "app_test", "secret", "app_db_test")
            .credentials(Environment::Production, "app", "secret", "app_db")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder() {
        let config = test_config();
        assert_eq!(config.environment(), Environment::Test);
        assert_eq!(config.settings().hosts.len(), 2);
        assert_eq!(config.settings().port, 27018);
        assert_eq!(config.database_name(Environment::Test).unwrap(), "app_db_test");
        assert_eq!(config.database_name(Environment::Production).unwrap(), "app_db");
    }

    #[test]
    fn test_builder_missing_environment() {
        let result = StoreConfig::builder()
            .host("localhost")
            .admin_database("admin")
            .build();
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_builder_missing_startup_credentials() {
        let result = StoreConfig::builder()
            .host("localhost")
            .admin_database("admin")
            .environment(Environment::Production)
            .credentials(Environment::Test, "t", "t", "t")
            .build();
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_client_options_mapping() {
        let config = test_config();
        let options = config.client_options(Environment::Test).unwrap();

        assert_eq!(options.hosts.len(), 2);
        assert!(matches!(
            &options.hosts[0],
            ServerAddress::Tcp { host, port: Some(27018), .. } if host == "db1.internal"
        ));

        assert!(options.tls.is_none());
        assert!(matches!(
            &options.selection_criteria,
            Some(SelectionCriteria::ReadPreference(
                mongodb::options::ReadPreference::Primary
            ))
        ));

        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("app_test"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }

    #[test]
    fn test_client_options_primary_preferred() {
        let config = StoreConfig::builder()
            .host("localhost")
            .admin_database("admin")
            .environment(Environment::Production)
            .read_preference(ReadPreference::PrimaryPreferred)
            .credentials(Environment::Production, "app", "secret", "app_db")
            .build()
            .unwrap();
        let options = config.client_options(Environment::Production).unwrap();
        assert!(matches!(
            &options.selection_criteria,
            Some(SelectionCriteria::ReadPreference(
                mongodb::options::ReadPreference::PrimaryPreferred { .. }
            ))
        ));
    }

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();

        let settings_path = dir.path().join("settings.json");
        let mut settings = fs::File::create(&settings_path).unwrap();
        write!(
            settings,
            r#"{{
                "hosts": ["localhost"],
                "port": 27017,
                "tls": true,
                "admin_database": "admin",
                "environment": "production",
                "read_preference": "PrimaryPreferred"
            }}"#
        )
        .unwrap();

        let credentials_path = dir.path().join("credentials.json");
        let mut credentials = fs::File::create(&credentials_path).unwrap();
        write!(
            credentials,
            r#"{{
                "production": {{ "login": "app", "password": "s", "database": "app_db" }},
                "test": {{ "login": "app_t", "password": "s", "database": "app_db_t" }}
            }}"#
        )
        .unwrap();

        let config = StoreConfig::from_files(&settings_path, &credentials_path).unwrap();
        assert_eq!(config.environment(), Environment::Production);
        assert!(config.settings().tls);
        assert_eq!(
            config.settings().read_preference,
            ReadPreference::PrimaryPreferred
        );
        assert_eq!(config.database_name(Environment::Test).unwrap(), "app_db_t");
    }

    #[test]
    fn test_from_files_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = StoreConfig::from_files(
            &dir.path().join("nope.json"),
            &dir.path().join("nope2.json"),
        );
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
