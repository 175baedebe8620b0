//! Per-environment client and database resolution.

use std::collections::HashMap;

use mongodb::{Client, Database};
use parking_lot::RwLock;
use tracing::info;

use crate::config::{Environment, StoreConfig};
use crate::error::StoreResult;

/// Routes operations to the database handle of an environment.
///
/// One driver client per environment, built lazily on first use and cached;
/// credentials are derived from that environment's own entry at build time.
/// The interior locks are held only while resolving a handle, never across a
/// query, so concurrent calls routed to different environments do not race.
pub struct EnvRouter {
    config: StoreConfig,
    handles: RwLock<HashMap<Environment, Database>>,
    default_env: RwLock<Environment>,
}

impl EnvRouter {
    /// Create a router; the default environment comes from the settings.
    pub fn new(config: StoreConfig) -> Self {
        let default_env = config.environment();
        Self {
            config,
            handles: RwLock::new(HashMap::new()),
            default_env: RwLock::new(default_env),
        }
    }

    /// The configuration this router was built from.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The environment used when a call passes no override.
    pub fn default_env(&self) -> Environment {
        *self.default_env.read()
    }

    /// Switch the process-wide default environment.
    ///
    /// Calls already in flight keep the handle they resolved; only the
    /// default for subsequent calls changes.
    pub fn set_default(&self, env: Environment) {
        *self.default_env.write() = env;
        info!(environment = %env, "default environment switched");
    }

    /// Resolve the database handle for an optional environment override.
    pub fn database(&self, env: Option<Environment>) -> StoreResult<Database> {
        let env = env.unwrap_or_else(|| self.default_env());

        if let Some(database) = self.handles.read().get(&env) {
            return Ok(database.clone());
        }

        let mut handles = self.handles.write();
        // Another caller may have built the handle while we waited.
        if let Some(database) = handles.get(&env) {
            return Ok(database.clone());
        }

        let options = self.config.client_options(env)?;
        let client = Client::with_options(options)?;
        let database = client.database(self.config.database_name(env)?);
        info!(
            environment = %env,
            database = %database.name(),
            "database handle created"
        );
        handles.insert(env, database.clone());
        Ok(database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> EnvRouter {
        let config = StoreConfig::builder()
            .host("localhost")
            .admin_database("admin")
            .environment(Environment::Production)
            .credentials(Environment::Production, "app", "secret", "app_db")
            .credentials(Environment::Test, "app_test", "secret", "app_db_test")
            .build()
            .unwrap();
        EnvRouter::new(config)
    }

    #[tokio::test]
    async fn test_default_environment_from_settings() {
        let router = router();
        assert_eq!(router.default_env(), Environment::Production);
        assert_eq!(router.database(None).unwrap().name(), "app_db");
    }

    #[tokio::test]
    async fn test_override_routes_to_other_environment() {
        let router = router();
        let database = router.database(Some(Environment::Test)).unwrap();
        assert_eq!(database.name(), "app_db_test");
        // The default is untouched by an override.
        assert_eq!(router.default_env(), Environment::Production);
    }

    #[tokio::test]
    async fn test_set_default_switches_subsequent_calls() {
        let router = router();
        router.set_default(Environment::Test);
        assert_eq!(router.database(None).unwrap().name(), "app_db_test");
    }

    #[tokio::test]
    async fn test_handles_are_cached() {
        let router = router();
        router.database(None).unwrap();
        router.database(Some(Environment::Test)).unwrap();
        assert_eq!(router.handles.read().len(), 2);

        router.database(None).unwrap();
        assert_eq!(router.handles.read().len(), 2);
    }
}
