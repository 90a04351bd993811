//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_with_defaults() {
        let yaml = r#"
environments:
  production:
    host: db.internal
    database: app
    user: replicator
    password: secret
  sandbox:
    host: sandbox.internal
    database: app
    user: replicator
    password: secret
replication:
  full_sync_tables: [users, roles]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.environments.len(), 2);
        assert_eq!(config.environments["production"].port, 3306);
        assert_eq!(config.environments["production"].charset, "utf8mb4");
        assert_eq!(config.replication.batch_size, 2_000);
        assert_eq!(config.replication.full_sync_tables, vec!["users", "roles"]);
        assert_eq!(config.backup.keep_last, 10);
        assert!(config.backup.max_age_days.is_none());
    }

    #[test]
    fn test_unknown_environment_lookup() {
        let yaml = r#"
environments:
  sandbox:
    host: localhost
    database: app
    user: u
    password: p
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.environment("sandbox").is_ok());
        let err = config.environment("staging").unwrap_err();
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(Config::from_yaml("environments: [not, a, map]").is_err());
    }
}
