//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file, substituting `${VAR}` references.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let content = substitute_env_vars(&content)?;
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

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Resume fingerprint: configuration content plus the selected source names.
    ///
    /// Names are sorted and de-duplicated so the same selection always yields
    /// the same fingerprint regardless of the order it was requested in.
    pub fn fingerprint(&self, source_names: &[String]) -> String {
        let mut names: Vec<&str> = source_names.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();

        let mut hasher = Sha256::new();
        hasher.update(self.hash().as_bytes());
        for name in names {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Resolve the source groups to migrate.
    ///
    /// With no explicit names every enabled group is selected. Explicitly
    /// named groups are selected even when disabled.
    pub fn select_sources(&self, names: &[String]) -> Result<Vec<&SourceGroup>> {
        if names.is_empty() {
            return Ok(self.sources.iter().filter(|s| s.enabled).collect());
        }

        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let group = self
                .sources
                .iter()
                .find(|s| &s.name == name)
                .ok_or_else(|| MigrateError::Config(format!("Unknown source '{}'", name)))?;
            if !selected.iter().any(|s: &&SourceGroup| s.name == group.name) {
                selected.push(group);
            }
        }
        Ok(selected)
    }
}

/// Replace `${VAR}` with the value of environment variable `VAR`.
pub fn substitute_env_vars(text: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| MigrateError::Config(format!("env pattern: {}", e)))?;

    let mut missing = None;
    let out = re.replace_all(text, |caps: &Captures| match std::env::var(&caps[1]) {
        Ok(v) => v,
        Err(_) => {
            missing.get_or_insert_with(|| caps[1].to_string());
            String::new()
        }
    });

    match missing {
        Some(var) => Err(MigrateError::Config(format!(
            "Environment variable '{}' is not set",
            var
        ))),
        None => Ok(out.into_owned()),
    }
}

impl SourceConfig {
    /// Effective pool size for the given worker count.
    pub fn pool_size(&self, workers: usize) -> usize {
        self.max_connections.unwrap_or((workers * 2).max(4))
    }
}

impl TargetConfig {
    /// Effective pool size for the given worker count.
    pub fn pool_size(&self, workers: usize) -> usize {
        self.max_connections.unwrap_or((workers * 2).max(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
source:
  host: warehouse.local
  database: dw
  user: loader
target:
  host: pg.local
  database: app
  user: app
migration:
  batch_size: 5000
sources:
  - name: analytics
    source_schema: ANALYTICS
    target_schema: analytics
    tables:
      - source: EVENTS
        target: events
        chunking_columns: [id]
        chunking_column_types: [bigint]
        uniqueness_columns: [id]
  - name: billing
    source_schema: BILLING
    target_schema: billing
    tables:
      - source: INVOICES
        target: invoices
  - name: archive
    enabled: false
    source_schema: ARCHIVE
    target_schema: archive
    tables:
      - source: OLD
        target: old
"#;

    #[test]
    fn test_parse_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 5439);
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.ssl_mode, "require");
        assert_eq!(config.migration.get_batch_size(), 5000);
        assert_eq!(config.migration.get_parallel_threads(), 4);
        assert_eq!(config.migration.get_sub_batch_sizes(), vec![10_000, 5_000, 2_000]);
        let table = &config.sources[0].tables[0];
        assert!(table.enabled);
        assert_eq!(table.resolved_filter(), "1=1");
        assert_eq!(table.chunking_column(), Some(("id", "bigint")));
    }

    #[test]
    fn test_fingerprint_ignores_selection_order() {
        let config = Config::from_yaml(YAML).unwrap();
        let a = config.fingerprint(&["analytics".into(), "billing".into()]);
        let b = config.fingerprint(&["billing".into(), "analytics".into()]);
        let c = config.fingerprint(&["billing".into(), "analytics".into(), "billing".into()]);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, config.fingerprint(&["analytics".into()]));
    }

    #[test]
    fn test_fingerprint_tracks_config_content() {
        let config = Config::from_yaml(YAML).unwrap();
        let mut changed = config.clone();
        changed.migration.batch_size = Some(7000);
        let names = vec!["analytics".to_string()];
        assert_ne!(config.fingerprint(&names), changed.fingerprint(&names));
    }

    #[test]
    fn test_select_sources() {
        let config = Config::from_yaml(YAML).unwrap();
        let all: Vec<_> = config
            .select_sources(&[])
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(all, vec!["analytics", "billing"]);

        let explicit = config.select_sources(&["archive".into()]).unwrap();
        assert_eq!(explicit.len(), 1);

        assert!(config.select_sources(&["nope".into()]).is_err());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("WM_TEST_PG_PASSWORD", "s3cret");
        let out = substitute_env_vars("password: ${WM_TEST_PG_PASSWORD}").unwrap();
        assert_eq!(out, "password: s3cret");

        let err = substitute_env_vars("password: ${WM_TEST_SURELY_UNSET_VAR}").unwrap_err();
        assert!(err.to_string().contains("WM_TEST_SURELY_UNSET_VAR"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", YAML).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sources.len(), 3);
    }

    #[test]
    fn test_password_redacted() {
        let mut config = Config::from_yaml(YAML).unwrap();
        config.target.password = "hunter2".into();
        let debug = format!("{:?}", config.target);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }
}
