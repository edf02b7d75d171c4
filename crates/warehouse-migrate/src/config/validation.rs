//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }

    // Migration config validation - only check if explicitly set
    let migration = &config.migration;
    if let Some(0) = migration.parallel_threads {
        return Err(MigrateError::Config(
            "migration.parallel_threads must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.batch_size {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.batch_size_copy_mode {
        return Err(MigrateError::Config(
            "migration.batch_size_copy_mode must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.max_retry_attempts {
        return Err(MigrateError::Config(
            "migration.max_retry_attempts must be at least 1".into(),
        ));
    }
    if migration.get_retry_min_wait_secs() > migration.get_retry_max_wait_secs() {
        return Err(MigrateError::Config(
            "migration.retry_min_wait_secs cannot exceed retry_max_wait_secs".into(),
        ));
    }
    if let Some(floor) = migration.success_rate_floor {
        if !(0.0..=1.0).contains(&floor) {
            return Err(MigrateError::Config(format!(
                "migration.success_rate_floor must be between 0 and 1, got {}",
                floor
            )));
        }
    }
    if let Some(ref sizes) = migration.sub_batch_sizes {
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(MigrateError::Config(
                "migration.sub_batch_sizes must be non-empty and positive".into(),
            ));
        }
        if sizes.windows(2).any(|w| w[1] >= w[0]) {
            return Err(MigrateError::Config(
                "migration.sub_batch_sizes must be strictly decreasing".into(),
            ));
        }
    }

    // Sources
    if config.sources.is_empty() {
        return Err(MigrateError::Config(
            "at least one entry in sources is required".into(),
        ));
    }
    for (idx, group) in config.sources.iter().enumerate() {
        if group.name.is_empty() {
            return Err(MigrateError::Config(format!(
                "sources[{}].name is required",
                idx
            )));
        }
        if config.sources.iter().filter(|g| g.name == group.name).count() > 1 {
            return Err(MigrateError::Config(format!(
                "duplicate source name '{}'",
                group.name
            )));
        }
        for (tidx, table) in group.tables.iter().enumerate() {
            let at = format!("sources[{}].tables[{}]", idx, tidx);
            if table.source.is_empty() || table.target.is_empty() {
                return Err(MigrateError::Config(format!(
                    "{}: source and target are required",
                    at
                )));
            }
            if !table.chunking_column_types.is_empty()
                && table.chunking_columns.len() != table.chunking_column_types.len()
            {
                return Err(MigrateError::Config(format!(
                    "{}: chunking_columns and chunking_column_types must have same length",
                    at
                )));
            }
            if let Some(0) = table.batch_size {
                return Err(MigrateError::Config(format!(
                    "{}: batch_size must be at least 1",
                    at
                )));
            }
            if let Some(0) = table.parallel_threads {
                return Err(MigrateError::Config(format!(
                    "{}: parallel_threads must be at least 1",
                    at
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig, SourceGroup, TableConfig, TargetConfig};

    fn table() -> TableConfig {
        TableConfig {
            source: "EVENTS".to_string(),
            target: "events".to_string(),
            enabled: true,
            filter: None,
            chunking_columns: vec!["id".to_string()],
            chunking_column_types: vec!["bigint".to_string()],
            sort_column: None,
            uniqueness_columns: vec!["id".to_string()],
            source_watermark: None,
            target_watermark: None,
            truncate_onstart: false,
            insert_only_mode: false,
            disable_index: false,
            batch_size: None,
            parallel_threads: None,
        }
    }

    fn valid_config() -> Config {
        Config {
            source: SourceConfig {
                host: "warehouse".to_string(),
                port: 5439,
                database: "dw".to_string(),
                user: "loader".to_string(),
                password: "password".to_string(),
                ssl_mode: "require".to_string(),
                max_connections: None,
            },
            target: TargetConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "target_db".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                ssl_mode: "disable".to_string(),
                max_connections: None,
            },
            migration: MigrationConfig::default(),
            sources: vec![SourceGroup {
                name: "analytics".to_string(),
                enabled: true,
                source_schema: "ANALYTICS".to_string(),
                target_schema: "analytics".to_string(),
                tables: vec![table()],
            }],
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_target_database() {
        let mut config = valid_config();
        config.target.database = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_no_sources() {
        let mut config = valid_config();
        config.sources.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_source_names() {
        let mut config = valid_config();
        let dup = config.sources[0].clone();
        config.sources.push(dup);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_chunking_type_length_mismatch() {
        let mut config = valid_config();
        config.sources[0].tables[0].chunking_column_types =
            vec!["bigint".to_string(), "date".to_string()];
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("same length"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.migration.batch_size = Some(0);
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.sources[0].tables[0].batch_size = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_sub_batch_ladder_must_shrink() {
        let mut config = valid_config();
        config.migration.sub_batch_sizes = Some(vec![5_000, 5_000]);
        assert!(validate(&config).is_err());

        config.migration.sub_batch_sizes = Some(vec![]);
        assert!(validate(&config).is_err());

        config.migration.sub_batch_sizes = Some(vec![8_000, 1_000]);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_success_rate_floor_range() {
        let mut config = valid_config();
        config.migration.success_rate_floor = Some(1.5);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_retry_wait_order() {
        let mut config = valid_config();
        config.migration.retry_min_wait_secs = Some(120);
        assert!(validate(&config).is_err());
    }
}
