use std::path::Path;

use anyhow::Context;
use indoc::indoc;

use crate::{BackendFailurePolicy, Config};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref().to_path_buf();

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| format!("Failed to parse configuration file {}", path.display()))?;

    validate(&config)?;

    for warning in warnings(&config) {
        log::warn!("{warning}");
    }

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    config.rate_limit.validate()
}

/// Settings that are valid but probably not what the operator wants.
fn warnings(config: &Config) -> Vec<String> {
    let limits = &config.rate_limit;
    let mut warnings = Vec::new();

    if !limits.enabled {
        warnings.push("Rate limiting is disabled, every request will be admitted".to_string());
        return warnings;
    }

    if limits.requests_per_hour < limits.requests_per_minute {
        warnings.push(format!(
            "rate_limit.requests_per_hour ({}) is lower than rate_limit.requests_per_minute ({}), the minute limit can never be reached",
            limits.requests_per_hour, limits.requests_per_minute
        ));
    }

    if limits.tokens_per_hour < limits.tokens_per_minute {
        warnings.push(format!(
            "rate_limit.tokens_per_hour ({}) is lower than rate_limit.tokens_per_minute ({}), the minute limit can never be reached",
            limits.tokens_per_hour, limits.tokens_per_minute
        ));
    }

    if limits.storage.is_distributed() && limits.on_backend_failure == BackendFailurePolicy::Open {
        warnings.push(
            indoc! {r#"
                Distributed storage is configured with on_backend_failure = "open". While the backend is unreachable
                every instance enforces its own limits, multiplying the effective capacity by the number of instances.
            "#}
            .trim_end()
            .to_string(),
        );
    }

    if !limits.per_user && limits.require_user_id {
        warnings.push(
            "rate_limit.require_user_id is set but per_user is false, all callers still share one bucket".to_string(),
        );
    }

    warnings
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use indoc::indoc;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_valid_file() {
        let file = write_config(indoc! {r#"
            [rate_limit]
            requests_per_minute = 2
            burst_multiplier = 1.0
        "#});

        let config = load(file.path()).unwrap();

        assert_eq!(config.rate_limit.requests_per_minute, 2);
        assert_eq!(config.rate_limit.burst_multiplier, 1.0);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let file = write_config(indoc! {r#"
            [rate_limit]
            max_concurrent_requests = 0
        "#});

        let error = load(file.path()).unwrap_err();

        insta::assert_snapshot!(error, @"rate_limit.max_concurrent_requests must be at least 1");
    }

    #[test]
    fn load_missing_file() {
        let error = load("/definitely/not/here/gatekeeper.toml").unwrap_err();

        assert!(error.to_string().starts_with("Failed to read configuration file"));
    }

    #[test]
    fn distributed_open_policy_warns() {
        let config: Config = toml::from_str(indoc! {r#"
            [rate_limit.storage]
            type = "redis"
            url = "redis://localhost:6379/1"
        "#})
        .unwrap();

        let warnings = warnings(&config);

        insta::assert_debug_snapshot!(warnings, @r#"
        [
            "Distributed storage is configured with on_backend_failure = \"open\". While the backend is unreachable\nevery instance enforces its own limits, multiplying the effective capacity by the number of instances.",
        ]
        "#);
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(warnings(&Config::default()).is_empty());
    }
}
