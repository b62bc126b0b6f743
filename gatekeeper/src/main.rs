use args::{Args, Caller, Command};
use clap::Parser;
use config::RateLimitConfig;
use rate_limit::{GLOBAL_KEY, Identifier, RateLimitError, RateLimiter, ceiling};

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args)?;

    let config = args.config()?;
    let _telemetry = telemetry::init(&config.telemetry).await?;

    if let Command::Validate = args.command {
        println!("{}", describe(&config.rate_limit));
        return Ok(());
    }

    let limiter = RateLimiter::new(config.rate_limit)?;
    let result = run(&args.command, &limiter).await;

    limiter.close().await;

    result
}

async fn run(command: &Command, limiter: &RateLimiter) -> anyhow::Result<()> {
    match command {
        Command::Validate => {}
        Command::Check { caller, tokens } => {
            let identifier = resolve(limiter, caller)?;

            let decision = match limiter.check(&identifier, *tokens).await {
                Ok(()) => serde_json::json!({
                    "identifier": identifier.as_str(),
                    "allowed": true,
                }),
                Err(error) => rejection(&identifier, &error),
            };

            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Command::Usage { caller } => {
            let identifier = resolve(limiter, caller)?;
            let usage = limiter.usage_snapshot(&identifier).await;

            println!("{}", serde_json::to_string_pretty(&usage)?);
        }
        Command::Reset { all: true, .. } => {
            limiter.reset(None).await;
            println!("Cleared all rate limit counters");
        }
        Command::Reset { caller, all: false } => {
            let identifier = if limiter.config().per_user {
                resolve(limiter, caller)?
            } else {
                Identifier::new(GLOBAL_KEY)
            };

            limiter.reset(Some(&identifier)).await;
            println!("Cleared rate limit counters of '{identifier}'");
        }
    }

    Ok(())
}

fn resolve(limiter: &RateLimiter, caller: &Caller) -> anyhow::Result<Identifier> {
    let identifier = limiter.resolve(caller.user.as_deref(), caller.session.as_deref())?;
    Ok(identifier)
}

fn rejection(identifier: &Identifier, error: &RateLimitError) -> serde_json::Value {
    serde_json::json!({
        "identifier": identifier.as_str(),
        "allowed": false,
        "reason": error.kind(),
        "message": error.to_string(),
        "retry_after_ms": error.retry_after().map(|retry| retry.as_millis() as u64),
    })
}

/// Human readable summary of the limits a configuration enforces.
fn describe(config: &RateLimitConfig) -> String {
    if !config.enabled {
        return "Configuration is valid, rate limiting is disabled".to_string();
    }

    let burst = config.burst_multiplier;

    let limits = [
        ("requests per minute", config.requests_per_minute),
        ("requests per hour", config.requests_per_hour),
        ("tokens per minute", config.tokens_per_minute),
        ("tokens per hour", config.tokens_per_hour),
    ];

    let mut lines = vec!["Configuration is valid".to_string()];

    for (name, limit) in limits {
        lines.push(format!("  {name}: {limit} (admits up to {})", ceiling(limit, burst)));
    }

    lines.push(format!("  concurrent requests: {}", config.max_concurrent_requests));

    let scope = if config.per_user { "per caller" } else { "global" };
    let storage = if config.storage.is_distributed() { "redis" } else { "memory" };

    lines.push(format!("  scope: {scope}, storage: {storage}"));

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rate_limit::Window;

    use super::*;

    #[test]
    fn describe_shows_burst_ceilings() {
        let config = RateLimitConfig {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            tokens_per_minute: 1000,
            tokens_per_hour: 10_000,
            max_concurrent_requests: 4,
            burst_multiplier: 1.5,
            ..Default::default()
        };

        insta::assert_snapshot!(describe(&config), @r"
        Configuration is valid
          requests per minute: 60 (admits up to 90)
          requests per hour: 1000 (admits up to 1500)
          tokens per minute: 1000 (admits up to 1500)
          tokens per hour: 10000 (admits up to 15000)
          concurrent requests: 4
          scope: per caller, storage: memory
        ");
    }

    #[test]
    fn describe_disabled() {
        let config = RateLimitConfig {
            enabled: false,
            ..Default::default()
        };

        insta::assert_snapshot!(describe(&config), @"Configuration is valid, rate limiting is disabled");
    }

    #[test]
    fn rejection_carries_retry_hint() {
        let error = RateLimitError::RequestRateExceeded {
            window: Window::Minute,
            current: 90,
            limit: 90,
            retry_after: Duration::from_millis(1500),
        };

        let value = rejection(&Identifier::new("alice"), &error);

        insta::assert_snapshot!(serde_json::to_string_pretty(&value).unwrap(), @r#"
        {
          "allowed": false,
          "identifier": "alice",
          "message": "Rate limit exceeded: 90/90 requests per minute",
          "reason": "requests_per_minute",
          "retry_after_ms": 1500
        }
        "#);
    }
}
