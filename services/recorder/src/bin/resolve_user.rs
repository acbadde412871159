//! Resolve login names to canonical account IDs.
//!
//! Usage: `resolve-user <login>...`
//!
//! Uses the recorder's configuration and identity cache, so every name
//! resolved here is served from the cache by the running service.

use anyhow::{bail, Context, Result};
use clap::Parser;
use live_recorder::{
    AccountIdentifier, Config, HelixClient, RateLimiter, ResolveError, SqliteStore, TokenStore,
    UserResolver,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const TOKEN_ATTEMPTS: u32 = 3;

#[derive(Debug, Parser)]
#[command(name = "resolve-user", version, about = "Resolve login names to canonical account IDs")]
struct Cli {
    /// Login names to resolve
    #[arg(required = true, value_name = "LOGIN")]
    logins: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let store = Arc::new(
        SqliteStore::connect(&config.database)
            .await
            .context("Failed to open database")?,
    );
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let client = Arc::new(HelixClient::new(&config.api).context("Failed to build HTTP client")?);
    let tokens = Arc::new(
        TokenStore::new(client.clone(), config.token.retry_delay()).with_max_attempts(TOKEN_ATTEMPTS),
    );
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_requests,
        config.rate_limit.period(),
    ));

    let resolver = UserResolver::new(client, store.clone(), tokens, limiter);

    let mut failed = false;
    for login in &cli.logins {
        match resolver.resolve(&AccountIdentifier::parse(login)).await {
            Ok(id) => println!("{} -> {}", login, id),
            Err(ResolveError::NotFound(_)) => println!("{} -> not found", login),
            Err(e) => {
                eprintln!("{} -> error: {}", login, e);
                failed = true;
            }
        }
    }

    store.pool().close().await;

    if failed {
        bail!("Some logins could not be resolved");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_collects_every_login() {
        let cli = Cli::try_parse_from(["resolve-user", "foo", "Bar"]).unwrap();
        assert_eq!(cli.logins, vec!["foo", "Bar"]);
    }

    #[test]
    fn test_requires_a_login() {
        let err = Cli::try_parse_from(["resolve-user"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_help_and_version_are_not_logins() {
        let err = Cli::try_parse_from(["resolve-user", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);

        let err = Cli::try_parse_from(["resolve-user", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
