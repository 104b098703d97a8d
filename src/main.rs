use std::process;

use chunk_cache::{
    application::error::AppError,
    cache::{KeyPattern, PersistentStore},
    config::{self, Command, Settings},
    infra::{db::SearchCacheDatabase, telemetry},
};
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let database = SearchCacheDatabase::connect(&settings.database).await?;
    database.health_check().await?;

    match cli_args.command {
        Command::Migrate(_) => run_migrate(&database).await,
        Command::Cleanup(_) => run_cleanup(&database, &settings).await,
        Command::Stats(_) => run_stats(&database, &settings).await,
        Command::Invalidate(args) => run_invalidate(&database, &settings, &args.patterns).await,
    }
}

async fn run_migrate(database: &SearchCacheDatabase) -> Result<(), AppError> {
    database.run_migrations().await?;
    info!(backend = database.backend().as_str(), "Migrations applied");
    Ok(())
}

async fn run_cleanup(database: &SearchCacheDatabase, settings: &Settings) -> Result<(), AppError> {
    let store = PersistentStore::new(database.repo(), settings.cache.clone());
    let deleted = store.cleanup_expired_entries().await?;
    println!("Deleted {deleted} expired search cache rows");
    Ok(())
}

async fn run_stats(database: &SearchCacheDatabase, settings: &Settings) -> Result<(), AppError> {
    let store = PersistentStore::new(database.repo(), settings.cache.clone());
    let stats = store.get_cache_stats().await?;
    let suggestions = store.get_optimization_suggestions().await?;

    let report = json!({
        "stats": stats,
        "suggestions": suggestions,
    });
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(format!("failed to render stats: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_invalidate(
    database: &SearchCacheDatabase,
    settings: &Settings,
    patterns: &[String],
) -> Result<(), AppError> {
    let patterns: Vec<KeyPattern> = patterns
        .iter()
        .map(|pattern| pattern.trim())
        .filter(|pattern| !pattern.is_empty())
        .map(KeyPattern::parse)
        .collect();
    if patterns.is_empty() {
        return Err(AppError::validation("at least one non-empty pattern is required"));
    }

    let store = PersistentStore::new(database.repo(), settings.cache.clone());
    let deleted = store.invalidate_search_cache(&patterns).await?;
    println!("Deleted {deleted} search cache rows");
    Ok(())
}
