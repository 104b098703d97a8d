//! Database-backed search cache repositories.

mod search_cache_pg;
mod search_cache_sqlite;
mod util;

pub use search_cache_pg::PostgresSearchCacheRepo;
pub use search_cache_sqlite::SqliteSearchCacheRepo;
pub use util::map_sqlx_error;

use std::sync::Arc;

use tracing::info;

use crate::application::repos::SearchCacheRepo;
use crate::config::DatabaseSettings;

use super::error::InfraError;

/// Database engine, chosen from the connection URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    pub fn from_url(url: &str) -> Result<Self, InfraError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(InfraError::configuration(
                "database.url must start with `postgres://`, `postgresql://` or `sqlite:`",
            ))
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }
}

/// A connected search cache repository for either backend.
#[derive(Clone)]
pub enum SearchCacheDatabase {
    Postgres(PostgresSearchCacheRepo),
    Sqlite(SqliteSearchCacheRepo),
}

impl SearchCacheDatabase {
    /// Connect using `settings.url`; the backend follows the URL scheme.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, InfraError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| InfraError::configuration("database.url is not set"))?;
        let backend = Backend::from_url(url)?;

        let database = match backend {
            Backend::Postgres => PostgresSearchCacheRepo::connect(settings, url)
                .await
                .map(|pool| Self::Postgres(PostgresSearchCacheRepo::new(pool))),
            Backend::Sqlite => SqliteSearchCacheRepo::connect(settings, url)
                .await
                .map(|pool| Self::Sqlite(SqliteSearchCacheRepo::new(pool))),
        }
        .map_err(|source| InfraError::Connect {
            backend: backend.as_str(),
            source,
        })?;

        info!(
            backend = backend.as_str(),
            max_connections = settings.max_connections.get(),
            "Connected to search cache database"
        );
        Ok(database)
    }

    pub fn backend(&self) -> Backend {
        match self {
            Self::Postgres(_) => Backend::Postgres,
            Self::Sqlite(_) => Backend::Sqlite,
        }
    }

    pub async fn run_migrations(&self) -> Result<(), InfraError> {
        match self {
            Self::Postgres(repo) => repo.run_migrations().await,
            Self::Sqlite(repo) => repo.run_migrations().await,
        }
        .map_err(InfraError::Migration)
    }

    pub async fn health_check(&self) -> Result<(), InfraError> {
        match self {
            Self::Postgres(repo) => repo.health_check().await,
            Self::Sqlite(repo) => repo.health_check().await,
        }
        .map_err(InfraError::HealthCheck)
    }

    pub fn repo(&self) -> Arc<dyn SearchCacheRepo> {
        match self {
            Self::Postgres(repo) => Arc::new(repo.clone()),
            Self::Sqlite(repo) => Arc::new(repo.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_follows_url_scheme() {
        assert_eq!(
            Backend::from_url("postgres://u:p@localhost/db").unwrap(),
            Backend::Postgres
        );
        assert_eq!(
            Backend::from_url("postgresql://localhost/db").unwrap(),
            Backend::Postgres
        );
        assert_eq!(
            Backend::from_url("sqlite::memory:").unwrap(),
            Backend::Sqlite
        );
        assert!(matches!(
            Backend::from_url("mysql://localhost/db"),
            Err(InfraError::Configuration { .. })
        ));
    }
}
