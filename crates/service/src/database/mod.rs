mod metadata_provider;

use std::ops::Deref;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Handle to the archive metadata store
#[derive(Clone, Debug)]
pub struct Database(PgPool);

impl Database {
    pub async fn connect(database_url: &url::Url) -> Result<Self, DatabaseSetupError> {
        if database_url.scheme() != "postgres" && database_url.scheme() != "postgresql" {
            return Err(DatabaseSetupError::UnknownDbType(
                database_url.scheme().to_string(),
            ));
        }
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url.as_str())
            .await
            .map_err(DatabaseSetupError::Unavailable)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DatabaseSetupError::MigrationFailed)?;
        Ok(Database(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self(pool)
    }

    /// Cheap readiness probe for the health endpoint
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.0).await?;
        Ok(())
    }
}

impl Deref for Database {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseSetupError {
    #[error("error occurred while attempting database migration: {0}")]
    MigrationFailed(sqlx::migrate::MigrateError),

    #[error("unable to perform initial connection and check of the database: {0}")]
    Unavailable(sqlx::Error),

    #[error("requested database type was not recognized: {0}")]
    UnknownDbType(String),
}
