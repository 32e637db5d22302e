//! Service wiring: stores, mail provider, sync service and runner.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{info, warn};

use finsync_infra::db;
use finsync_infra::jobs::{
    InMemorySyncJobRepository, PostgresSyncJobRepository, SyncJobRepository, SyncRunner,
};
use finsync_infra::provider::{EmailProvider, GmailGateway, InMemoryMailbox, StaticTokenSource};
use finsync_infra::raw_email::{InMemoryRawEmailStore, PostgresRawEmailStore, RawEmailStore};
use finsync_infra::sync::{EmailSyncService, KeywordParser, SyncSettings};

use crate::config::{AppConfig, GmailConfig, Persistence};

/// Shared state behind every protected route.
pub struct AppServices {
    pub sync: Arc<EmailSyncService>,
    pub runner: Arc<SyncRunner>,
    pool: Option<PgPool>,
}

impl AppServices {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        emails: Arc<dyn RawEmailStore>,
        jobs: Arc<dyn SyncJobRepository>,
        settings: SyncSettings,
    ) -> Self {
        let sync = Arc::new(
            EmailSyncService::new(provider, emails, jobs, settings)
                .with_parser(Arc::new(KeywordParser::new())),
        );
        let runner = Arc::new(SyncRunner::new(sync.clone()));
        Self {
            sync,
            runner,
            pool: None,
        }
    }

    /// In-memory stores around the given provider (dev and tests).
    pub fn in_memory(provider: Arc<dyn EmailProvider>, settings: SyncSettings) -> Self {
        Self::new(
            provider,
            Arc::new(InMemoryRawEmailStore::new()),
            InMemorySyncJobRepository::arc(),
            settings,
        )
    }

    fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Drain background jobs, then close the database pool.
    pub async fn shutdown(&self, grace: Duration) {
        let interrupted = self.runner.shutdown(grace).await;
        if interrupted > 0 {
            warn!(interrupted, "sync jobs interrupted by shutdown");
        }
        if let Some(pool) = &self.pool {
            pool.close().await;
            info!("database pool closed");
        }
    }
}

/// Build services from configuration.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, sqlx::Error> {
    let provider = build_provider(config.gmail.as_ref());

    match &config.persistence {
        Persistence::InMemory => {
            info!("using in-memory stores");
            Ok(AppServices::in_memory(provider, config.sync.clone()))
        }
        Persistence::Postgres {
            database_url,
            max_connections,
        } => {
            let pool = db::connect(database_url, *max_connections).await?;
            db::ensure_schema(&pool).await?;
            let services = AppServices::new(
                provider,
                Arc::new(PostgresRawEmailStore::new(pool.clone())),
                Arc::new(PostgresSyncJobRepository::new(pool.clone())),
                config.sync.clone(),
            );
            Ok(services.with_pool(pool))
        }
    }
}

fn build_provider(gmail: Option<&GmailConfig>) -> Arc<dyn EmailProvider> {
    match gmail {
        Some(gmail) => {
            info!(api_base = %gmail.api_base, "using gmail provider");
            Arc::new(GmailGateway::new(
                reqwest::Client::new(),
                gmail.api_base.clone(),
                Arc::new(StaticTokenSource::new(gmail.access_token.clone())),
            ))
        }
        None => {
            warn!("GMAIL_ACCESS_TOKEN not set; using an empty in-memory mailbox");
            Arc::new(InMemoryMailbox::new())
        }
    }
}
