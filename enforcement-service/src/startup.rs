//! Application startup and lifecycle management.

use crate::coa::{CoaDispatcher, CoaWorkerPool, RadiusCoaClient};
use crate::config::EnforcementConfig;
use crate::engine::Engine;
use crate::handlers::{router, AppState};
use crate::notify::{
    CompanyInfo, HttpNotifier, LogNotifier, NotificationDispatcher, Notifier, TemplateCatalog,
};
use crate::scheduler::{JobRunner, Scheduler};
use crate::services::{
    init_metrics, AccountingSource, Database, MemoryRadius, MemoryStore, RadiusDatabase,
    SessionDirectory, Store,
};
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    background: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

/// Persistence and RADIUS access the engine runs against.
struct Backends {
    store: Arc<dyn Store>,
    accounting: Arc<dyn AccountingSource>,
    sessions: Arc<dyn SessionDirectory>,
}

impl Backends {
    fn in_memory() -> Self {
        let radius = Arc::new(MemoryRadius::new());
        Self {
            store: Arc::new(MemoryStore::new()),
            accounting: radius.clone(),
            sessions: radius,
        }
    }

    async fn postgres(config: &EnforcementConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let radius = if config.database.radius_url == config.database.url {
            RadiusDatabase::from_pool(db.pool().clone())
        } else {
            RadiusDatabase::new(
                &config.database.radius_url,
                config.database.max_connections,
                config.database.min_connections,
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to RADIUS database");
                e
            })?
        };

        let radius = Arc::new(radius);
        Ok(Self {
            store: Arc::new(db),
            accounting: radius.clone(),
            sessions: radius,
        })
    }
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: EnforcementConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    pub async fn build_without_migrations(config: EnforcementConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: EnforcementConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let backends = if config.dry_run {
            tracing::warn!("DRY_RUN set, using the in-process store and RADIUS directory");
            Backends::in_memory()
        } else {
            Backends::postgres(&config, run_migrations).await?
        };
        let shutdown = CancellationToken::new();

        // Network control workers
        let dispatcher = Arc::new(CoaDispatcher::new(
            backends.sessions,
            Arc::new(RadiusCoaClient::new(config.coa.timeout)),
            config.coa.port,
            config.coa.default_secret.clone(),
            config.coa.timeout,
        ));
        let (pool, coa_queue) = CoaWorkerPool::new(
            dispatcher,
            backends.store.clone(),
            config.coa.workers,
            config.coa.queue_size,
            shutdown.child_token(),
        );

        // Notifications
        let notifier: Arc<dyn Notifier> = match &config.notifications.service_url {
            Some(_) if config.dry_run => Arc::new(LogNotifier),
            Some(url) => Arc::new(HttpNotifier::new(url).map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Notification client: {}", e))
            })?),
            None => {
                tracing::warn!("NOTIFICATION_SERVICE_URL not set, notifications are logged only");
                Arc::new(LogNotifier)
            }
        };
        let catalog = TemplateCatalog::load(
            CompanyInfo {
                name: config.notifications.company_name.clone(),
                email: config.notifications.company_email.clone(),
                phone: config.notifications.company_phone.clone(),
                currency: config.policy.default_currency.clone(),
            },
            config.notifications.templates_path.as_deref(),
        )?;
        let notifications = NotificationDispatcher::new(notifier, catalog);

        let engine = Engine::new(
            backends.store,
            backends.accounting,
            coa_queue,
            notifications,
            config.policy.clone(),
        );
        let jobs = Arc::new(JobRunner::new(
            engine.clone(),
            config.scheduler.lease_ttl,
            shutdown.child_token(),
        ));

        let mut background = vec![pool.start()];
        if config.scheduler.enabled {
            background.push(
                Scheduler::new(jobs.clone(), config.scheduler.clone(), shutdown.child_token())
                    .start(),
            );
        } else {
            tracing::info!("Scheduler disabled, jobs run only on manual trigger");
        }

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Enforcement service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state: AppState { engine, jobs },
            background,
            shutdown,
        })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Token that stops the scheduler and worker pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve HTTP until `signal` resolves, then drain background work.
    pub async fn run_until_stopped<F>(self, signal: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let Application {
            http_port,
            http_listener,
            state,
            background,
            shutdown,
        } = self;
        let notifications = state.engine.notifications().clone();

        tracing::info!(
            service = "enforcement-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = http_port,
            "Service ready to accept connections"
        );

        let token = shutdown.clone();
        let result = axum::serve(http_listener, router(state))
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = signal => {},
                    _ = token.cancelled() => {},
                }
            })
            .await;

        shutdown.cancel();
        for handle in background {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        notifications.settle().await;

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
