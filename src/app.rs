use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info};

use crate::{
    config::{self, AppConfig},
    db::{self, DbPool},
    errors::ServiceError,
    events::{self, EventSender},
    notifications::Hooks,
    services::factory::{ServiceContainer, ServiceFactory},
};

/// A wired engine: pool, services and the running event loop.
pub struct App {
    pub config: AppConfig,
    pub db: Arc<DbPool>,
    pub services: ServiceContainer,
    pub event_sender: EventSender,
    /// Finishes once every `EventSender` clone is dropped.
    pub event_loop: JoinHandle<()>,
}

impl App {
    /// Loads configuration from the environment and bootstraps with log-only notifications.
    pub async fn from_env() -> anyhow::Result<Self> {
        let cfg = config::load_config()?;
        config::init_tracing(&cfg.log_level, cfg.log_json);
        Ok(Self::bootstrap(cfg, None).await?)
    }

    /// Connects, migrates when `auto_migrate` is set, and starts the event loop. `hooks`
    /// defaults to log-only notifications with tasks persisted in the same database.
    pub async fn bootstrap(cfg: AppConfig, hooks: Option<Hooks>) -> Result<Self, ServiceError> {
        let pool = db::establish_connection_from_app_config(&cfg).await?;
        db::check_connection(&pool).await?;
        if cfg.auto_migrate {
            db::run_migrations(&pool).await.map_err(|e| {
                error!("Failed running migrations: {}", e);
                e
            })?;
        }

        let db = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
        let event_sender = EventSender::new(event_tx);
        let event_loop = tokio::spawn(events::process_events(event_rx));

        let factory = match hooks {
            Some(hooks) => ServiceFactory::new(db.clone(), hooks, Some(event_sender.clone())),
            None => ServiceFactory::with_default_hooks(db.clone(), Some(event_sender.clone())),
        };
        let services = ServiceContainer::new(&factory);

        info!(environment = %cfg.environment, "prodflow engine ready");
        Ok(Self {
            config: cfg,
            db,
            services,
            event_sender,
            event_loop,
        })
    }
}
