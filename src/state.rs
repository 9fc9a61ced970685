//! Application State
//!
//! The composition root. Builds every service once, wires them together, and
//! hands `Arc` handles to the HTTP layer. No component reaches for a global;
//! tests substitute fakes by constructing the pieces directly.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::services::agents::build_registry;
use crate::services::materializer::{
    passthrough_codec, ArtifactResolver, Codec, Materializer, UnconfiguredResolver,
};
use crate::services::notify::Notifier;
use crate::services::pipeline::Pipeline;
use crate::services::progress::ProgressBus;
use crate::services::queue::Scheduler;
use crate::services::rules::RuleCatalog;
use crate::storage::config::ConfigUpdate;
use crate::storage::{AppConfig, ConfigService, Database};
use crate::utils::error::AppResult;

/// Shared application state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<ConfigService>>,
    pub db: Arc<Database>,
    pub catalog: Arc<RuleCatalog>,
    pub bus: Arc<ProgressBus>,
    pub notifier: Arc<Notifier>,
    pub scheduler: Arc<Scheduler>,
    pub agents: Arc<crate::services::agents::runner::AgentRegistry>,
    /// Snapshot of the config the services were built with
    pub boot_config: Arc<AppConfig>,
}

impl AppState {
    /// Build the full service graph from configuration. The decryption codec
    /// and artifact resolver are injection points: pass `None` to run with
    /// the passthrough codec and the unconfigured resolver.
    pub fn initialize(
        config_service: ConfigService,
        codec: Option<Codec>,
        resolver: Option<Arc<dyn ArtifactResolver>>,
    ) -> AppResult<Self> {
        let config = config_service.get_clone();

        let db = Arc::new(Database::open(&config.database_path()?)?);
        let catalog = Arc::new(RuleCatalog::load(config.rules_dir()?)?);
        let bus = Arc::new(ProgressBus::new());
        let notifier = Arc::new(Notifier::new(config.notify.clone()));
        let agents = Arc::new(build_registry(&config.agents, &config.limits));

        let materializer = Arc::new(Materializer::new(
            codec.unwrap_or_else(passthrough_codec),
            resolver.unwrap_or_else(|| Arc::new(UnconfiguredResolver)),
            &config.materializer,
            &config.limits,
        ));

        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            catalog.clone(),
            materializer,
            agents.clone(),
            bus.clone(),
            notifier.clone(),
            config.workspace_root()?,
            config.limits.clone(),
            config.storage.code_repo_path.clone(),
        ));

        let scheduler = Scheduler::new(
            db.clone(),
            pipeline,
            bus.clone(),
            &config.queue,
            config.storage.clone(),
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config_service)),
            db,
            catalog,
            bus,
            notifier,
            scheduler,
            agents,
            boot_config: Arc::new(config),
        })
    }

    /// Run the recovery sweep and start the worker pool. Called once, after
    /// initialize and before the HTTP listener accepts connections.
    pub fn start(&self) -> AppResult<()> {
        self.scheduler.start()
    }

    /// Apply a runtime settings update. Worker count changes take effect on
    /// the live pool; agent selection changes apply from the next task.
    pub async fn update_config(&self, update: ConfigUpdate) -> AppResult<AppConfig> {
        let workers = update.workers;
        let updated = {
            let mut guard = self.config.write().await;
            guard.update(update)?
        };
        if let Some(workers) = workers {
            self.scheduler.set_workers(workers);
        }
        self.agents.update_config(updated.agents.clone());
        Ok(updated)
    }

    /// Current config snapshot.
    pub async fn current_config(&self) -> AppConfig {
        self.config.read().await.get_clone()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("catalog", &self.catalog)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
