use std::sync::Arc;
use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::clock::{Clock, SystemClock};
use crate::core::components::{ComponentHandler, HealthProbe, PlatformHandler, PlatformProbe};
use crate::core::crypto::Encryptor;
use crate::core::failover::{Confirmation, StdinConfirmation};
use crate::core::lock::EnvironmentLocks;
use crate::core::manifest::ManifestStore;
use crate::core::notifications::NotificationDispatcher;
use crate::core::platform::Platform;
use crate::core::registry::Registry;
use crate::core::retention::RetentionManager;
use crate::core::transport::UploadTransport;
use crate::core::verifier::IntegrityVerifier;
use crate::error::DrResult;

/// Everything an operation needs, wired once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub registry: Arc<Registry>,
    pub platform: Platform,
    pub handler: Arc<dyn ComponentHandler>,
    pub probe: Arc<dyn HealthProbe>,
    pub clock: Arc<dyn Clock>,
    pub locks: EnvironmentLocks,
    pub store: ManifestStore,
    pub encryptor: Option<Encryptor>,
    pub notifier: NotificationDispatcher,
    pub confirmation: Arc<dyn Confirmation>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        db: Connection,
        platform: Platform,
        encryptor: Option<Encryptor>,
    ) -> DrResult<Self> {
        let registry = Registry::new(config.components.clone())?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let handler = Arc::new(PlatformHandler::new(platform.clone()));
        let probe = Arc::new(PlatformProbe::new(platform.clone(), config.timeouts.probe()));
        let locks = EnvironmentLocks::new(
            config.backup_root.clone(),
            std::time::Duration::from_secs(config.lock_lease_secs),
            clock.clone(),
        );
        let store = ManifestStore::new(config.backup_root.clone());
        let notifier = NotificationDispatcher::from_config(&config.notifications);

        Ok(Self {
            config: Arc::new(config),
            db,
            registry: Arc::new(registry),
            platform,
            handler,
            probe,
            clock,
            locks,
            store,
            encryptor,
            notifier,
            confirmation: Arc::new(StdinConfirmation),
        })
    }

    /// Swap the time source. Locks are rebuilt so lease ages use it too.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.locks = EnvironmentLocks::new(
            self.config.backup_root.clone(),
            std::time::Duration::from_secs(self.config.lock_lease_secs),
            clock.clone(),
        );
        self.clock = clock;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ComponentHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_notifier(mut self, notifier: NotificationDispatcher) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn Confirmation>) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn transport(&self) -> UploadTransport {
        UploadTransport::new(
            self.platform.storage.clone(),
            self.clock.clone(),
            self.config.upload.retry_policy(),
            self.config.timeouts.transfer(),
        )
    }

    pub fn verifier(&self) -> IntegrityVerifier {
        IntegrityVerifier::new(self.encryptor.clone(), self.config.timeouts.verify())
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.store.clone(), self.transport(), self.clock.clone())
    }
}
