use std::sync::Arc;

use tokio::task;

use crate::config::EngineConfig;
use crate::db::backup::{create_backup, BackupRecord};
use crate::db::health::{check_integrity, CheckLevel, IntegrityAlertHandler, IntegrityResult};
use crate::db::recovery::{
    run_recovery, RecoveryContext, RecoveryEventHandler, RecoveryOptions, RecoveryOutcome,
};
use crate::db::StoreAccess;
use crate::{AppError, AppResult};

/// Async entry points over the blocking engine. Every call runs on the
/// tokio blocking pool.
pub struct RecoveryEngine<S: StoreAccess> {
    store: Arc<S>,
    config: Arc<EngineConfig>,
    alerts: Option<IntegrityAlertHandler>,
    observer: Option<RecoveryEventHandler>,
}

impl<S: StoreAccess> Clone for RecoveryEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            alerts: self.alerts.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl<S: StoreAccess> RecoveryEngine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            alerts: None,
            observer: None,
        }
    }

    /// Handler invoked for every `Critical` or `Fatal` check result.
    pub fn with_alert_handler(mut self, handler: IntegrityAlertHandler) -> Self {
        self.alerts = Some(handler);
        self
    }

    /// Handler receiving stage progress during [`RecoveryEngine::recover`].
    pub fn with_observer(mut self, observer: RecoveryEventHandler) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn check(&self, level: CheckLevel) -> IntegrityResult {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let alerts = self.alerts.clone();
        task::spawn_blocking(move || check_integrity(&*store, &config, level, alerts.as_ref()))
            .await
            .unwrap_or_else(|err| {
                let err = AppError::new("ENGINE/TASK", "Integrity check task panicked")
                    .with_context("error", err.to_string());
                tracing::error!(target: "storemend", event = "db_integrity_task_failed", error = %err);
                IntegrityResult::check_failed(level, &err)
            })
    }

    pub async fn recover(&self, options: RecoveryOptions) -> AppResult<RecoveryOutcome> {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let alerts = self.alerts.clone();
        let observer = self.observer.clone();
        task::spawn_blocking(move || {
            let ctx = RecoveryContext {
                store: &*store,
                config: &config,
                alerts: alerts.as_ref(),
                observer: observer.as_ref(),
            };
            run_recovery(&ctx, &options)
        })
        .await
        .map_err(|err| {
            AppError::new("ENGINE/TASK", "Recovery task panicked")
                .with_context("error", err.to_string())
                .with_context("cancelled", err.is_cancelled().to_string())
        })
    }

    pub async fn backup(&self) -> AppResult<BackupRecord> {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        task::spawn_blocking(move || create_backup(&*store, &config))
            .await
            .map_err(|err| {
                AppError::new("DB_BACKUP/TASK", "Backup task panicked")
                    .with_context("error", err.to_string())
            })?
    }
}
