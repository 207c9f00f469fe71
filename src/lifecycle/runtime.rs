//! Start, stop and restart of instances.
//!
//! ```text
//! start(id)
//!   lock(id) ─► load record ─► stop old handle ─► validate (gate)
//!     ─► inject credential ─► sandbox launch ─► gateway login
//!     ─► settle login in script ─► spawn pump ─► register ─► persist active
//! ```
//!
//! Every failure is caught here, logged with the instance's id and name, and
//! turned into `false` (or a [`LifecycleError`] from the `try_` variants).
//! Nothing is left registered after a failed start.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Config, SandboxConfig};
use crate::db::{DEFAULT_MAIN_FILE, InstancePatch, InstanceStore};
use crate::error::LifecycleError;
use crate::gateway::{Gateway, GatewayEvent, GatewaySession, OutboundAction};
use crate::lifecycle::registry::{LiveHandle, Registry};
use crate::safety::{Verdict, has_placeholder, inject_credential, validate};
use crate::sandbox::{EnvironmentBuilder, ScriptHandle, launch};

/// Owns the start/stop/restart semantics for every instance.
pub struct InstanceRuntime {
    store: Arc<dyn InstanceStore>,
    gateway: Arc<dyn Gateway>,
    registry: Arc<Registry>,
    sandbox: SandboxConfig,
    shutdown_timeout: Duration,
}

impl InstanceRuntime {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        gateway: Arc<dyn Gateway>,
        registry: Arc<Registry>,
        sandbox: SandboxConfig,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            registry,
            sandbox,
            shutdown_timeout,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn InstanceStore>,
        gateway: Arc<dyn Gateway>,
    ) -> Self {
        Self::new(
            store,
            gateway,
            Arc::new(Registry::new()),
            config.sandbox.clone(),
            config.gateway.shutdown_timeout,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// Start `id`, replacing any live handle it already has.
    pub async fn start(&self, id: &str) -> bool {
        report("start", id, self.try_start(id).await)
    }

    pub async fn try_start(&self, id: &str) -> Result<(), LifecycleError> {
        let result = {
            let _guard = self.registry.lock(id).await;
            self.start_locked(id).await
        };
        if matches!(result, Err(LifecycleError::NotFound { .. })) {
            self.registry.forget_lock(id);
        }
        result
    }

    /// Stop `id`. Stopping an instance that is not running succeeds.
    pub async fn stop(&self, id: &str) -> bool {
        report("stop", id, self.try_stop(id).await)
    }

    pub async fn try_stop(&self, id: &str) -> Result<(), LifecycleError> {
        let known = {
            let _guard = self.registry.lock(id).await;
            self.stop_locked(id)
                .instrument(tracing::info_span!("instance", id = %id))
                .await?
        };
        if !known {
            self.registry.forget_lock(id);
        }
        Ok(())
    }

    /// Stop then start, holding the id's lock across both phases.
    pub async fn restart(&self, id: &str) -> bool {
        report("restart", id, self.try_restart(id).await)
    }

    pub async fn try_restart(&self, id: &str) -> Result<(), LifecycleError> {
        let result = {
            let _guard = self.registry.lock(id).await;
            match self
                .stop_locked(id)
                .instrument(tracing::info_span!("instance", id = %id))
                .await
            {
                Ok(_) => self.start_locked(id).await,
                Err(e) => Err(e),
            }
        };
        if matches!(result, Err(LifecycleError::NotFound { .. })) {
            self.registry.forget_lock(id);
        }
        result
    }

    /// Whether a live handle exists for `id`.
    pub async fn status(&self, id: &str) -> bool {
        self.registry.status(id).await
    }

    /// Validator verdict for the instance's main file. Does not touch runtime state.
    pub async fn review(&self, id: &str) -> Result<Verdict, LifecycleError> {
        let record = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound { id: id.to_string() })?;
        Ok(validate(record.main_source()))
    }

    /// Stop the instance if it is running, then delete its record.
    ///
    /// Returns whether a record was deleted.
    pub async fn delete(&self, id: &str) -> Result<bool, LifecycleError> {
        let deleted = {
            let _guard = self.registry.lock(id).await;
            if let Some(handle) = self.registry.remove(id).await
                && let Err(e) = handle.shutdown(self.shutdown_timeout).await
            {
                tracing::warn!(id = %id, "Teardown before delete failed: {}", e);
            }
            self.store.delete_instance(id).await?
        };
        self.registry.forget_lock(id);
        if deleted {
            tracing::info!(id = %id, "Instance deleted");
        }
        Ok(deleted)
    }

    /// Stop every running instance and mark each inactive.
    ///
    /// Returns the number of instances that were running.
    pub async fn stop_all(&self) -> usize {
        let results = self.registry.stop_all(self.shutdown_timeout).await;
        let count = results.len();
        for (id, result) in results {
            if let Err(e) = result {
                tracing::warn!(id = %id, "Teardown during shutdown failed: {}", e);
            }
            if let Err(e) = self
                .store
                .update_instance(&id, InstancePatch::active(false))
                .await
            {
                tracing::warn!(id = %id, "Failed to persist inactive state: {}", e);
            }
        }
        tracing::info!(count, "All instances stopped");
        count
    }

    /// Rewrite persisted `active` flags that disagree with the registry.
    ///
    /// Returns the number of records corrected.
    pub async fn reconcile(&self) -> Result<usize, LifecycleError> {
        let mut corrected = 0;
        for record in self.store.list_instances().await? {
            let running = self.registry.status(&record.id).await;
            if record.active != running {
                self.store
                    .update_instance(&record.id, InstancePatch::active(running))
                    .await?;
                tracing::info!(
                    id = %record.id,
                    name = %record.name,
                    active = running,
                    "Corrected persisted active flag"
                );
                corrected += 1;
            }
        }
        Ok(corrected)
    }

    /// Start every instance persisted as active. Returns how many started.
    pub async fn resume_active(&self) -> Result<usize, LifecycleError> {
        let ids: Vec<String> = self
            .store
            .list_instances()
            .await?
            .into_iter()
            .filter(|r| r.active)
            .map(|r| r.id)
            .collect();
        let started = futures::future::join_all(ids.iter().map(|id| self.start(id))).await;
        Ok(started.into_iter().filter(|ok| *ok).count())
    }

    async fn start_locked(&self, id: &str) -> Result<(), LifecycleError> {
        let span = tracing::info_span!("instance", id = %id, name = tracing::field::Empty);
        let result = self.start_inner(id, span.clone()).instrument(span.clone()).await;

        if let Err(e) = &result
            && !matches!(e, LifecycleError::NotFound { .. })
        {
            // Anything that was running has been stopped; keep the flag honest.
            if let Err(e) = self
                .store
                .update_instance(id, InstancePatch::active(false))
                .instrument(span.clone())
                .await
            {
                tracing::warn!(parent: &span, "Failed to persist inactive state: {}", e);
            }
        }
        result
    }

    async fn start_inner(&self, id: &str, span: tracing::Span) -> Result<(), LifecycleError> {
        let record = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound { id: id.to_string() })?;
        span.record("name", record.name.as_str());

        if let Some(old) = self.registry.remove(id).await {
            tracing::info!(session_id = %old.session_id(), "Stopping previous handle");
            if let Err(e) = old.shutdown(self.shutdown_timeout).await {
                tracing::warn!("Previous handle did not stop cleanly: {}", e);
            }
        }

        let source = record.main_source();
        let verdict = validate(source);
        if !verdict.valid {
            if self.sandbox.enforce_validation {
                return Err(LifecycleError::ValidationFailure { verdict });
            }
            tracing::warn!(
                risk = %verdict.risk,
                issues = verdict.issues.len(),
                "Starting code the validator rejected"
            );
        }
        if !has_placeholder(source) {
            tracing::debug!("Main file has no credential placeholder");
        }
        let code = inject_credential(source, record.credential.expose_secret());

        let environment = EnvironmentBuilder::new(&record.name, record.credential.clone())
            .main_file(record.main_file_name().unwrap_or(DEFAULT_MAIN_FILE))
            .build();
        let launched = launch(environment, code, &self.sandbox).await?;
        let harvest = launched.harvest;
        let script = Arc::new(launched.handle);

        if harvest.login_called
            && harvest
                .login_token
                .as_ref()
                .is_none_or(|t| t.expose_secret() != record.credential.expose_secret())
        {
            tracing::warn!(
                "Credential not injected: login() was called with a value other than the stored credential"
            );
        }

        let connection = match self
            .gateway
            .login(&record.credential, harvest.intents())
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                let _ = script.settle_login(Err(e.to_string()));
                script.shutdown().await;
                return Err(e.into());
            }
        };
        if let Err(e) = script.settle_login(Ok(&connection.ready)) {
            let _ = connection.session.destroy().await;
            return Err(e.into());
        }

        let session_id = Uuid::new_v4();
        let reaper = Reaper {
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            id: id.to_string(),
            session_id,
            shutdown_timeout: self.shutdown_timeout,
        };
        let pump = tokio::spawn(
            pump(
                connection.events,
                launched.outbound,
                Arc::clone(&script),
                Arc::clone(&connection.session),
                reaper,
            )
            .in_current_span(),
        );
        let handle = LiveHandle::new(
            id,
            session_id,
            &record.name,
            connection.ready,
            harvest.source,
            connection.session,
            script,
            pump,
        );
        if let Some(displaced) = self.registry.set(id, handle).await
            && let Err(e) = displaced.shutdown(self.shutdown_timeout).await
        {
            tracing::warn!("Displaced handle did not stop cleanly: {}", e);
        }

        let persisted = self
            .store
            .update_instance(id, InstancePatch::active(true))
            .await;
        let failure = match persisted {
            Ok(Some(_)) => None,
            Ok(None) => Some(LifecycleError::NotFound { id: id.to_string() }),
            Err(e) => Some(LifecycleError::Database(e)),
        };
        if let Some(err) = failure {
            if let Some(handle) = self.registry.remove(id).await
                && let Err(e) = handle.shutdown(self.shutdown_timeout).await
            {
                tracing::warn!("Rollback teardown failed: {}", e);
            }
            return Err(err);
        }

        tracing::info!(
            %session_id,
            intents = harvest.intents,
            client = ?harvest.source,
            "Instance started"
        );
        Ok(())
    }

    /// Returns whether a record exists for `id`.
    async fn stop_locked(&self, id: &str) -> Result<bool, LifecycleError> {
        let teardown = match self.registry.remove(id).await {
            Some(handle) => {
                let session_id = handle.session_id();
                let result = handle.shutdown(self.shutdown_timeout).await;
                tracing::info!(%session_id, "Instance stopped");
                result
            }
            None => Ok(()),
        };
        let persisted = self
            .store
            .update_instance(id, InstancePatch::active(false))
            .await;
        teardown?;
        Ok(persisted?.is_some())
    }
}

/// Unregisters one session whose pump ended without being stopped.
struct Reaper {
    registry: Arc<Registry>,
    store: Arc<dyn InstanceStore>,
    id: String,
    session_id: Uuid,
    shutdown_timeout: Duration,
}

impl Reaper {
    async fn reap(self) {
        let _guard = self.registry.lock(&self.id).await;
        // A stop or restart already replaced this session.
        let Some(handle) = self
            .registry
            .remove_session(&self.id, self.session_id)
            .await
        else {
            return;
        };
        if let Err(e) = handle.shutdown(self.shutdown_timeout).await {
            tracing::warn!("Teardown of dead session failed: {}", e);
        }
        if let Err(e) = self
            .store
            .update_instance(&self.id, InstancePatch::active(false))
            .await
        {
            tracing::warn!("Failed to persist inactive state: {}", e);
        }
        tracing::warn!(session_id = %self.session_id, "Instance stopped after its connection ended");
    }
}

/// Forward gateway events into the script and script actions out to the gateway.
///
/// When either side goes away the instance is no longer running, so the
/// session is handed to `reaper`.
async fn pump(
    mut events: mpsc::Receiver<GatewayEvent>,
    mut outbound: mpsc::Receiver<OutboundAction>,
    script: Arc<ScriptHandle>,
    session: Arc<dyn GatewaySession>,
    reaper: Reaper,
) {
    let reason = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if script.dispatch(event).is_err() {
                        break "script worker is gone";
                    }
                }
                None => break "gateway event stream ended",
            },
            action = outbound.recv() => match action {
                Some(action) => {
                    if let Err(e) = session.perform(action).await {
                        tracing::warn!("Outbound action failed: {}", e);
                    }
                }
                None => break "script stopped sending",
            },
        }
    };
    tracing::warn!(reason, "Pump stopped");
    // Shutting the handle down aborts this task, so reap from a fresh one.
    tokio::spawn(reaper.reap().in_current_span());
}

fn report(op: &str, id: &str, result: Result<(), LifecycleError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            let reason = e.failure();
            tracing::warn!(id = %id, code = reason.code, "{} failed: {}", op, e);
            false
        }
    }
}
