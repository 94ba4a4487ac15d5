//! The host side of the lifecycle: runs install and activate in order, keeps
//! track of which worker is active, and routes client requests through it.
//!
//! A [`Registration`] holds at most one *active* and one *waiting* worker.
//! Registering a worker installs it; a successful install makes it waiting,
//! and it is activated right away when it skips waiting, when nothing is
//! active yet, or when no open client is controlled by the active worker.
//! Otherwise it is activated once the last controlled client closes.
//!
//! Install and activate jobs are serialised: no two run at once for the same
//! registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::gateway::{GatewayError, Lifecycle};
use crate::http::{Request, Response};
use crate::network::Network;

/// Where the most recently registered worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Installing,
    /// Installed and waiting to activate.
    Installed,
    Activating,
    Activated,
    /// Install failed, or a newer worker replaced it.
    Redundant,
}

/// Longest delay between install attempts in [`Registration::register_retrying`].
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
enum Stage {
    Install,
    Activate,
}

/// Handle for an open client page (a proxied connection, for the server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

#[derive(Clone)]
struct Worker {
    id: u64,
    lifecycle: Arc<dyn Lifecycle>,
}

#[derive(Default)]
struct State {
    active: Option<Worker>,
    waiting: Option<Worker>,
    phase: Option<Phase>,
    // client → controlled by the active worker
    clients: HashMap<ClientId, bool>,
    next_client: u64,
    next_worker: u64,
}

impl State {
    fn has_controlled_clients(&self) -> bool {
        self.clients.values().any(|controlled| *controlled)
    }
}

/// Drives workers through install → activate and dispatches client fetches.
pub struct Registration {
    network: Arc<dyn Network>,
    state: RwLock<State>,
    jobs: Mutex<()>,
}

impl Registration {
    /// Creates an empty registration. `network` serves uncontrolled clients.
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self {
            network,
            state: RwLock::new(State::default()),
            jobs: Mutex::new(()),
        }
    }

    /// Installs `worker` and, when allowed, activates it.
    ///
    /// Returns the phase the worker ended in (`Installed` or `Activated`).
    ///
    /// # Errors
    ///
    /// Install failures discard the worker; the previously active worker keeps
    /// serving and a later `register` retries. Activation failures leave the
    /// worker waiting; [`activate_waiting`](Self::activate_waiting) retries.
    pub async fn register(&self, worker: Arc<dyn Lifecycle>) -> Result<Phase, GatewayError> {
        self.register_job(worker).await.map_err(|(_, e)| e)
    }

    /// Like [`register`](Self::register), but keeps retrying failed installs,
    /// sleeping `backoff` after the first failure and doubling the delay up
    /// to [`MAX_RETRY_BACKOFF`]. Activation failures are returned as-is.
    pub async fn register_retrying(
        &self,
        worker: Arc<dyn Lifecycle>,
        backoff: Duration,
    ) -> Result<Phase, GatewayError> {
        let mut delay = backoff;
        let mut attempt = 1u32;
        loop {
            match self.register_job(Arc::clone(&worker)).await {
                Ok(phase) => return Ok(phase),
                Err((Stage::Install, e)) => {
                    warn!(
                        worker = worker.name(),
                        attempt,
                        retry_in = ?delay,
                        error = %e,
                        "install failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_BACKOFF);
                    attempt += 1;
                }
                Err((Stage::Activate, e)) => return Err(e),
            }
        }
    }

    async fn register_job(
        &self,
        worker: Arc<dyn Lifecycle>,
    ) -> Result<Phase, (Stage, GatewayError)> {
        let _job = self.jobs.lock().await;

        let id = {
            let mut state = self.state.write().await;
            state.next_worker += 1;
            state.phase = Some(Phase::Installing);
            state.next_worker
        };

        info!(worker = worker.name(), id, "installing worker");
        if let Err(e) = worker.install().await {
            warn!(worker = worker.name(), error = %e, "install failed; worker discarded");
            self.state.write().await.phase = Some(Phase::Redundant);
            return Err((Stage::Install, e));
        }

        {
            let mut state = self.state.write().await;
            let previous = state.waiting.replace(Worker {
                id,
                lifecycle: worker,
            });
            if let Some(previous) = previous {
                debug!(worker = previous.lifecycle.name(), "waiting worker superseded");
            }
            state.phase = Some(Phase::Installed);
        }

        self.try_activate().await.map_err(|e| (Stage::Activate, e))
    }

    /// Reinstates `worker` as the active worker without installing or
    /// activating it, provided nothing is active yet and the worker reports
    /// that an earlier run installed it. Returns whether it was reinstated.
    pub async fn restore(&self, worker: Arc<dyn Lifecycle>) -> Result<bool, GatewayError> {
        let _job = self.jobs.lock().await;
        let active = self.state.read().await.active.is_some();
        if active || !worker.is_installed().await? {
            return Ok(false);
        }

        let mut state = self.state.write().await;
        state.next_worker += 1;
        let id = state.next_worker;
        if worker.claims_clients() {
            for controlled in state.clients.values_mut() {
                *controlled = true;
            }
        }
        info!(worker = worker.name(), id, "restored installed worker");
        state.active = Some(Worker {
            id,
            lifecycle: worker,
        });
        state.phase = Some(Phase::Activated);
        Ok(true)
    }

    /// Retries activation of the waiting worker, if any.
    pub async fn activate_waiting(&self) -> Result<Option<Phase>, GatewayError> {
        let _job = self.jobs.lock().await;
        if self.state.read().await.waiting.is_none() {
            return Ok(self.phase().await);
        }
        self.try_activate().await.map(Some)
    }

    // Callers hold the job lock.
    async fn try_activate(&self) -> Result<Phase, GatewayError> {
        let worker = {
            let mut state = self.state.write().await;
            let Some(worker) = state.waiting.clone() else {
                return Ok(state.phase.unwrap_or(Phase::Redundant));
            };
            let blocked = state.active.is_some()
                && state.has_controlled_clients()
                && !worker.lifecycle.skips_waiting();
            if blocked {
                debug!(worker = worker.lifecycle.name(), "waiting for controlled clients to close");
                return Ok(Phase::Installed);
            }
            state.phase = Some(Phase::Activating);
            worker
        };

        if let Err(e) = worker.lifecycle.activate().await {
            warn!(worker = worker.lifecycle.name(), error = %e, "activation failed; worker stays waiting");
            self.state.write().await.phase = Some(Phase::Installed);
            return Err(e);
        }

        let mut state = self.state.write().await;
        if state.waiting.as_ref().is_some_and(|w| w.id == worker.id) {
            state.waiting = None;
        }
        if worker.lifecycle.claims_clients() {
            for controlled in state.clients.values_mut() {
                *controlled = true;
            }
        }
        let name = worker.lifecycle.name().to_owned();
        if let Some(previous) = state.active.replace(worker) {
            debug!(worker = previous.lifecycle.name(), "previous worker is redundant");
        }
        state.phase = Some(Phase::Activated);
        info!(worker = %name, clients = state.clients.len(), "worker activated");
        Ok(Phase::Activated)
    }

    /// Phase of the most recently registered worker.
    pub async fn phase(&self) -> Option<Phase> {
        self.state.read().await.phase
    }

    /// Name of the active worker.
    pub async fn active_name(&self) -> Option<String> {
        let state = self.state.read().await;
        state.active.as_ref().map(|w| w.lifecycle.name().to_owned())
    }

    /// Name of the waiting worker.
    pub async fn waiting_name(&self) -> Option<String> {
        let state = self.state.read().await;
        state.waiting.as_ref().map(|w| w.lifecycle.name().to_owned())
    }

    /// Opens a client. It is controlled iff a worker is already active.
    pub async fn open_client(&self) -> ClientId {
        let mut state = self.state.write().await;
        state.next_client += 1;
        let id = ClientId(state.next_client);
        let controlled = state.active.is_some();
        state.clients.insert(id, controlled);
        id
    }

    /// Closes a client, activating a waiting worker once no controlled
    /// client remains.
    pub async fn close_client(&self, client: ClientId) {
        let ready = {
            let mut state = self.state.write().await;
            state.clients.remove(&client);
            state.waiting.is_some() && !state.has_controlled_clients()
        };
        if !ready {
            return;
        }

        let _job = self.jobs.lock().await;
        if let Err(e) = self.try_activate().await {
            warn!(error = %e, "deferred activation failed");
        }
    }

    /// Name of the worker controlling `client`, if any.
    pub async fn controller(&self, client: ClientId) -> Option<String> {
        let state = self.state.read().await;
        match (state.clients.get(&client), &state.active) {
            (Some(true), Some(active)) => Some(active.lifecycle.name().to_owned()),
            _ => None,
        }
    }

    /// Routes a request from `client`: controlled clients go through the
    /// active worker, everyone else straight to the network.
    pub async fn fetch(&self, client: ClientId, request: Request) -> Result<Response, GatewayError> {
        let worker = {
            let state = self.state.read().await;
            match (state.clients.get(&client), &state.active) {
                (Some(true), Some(active)) => Some(Arc::clone(&active.lifecycle)),
                _ => None,
            }
        };

        match worker {
            Some(worker) => worker.fetch(request).await,
            None => Ok(self.network.fetch(&request).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::BoxFuture;
    use crate::http::StatusCode;
    use crate::network::NetworkError;

    struct Offline;

    impl Network for Offline {
        fn fetch<'a>(&'a self, _: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>> {
            Box::pin(async { Err(NetworkError::Unavailable) })
        }
    }

    #[derive(Default)]
    struct FakeWorker {
        name: &'static str,
        failing_installs: AtomicUsize,
        installs: AtomicUsize,
        installed: bool,
        fail_activate: AtomicBool,
        skip_waiting: bool,
        claim: bool,
        activations: AtomicUsize,
    }

    impl FakeWorker {
        fn named(name: &'static str) -> Self {
            Self {
                name,
                ..Self::default()
            }
        }
    }

    impl Lifecycle for FakeWorker {
        fn name(&self) -> &str {
            self.name
        }

        fn install(&self) -> BoxFuture<'_, Result<(), GatewayError>> {
            Box::pin(async move {
                self.installs.fetch_add(1, Ordering::SeqCst);
                let failed = self
                    .failing_installs
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    Err(GatewayError::AssetStatus {
                        url: "/".to_owned(),
                        status: StatusCode::NotFound,
                    })
                } else {
                    Ok(())
                }
            })
        }

        fn activate(&self) -> BoxFuture<'_, Result<(), GatewayError>> {
            Box::pin(async move {
                if self.fail_activate.load(Ordering::SeqCst) {
                    return Err(GatewayError::Network(NetworkError::Unavailable));
                }
                self.activations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn fetch(&self, _: Request) -> BoxFuture<'_, Result<Response, GatewayError>> {
            Box::pin(async move { Ok(Response::new(StatusCode::Ok).body(self.name)) })
        }

        fn is_installed(&self) -> BoxFuture<'_, Result<bool, GatewayError>> {
            Box::pin(async move { Ok(self.installed) })
        }

        fn skips_waiting(&self) -> bool {
            self.skip_waiting
        }

        fn claims_clients(&self) -> bool {
            self.claim
        }
    }

    fn registration() -> Registration {
        Registration::new(Arc::new(Offline))
    }

    #[tokio::test]
    async fn first_worker_activates_immediately() {
        let reg = registration();
        let phase = reg.register(Arc::new(FakeWorker::named("v1"))).await.unwrap();
        assert_eq!(phase, Phase::Activated);
        assert_eq!(reg.active_name().await.as_deref(), Some("v1"));
        assert_eq!(reg.waiting_name().await, None);
    }

    #[tokio::test]
    async fn failed_install_keeps_previous_worker() {
        let reg = registration();
        reg.register(Arc::new(FakeWorker::named("v1"))).await.unwrap();

        let broken = FakeWorker {
            failing_installs: AtomicUsize::new(1),
            ..FakeWorker::named("v2")
        };
        assert!(reg.register(Arc::new(broken)).await.is_err());
        assert_eq!(reg.phase().await, Some(Phase::Redundant));
        assert_eq!(reg.active_name().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn uncontrolled_clients_bypass_the_worker() {
        let reg = registration();
        let early = reg.open_client().await;
        reg.register(Arc::new(FakeWorker::named("v1"))).await.unwrap();

        assert_eq!(reg.controller(early).await, None);
        let err = reg.fetch(early, Request::get("/")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(NetworkError::Unavailable)));

        let late = reg.open_client().await;
        let response = reg.fetch(late, Request::get("/")).await.unwrap();
        assert_eq!(response.content().as_ref(), b"v1");
    }

    #[tokio::test]
    async fn claim_takes_over_open_clients() {
        let reg = registration();
        let early = reg.open_client().await;
        let worker = FakeWorker {
            claim: true,
            ..FakeWorker::named("v1")
        };
        reg.register(Arc::new(worker)).await.unwrap();
        assert_eq!(reg.controller(early).await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn waiting_worker_activates_when_last_client_closes() {
        let reg = registration();
        reg.register(Arc::new(FakeWorker::named("v1"))).await.unwrap();
        let client = reg.open_client().await;

        let phase = reg.register(Arc::new(FakeWorker::named("v2"))).await.unwrap();
        assert_eq!(phase, Phase::Installed);
        assert_eq!(reg.waiting_name().await.as_deref(), Some("v2"));
        assert_eq!(reg.controller(client).await.as_deref(), Some("v1"));

        reg.close_client(client).await;
        assert_eq!(reg.active_name().await.as_deref(), Some("v2"));
        assert_eq!(reg.phase().await, Some(Phase::Activated));
    }

    #[tokio::test]
    async fn skip_waiting_moves_controlled_clients_over() {
        let reg = registration();
        reg.register(Arc::new(FakeWorker::named("v1"))).await.unwrap();
        let client = reg.open_client().await;

        let worker = FakeWorker {
            skip_waiting: true,
            ..FakeWorker::named("v2")
        };
        assert_eq!(reg.register(Arc::new(worker)).await.unwrap(), Phase::Activated);
        assert_eq!(reg.controller(client).await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn failed_activation_can_be_retried() {
        let worker = Arc::new(FakeWorker::named("v1"));
        worker.fail_activate.store(true, Ordering::SeqCst);

        let reg = registration();
        assert!(reg.register(worker.clone()).await.is_err());
        assert_eq!(reg.phase().await, Some(Phase::Installed));
        assert_eq!(reg.active_name().await, None);

        worker.fail_activate.store(false, Ordering::SeqCst);
        assert_eq!(reg.activate_waiting().await.unwrap(), Some(Phase::Activated));
        assert_eq!(worker.activations.load(Ordering::SeqCst), 1);
        assert_eq!(reg.active_name().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn restore_reinstates_an_installed_worker() {
        let reg = registration();
        let early = reg.open_client().await;
        let worker = Arc::new(FakeWorker {
            installed: true,
            claim: true,
            ..FakeWorker::named("v1")
        });

        assert!(reg.restore(worker.clone()).await.unwrap());
        assert_eq!(reg.phase().await, Some(Phase::Activated));
        assert_eq!(reg.controller(early).await.as_deref(), Some("v1"));
        assert_eq!(worker.installs.load(Ordering::SeqCst), 0);
        assert_eq!(worker.activations.load(Ordering::SeqCst), 0);

        let response = reg.fetch(early, Request::get("/")).await.unwrap();
        assert_eq!(response.content().as_ref(), b"v1");
    }

    #[tokio::test]
    async fn restore_needs_an_installed_worker_and_no_active_one() {
        let reg = registration();
        assert!(!reg.restore(Arc::new(FakeWorker::named("v1"))).await.unwrap());
        assert_eq!(reg.active_name().await, None);

        reg.register(Arc::new(FakeWorker::named("v1"))).await.unwrap();
        let persisted = FakeWorker {
            installed: true,
            ..FakeWorker::named("v2")
        };
        assert!(!reg.restore(Arc::new(persisted)).await.unwrap());
        assert_eq!(reg.active_name().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn register_retrying_outlasts_failed_installs() {
        let reg = registration();
        let worker = Arc::new(FakeWorker {
            failing_installs: AtomicUsize::new(2),
            ..FakeWorker::named("v1")
        });

        let phase = reg
            .register_retrying(worker.clone(), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(phase, Phase::Activated);
        assert_eq!(worker.installs.load(Ordering::SeqCst), 3);
        assert_eq!(reg.active_name().await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn register_retrying_returns_activation_errors() {
        let reg = registration();
        let worker = Arc::new(FakeWorker::named("v1"));
        worker.fail_activate.store(true, Ordering::SeqCst);

        let result = reg
            .register_retrying(worker.clone(), Duration::from_millis(1))
            .await;
        assert!(result.is_err());
        assert_eq!(worker.installs.load(Ordering::SeqCst), 1);
        assert_eq!(reg.waiting_name().await.as_deref(), Some("v1"));
    }
}
