//! Dynamic supervision of client connections.
//!
//! Spawns clients, tracks them in the shared registry, and restarts
//! children that die abnormally, within a restart budget. Exceeding the
//! budget shuts the supervisor down. Lifecycle callbacks are invoked
//! synchronously with panics caught and logged; a misbehaving callback
//! never takes a child down.

use crate::error::{PoolError, PoolResult};
use crate::registry::ConnectionRegistry;
use crate::router::{MessageSink, PoolRouter};
use ketch_core::ClientConfig;
use ketch_ws::{Client, CloseCause, SendOutcome, StreamData, WsError};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{error, info, warn};

/// Invoked with the connection id on child lifecycle transitions.
pub type LifecycleHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Slack added to each child's connect timeout when awaiting `connected`.
    pub supervision_buffer_ms: u64,
    /// Restart budget per child within `restart_window_secs`.
    pub max_restarts: u32,
    /// Window for the restart budget.
    pub restart_window_secs: u64,
    /// Failover budget for balanced sends.
    pub max_send_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            supervision_buffer_ms: 1000,
            max_restarts: 10,
            restart_window_secs: 60,
            max_send_attempts: 3,
        }
    }
}

/// Per-child start options.
#[derive(Clone)]
pub struct StartOptions {
    pub on_connect: Option<LifecycleHook>,
    pub on_disconnect: Option<LifecycleHook>,
    /// Restart the child when it dies abnormally (default true).
    pub restart: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            on_connect: None,
            on_disconnect: None,
            restart: true,
        }
    }
}

/// Dynamic supervisor over a set of client connections.
pub struct ClientSupervisor {
    config: SupervisorConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<PoolRouter>,
    shutdown: AtomicBool,
}

impl ClientSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        let router = Arc::new(PoolRouter::new(config.max_send_attempts));
        Arc::new(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            router,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Shared connection table.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Failover router over this supervisor's children.
    pub fn router(&self) -> &Arc<PoolRouter> {
        &self.router
    }

    /// True once the supervisor gave up (restart budget exceeded or
    /// explicit shutdown).
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Spawn a child and await its `connected` state, bounded by the
    /// child's connect timeout plus the supervision buffer.
    pub async fn start_client(
        self: &Arc<Self>,
        config: ClientConfig,
        event_tx: mpsc::Sender<StreamData>,
        opts: StartOptions,
    ) -> PoolResult<Client> {
        if self.is_shutdown() {
            return Err(PoolError::SupervisorShutdown);
        }

        let budget =
            Duration::from_millis(config.connect_timeout_ms + self.config.supervision_buffer_ms);
        let client = match timeout(budget, Client::connect(config.clone(), event_tx.clone())).await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(PoolError::Client(WsError::Timeout)),
        };

        info!(id = %client.id(), "Child connected");
        invoke_hook(&opts.on_connect, client.id(), "on_connect");
        self.registry.register(client.clone());

        tokio::spawn(watch_child(
            self.clone(),
            config,
            event_tx,
            opts,
            client.clone(),
        ));
        Ok(client)
    }

    /// Ids of currently-registered children, in registration order.
    pub fn list_clients(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// Close one child.
    pub async fn stop_client(&self, id: &str) -> PoolResult<()> {
        let client = self
            .registry
            .get(id)
            .ok_or_else(|| PoolError::UnknownConnection(id.to_string()))?;
        client.close("stop_client").await?;
        self.registry.deregister(id);
        Ok(())
    }

    /// Send via the healthiest child with failover.
    pub async fn send_balanced(&self, msg: Value) -> PoolResult<SendOutcome> {
        let clients = self.registry.clients();
        let sinks: Vec<&dyn MessageSink> =
            clients.iter().map(|c| c as &dyn MessageSink).collect();
        self.router.send_balanced(&sinks, msg).await
    }

    /// Stop supervising: close every child and refuse new ones.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for client in self.registry.clients() {
            let _ = client.close("supervisor_shutdown").await;
            self.registry.deregister(client.id());
        }
        info!("Supervisor shut down");
    }
}

// One watchdog task per child: observes termination, applies the restart
// budget, and respawns abnormal exits.
async fn watch_child(
    supervisor: Arc<ClientSupervisor>,
    config: ClientConfig,
    event_tx: mpsc::Sender<StreamData>,
    opts: StartOptions,
    mut client: Client,
) {
    let window = Duration::from_secs(supervisor.config.restart_window_secs);
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    'supervise: loop {
        client.wait_closed().await;
        supervisor.registry.deregister(client.id());
        invoke_hook(&opts.on_disconnect, client.id(), "on_disconnect");

        if supervisor.is_shutdown() {
            return;
        }
        match client.close_cause() {
            Some(CloseCause::Exhausted) | Some(CloseCause::ConnectFailed) => {}
            // Deliberate exits are not restarted
            Some(CloseCause::UserClose) | Some(CloseCause::HandlesDropped) | None => return,
        }
        if !opts.restart {
            return;
        }

        loop {
            let now = Instant::now();
            while restarts.front().is_some_and(|t| now - *t > window) {
                restarts.pop_front();
            }
            restarts.push_back(now);
            if restarts.len() > supervisor.config.max_restarts as usize {
                error!(
                    id = %client.id(),
                    restarts = restarts.len(),
                    window_secs = supervisor.config.restart_window_secs,
                    "Restart budget exceeded, shutting supervisor down"
                );
                supervisor.shutdown().await;
                return;
            }

            info!(restarts = restarts.len(), "Restarting child");
            match Client::connect(config.clone(), event_tx.clone()).await {
                Ok(new_client) => {
                    invoke_hook(&opts.on_connect, new_client.id(), "on_connect");
                    supervisor.registry.register(new_client.clone());
                    client = new_client;
                    continue 'supervise;
                }
                Err(e) => {
                    warn!(error = %e, "Child restart failed");
                    sleep(Duration::from_millis(config.retry_delay_ms)).await;
                }
            }

            if supervisor.is_shutdown() {
                return;
            }
        }
    }
}

fn invoke_hook(hook: &Option<LifecycleHook>, id: &str, name: &str) {
    if let Some(hook) = hook {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(id)));
        if result.is_err() {
            error!(hook = name, id, "Lifecycle callback panicked");
        }
    }
}
