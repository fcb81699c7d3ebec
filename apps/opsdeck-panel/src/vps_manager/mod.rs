use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use opsdeck_shared::api::{AgentStats, AgentStatus, ExecuteResult};

use crate::api::agent::{AgentClient, AgentError};


pub const DEFAULT_AGENT_PORT: u16 = 8888;

/// Tunable timings and bounds for the manager. Tests compress these;
/// production uses `Default`.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub stats_interval: Duration,
    pub retry_delay: Duration,
    pub reconnect_delay: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            connect_timeout: Duration::from_secs(10),
            stats_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Registration parameters for a VPS agent endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NewVps {
    #[serde(alias = "ip")]
    pub address: String,
    pub port: Option<u16>,
    #[serde(alias = "apiKey")]
    pub api_key: String,
    pub name: Option<String>,
    #[serde(alias = "userId")]
    pub owner_id: i64,
}

/// Immutable-after-registration description of one agent endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct VpsConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub name: String,
    pub owner_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VpsStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Live connection record. Present in the map iff the last connection
/// attempt succeeded and the VPS has not since been removed or failed out.
#[derive(Debug)]
struct Connection {
    config: VpsConfig,
    status: VpsStatus,
    last_seen: DateTime<Utc>,
    remote_info: AgentStatus,
    last_stats: Option<AgentStats>,
}

/// Snapshot of one VPS returned by the query methods.
#[derive(Debug, Clone, Serialize)]
pub struct VpsSummary {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub status: VpsStatus,
    pub last_seen: DateTime<Utc>,
    pub remote_info: AgentStatus,
    pub last_stats: Option<AgentStats>,
    pub owner_id: i64,
}

impl Connection {
    fn summary(&self, id: &str) -> VpsSummary {
        VpsSummary {
            id: id.to_string(),
            name: self.config.name.clone(),
            address: self.config.address.clone(),
            port: self.config.port,
            status: self.status,
            last_seen: self.last_seen,
            remote_info: self.remote_info.clone(),
            last_stats: self.last_stats.clone(),
            owner_id: self.config.owner_id,
        }
    }
}

/// Lifecycle notifications, fanned out to every subscriber. Fire-and-forget:
/// subscribers that lag simply miss events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VpsEvent {
    VpsConnected {
        id: String,
        config: VpsConfig,
        remote_info: AgentStatus,
    },
    VpsDisconnected {
        id: String,
        config: VpsConfig,
    },
    VpsStatsUpdated {
        id: String,
        config: VpsConfig,
        stats: AgentStats,
    },
    VpsConnectionFailed {
        id: String,
        config: VpsConfig,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum VpsError {
    #[error("vps address is required")]
    MissingAddress,
    #[error("vps api key is required")]
    MissingApiKey,
    #[error("vps {0} is not registered")]
    NotRegistered(String),
    #[error(transparent)]
    Agent(#[from] AgentError),
}

struct ManagerInner {
    settings: ManagerSettings,
    agent: AgentClient,
    events: broadcast::Sender<VpsEvent>,
    configs: Mutex<HashMap<String, VpsConfig>>,
    connections: Mutex<HashMap<String, Connection>>,
    attempts: Mutex<HashMap<String, u32>>,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
    // Bumped on every add/remove for an id. Scheduled retry and poll
    // callbacks capture the value at spawn and no-op once it moves on,
    // so a re-registration fully supersedes the previous one.
    generations: Mutex<HashMap<String, u64>>,
}

/// Supervises connections to remote VPS agents: registration,
/// connect-with-bounded-retry, periodic stats polling, command relay and
/// teardown. All state is memory-resident and rebuilt on restart.
///
/// Cheap to clone; clones share the same supervisor state.
#[derive(Clone)]
pub struct VpsManager {
    inner: Arc<ManagerInner>,
}

impl VpsManager {
    pub fn new(settings: ManagerSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        let agent = AgentClient::new(settings.connect_timeout);
        info!("VPS manager initialized");
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                agent,
                events,
                configs: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                attempts: Mutex::new(HashMap::new()),
                pollers: Mutex::new(HashMap::new()),
                generations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpsEvent> {
        self.inner.events.subscribe()
    }

    /// Register a VPS and asynchronously start connecting to it. The outcome
    /// is observed through the event stream, never as a return value.
    ///
    /// Re-registering an existing id supersedes the previous registration:
    /// its poller and any pending retries are cancelled and the retry
    /// counter starts over.
    pub fn add_vps(&self, id: &str, new: NewVps) -> Result<(), VpsError> {
        if new.address.trim().is_empty() {
            return Err(VpsError::MissingAddress);
        }
        if new.api_key.trim().is_empty() {
            return Err(VpsError::MissingApiKey);
        }

        let config = VpsConfig {
            id: id.to_string(),
            address: new.address,
            port: new.port.unwrap_or(DEFAULT_AGENT_PORT),
            api_key: new.api_key,
            name: new
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("VPS-{id}")),
            owner_id: new.owner_id,
        };

        let generation = self.bump_generation(id);
        self.stop_poller(id);
        self.inner.connections.lock().unwrap().remove(id);

        info!(
            "Registered VPS {} ({}:{})",
            config.name, config.address, config.port
        );
        self.inner
            .configs
            .lock()
            .unwrap()
            .insert(id.to_string(), config);
        self.inner.attempts.lock().unwrap().insert(id.to_string(), 0);

        let manager = self.clone();
        let vps_id = id.to_string();
        tokio::spawn(async move {
            manager.connect_attempt(vps_id, generation).await;
        });
        Ok(())
    }

    /// Remove a VPS from monitoring. Idempotent; unknown ids are a no-op.
    /// Emits `vps_disconnected` only if the VPS was currently connected.
    pub fn remove_vps(&self, id: &str) {
        self.bump_generation(id);
        self.drop_connection(id);
        self.inner.attempts.lock().unwrap().remove(id);
        if self.inner.configs.lock().unwrap().remove(id).is_some() {
            info!("VPS {} removed from monitoring", id);
        }
    }

    /// Trigger a connection attempt for a registered VPS. Used internally
    /// after registration and exposed for manual retries.
    pub fn connect(&self, id: &str) {
        let generation = self.generation(id);
        let manager = self.clone();
        let vps_id = id.to_string();
        tokio::spawn(async move {
            manager.connect_attempt(vps_id, generation).await;
        });
    }

    /// Reset the retry budget and reconnect. This is the explicit caller
    /// action that resumes a VPS which failed out of retries.
    pub fn retry_vps(&self, id: &str) -> Result<(), VpsError> {
        if !self.inner.configs.lock().unwrap().contains_key(id) {
            return Err(VpsError::NotRegistered(id.to_string()));
        }
        self.inner.attempts.lock().unwrap().insert(id.to_string(), 0);
        self.connect(id);
        Ok(())
    }

    async fn connect_attempt(&self, id: String, generation: u64) {
        if self.is_stale(&id, generation) {
            return;
        }
        let Some(config) = self.config_of(&id) else {
            // No config means nobody is waiting on this attempt.
            warn!("No configuration for VPS {}, skipping connect", id);
            return;
        };

        let attempts = self.attempts_of(&id);
        if attempts >= self.inner.settings.max_retries {
            error!(
                "Giving up on {} after {} failed attempts",
                config.name, attempts
            );
            self.emit(VpsEvent::VpsConnectionFailed {
                id,
                config,
                reason: "max_retries".to_string(),
            });
            return;
        }

        info!(
            "Connecting to {} ({}:{}) - attempt {}",
            config.name,
            config.address,
            config.port,
            attempts + 1
        );

        match self.inner.agent.status(&config).await {
            Ok(remote) if remote.status == "online" => {
                // Removed or re-registered while the request was in flight.
                if self.is_stale(&id, generation) {
                    return;
                }
                self.inner.connections.lock().unwrap().insert(
                    id.clone(),
                    Connection {
                        config: config.clone(),
                        status: VpsStatus::Connected,
                        last_seen: Utc::now(),
                        remote_info: remote.clone(),
                        last_stats: None,
                    },
                );
                self.inner.attempts.lock().unwrap().insert(id.clone(), 0);
                info!(
                    "Connected to {} (server {}, agent v{})",
                    config.name, remote.server_id, remote.version
                );
                self.start_poller(&id, generation);
                self.emit(VpsEvent::VpsConnected {
                    id,
                    config,
                    remote_info: remote,
                });
            }
            Ok(remote) => {
                warn!(
                    "Agent on {} is reachable but reports status '{}'",
                    config.name, remote.status
                );
                self.schedule_retry(id, generation, attempts);
            }
            Err(err) => {
                warn!("Connection to {} failed: {}", config.name, err);
                self.schedule_retry(id, generation, attempts);
            }
        }
    }

    fn schedule_retry(&self, id: String, generation: u64, attempts: u32) {
        self.inner
            .attempts
            .lock()
            .unwrap()
            .insert(id.clone(), attempts + 1);
        let manager = self.clone();
        let delay = self.inner.settings.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A manual retry or a concurrent connect may have won in the
            // meantime; only fire if this VPS is still registered, still
            // disconnected, and not superseded.
            if manager.is_stale(&id, generation)
                || manager.is_vps_connected(&id)
                || manager.config_of(&id).is_none()
            {
                return;
            }
            manager.connect_attempt(id, generation).await;
        });
    }

    /// One polling task per connected VPS. The HTTP call is awaited inside
    /// the tick loop, so two cycles for the same VPS can never overlap.
    fn start_poller(&self, id: &str, generation: u64) {
        let manager = self.clone();
        let vps_id = id.to_string();
        let handle = tokio::spawn(async move {
            manager.poll_loop(vps_id, generation).await;
        });
        // At most one active poller per id.
        if let Some(old) = self
            .inner
            .pollers
            .lock()
            .unwrap()
            .insert(id.to_string(), handle)
        {
            old.abort();
        }
    }

    async fn poll_loop(&self, id: String, generation: u64) {
        let mut interval = tokio::time::interval(self.inner.settings.stats_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // First tick completes immediately: stats are fetched right
            // after connecting, then every stats_interval.
            interval.tick().await;
            if self.is_stale(&id, generation) {
                return;
            }
            let Some(config) = self.config_of(&id) else {
                return;
            };

            match self.inner.agent.stats(&config).await {
                Ok(stats) => {
                    let updated = {
                        let mut connections = self.inner.connections.lock().unwrap();
                        match connections.get_mut(&id) {
                            Some(connection) => {
                                connection.last_stats = Some(stats.clone());
                                connection.last_seen = Utc::now();
                                true
                            }
                            None => false,
                        }
                    };
                    if updated {
                        self.emit(VpsEvent::VpsStatsUpdated {
                            id: id.clone(),
                            config,
                            stats,
                        });
                    }
                }
                Err(err) if err.is_transport() => {
                    warn!("Lost connection to VPS {}: {}", id, err);
                    // drop_connection aborts this very task, which is fine:
                    // everything below runs before the next await point.
                    self.drop_connection(&id);
                    let manager = self.clone();
                    let vps_id = id.clone();
                    let delay = self.inner.settings.reconnect_delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if manager.is_stale(&vps_id, generation)
                            || manager.is_vps_connected(&vps_id)
                            || manager.config_of(&vps_id).is_none()
                        {
                            return;
                        }
                        manager.connect_attempt(vps_id, generation).await;
                    });
                    return;
                }
                Err(err) => {
                    // Reachable agent returning a bad response (auth, 500,
                    // malformed body): log and leave the connection up for
                    // the next cycle rather than flapping it.
                    error!("Stats update for VPS {} failed: {}", id, err);
                }
            }
        }
    }

    /// Run a shell command on the agent and return its result unmodified.
    /// Requires registration, not connection: an unreachable agent surfaces
    /// as the transport error of the HTTP call itself.
    pub async fn execute_command(
        &self,
        id: &str,
        command: &str,
    ) -> Result<ExecuteResult, VpsError> {
        let Some(config) = self.config_of(id) else {
            return Err(VpsError::NotRegistered(id.to_string()));
        };
        info!("Executing command on VPS {}: {}", id, command);
        let result = self.inner.agent.execute(&config, command).await?;
        Ok(result)
    }

    pub fn get_connected_vps(&self) -> Vec<VpsSummary> {
        let connections = self.inner.connections.lock().unwrap();
        connections
            .iter()
            .map(|(id, connection)| connection.summary(id))
            .collect()
    }

    pub fn get_vps_info(&self, id: &str) -> Option<VpsSummary> {
        let connections = self.inner.connections.lock().unwrap();
        connections.get(id).map(|connection| connection.summary(id))
    }

    pub fn is_vps_connected(&self, id: &str) -> bool {
        self.inner.connections.lock().unwrap().contains_key(id)
    }

    pub fn get_user_vps(&self, owner_id: i64) -> Vec<VpsSummary> {
        let connections = self.inner.connections.lock().unwrap();
        connections
            .iter()
            .filter(|(_, connection)| connection.config.owner_id == owner_id)
            .map(|(id, connection)| connection.summary(id))
            .collect()
    }

    /// Cancel every poller, emit a disconnect per connected VPS and clear
    /// all state. For clean process termination.
    pub fn shutdown(&self) {
        info!("Stopping VPS manager...");
        {
            // Generations stay monotonic per id, so callbacks scheduled
            // before the shutdown can never match a later registration.
            let mut generations = self.inner.generations.lock().unwrap();
            for generation in generations.values_mut() {
                *generation += 1;
            }
        }
        let pollers: Vec<(String, JoinHandle<()>)> =
            self.inner.pollers.lock().unwrap().drain().collect();
        for (_, handle) in pollers {
            handle.abort();
        }
        let connections: Vec<(String, Connection)> =
            self.inner.connections.lock().unwrap().drain().collect();
        for (id, connection) in connections {
            info!("Disconnected from {}", connection.config.name);
            self.emit(VpsEvent::VpsDisconnected {
                id,
                config: connection.config,
            });
        }
        self.inner.configs.lock().unwrap().clear();
        self.inner.attempts.lock().unwrap().clear();
        info!("VPS manager stopped");
    }

    /// Cancel the poller for `id` and drop its connection record, emitting
    /// `vps_disconnected` if it was connected.
    fn drop_connection(&self, id: &str) {
        if let Some(handle) = self.inner.pollers.lock().unwrap().remove(id) {
            handle.abort();
        }
        if let Some(connection) = self.inner.connections.lock().unwrap().remove(id) {
            info!("Disconnected from {}", connection.config.name);
            self.emit(VpsEvent::VpsDisconnected {
                id: id.to_string(),
                config: connection.config,
            });
        }
    }

    fn stop_poller(&self, id: &str) {
        if let Some(handle) = self.inner.pollers.lock().unwrap().remove(id) {
            handle.abort();
        }
    }

    fn emit(&self, event: VpsEvent) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(event);
    }

    fn config_of(&self, id: &str) -> Option<VpsConfig> {
        self.inner.configs.lock().unwrap().get(id).cloned()
    }

    fn attempts_of(&self, id: &str) -> u32 {
        self.inner
            .attempts
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn generation(&self, id: &str) -> u64 {
        self.inner
            .generations
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn bump_generation(&self, id: &str) -> u64 {
        let mut generations = self.inner.generations.lock().unwrap();
        let entry = generations.entry(id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    fn is_stale(&self, id: &str, generation: u64) -> bool {
        self.generation(id) != generation
    }
}
