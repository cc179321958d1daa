use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::RwLock;

use crate::tunnelgate::gateway::service::ProxyConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid remote port {0} (expected 1..=65535)")]
    InvalidPort(u32),
    #[error("remote port {port} already claimed by {owner}")]
    PortInUse { port: u32, owner: String },
    #[error("duplicate proxy name {0}")]
    DuplicateName(String),
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ProxySnapshot {
    pub config: ProxyConfig,
    pub session_id: String,
}

struct Entry {
    config: ProxyConfig,
    session_id: String,
}

#[derive(Default)]
struct State {
    by_name: HashMap<String, Entry>,
    ports: HashMap<u32, String>,
}

/// Proxies emitted by all sessions, keyed by name and by remote port.
pub struct ProxyRegistry {
    id_seq: AtomicU64,
    state: RwLock<State>,
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry").finish_non_exhaustive()
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            state: RwLock::new(State::default()),
        }
    }

    pub fn next_session_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!("s-{n}")
    }

    pub async fn register(&self, session_id: &str, config: ProxyConfig) -> Result<(), RegistryError> {
        if config.remote_port == 0 || config.remote_port > u32::from(u16::MAX) {
            return Err(RegistryError::InvalidPort(config.remote_port));
        }

        let mut st = self.state.write().await;
        if st.by_name.contains_key(&config.name) {
            return Err(RegistryError::DuplicateName(config.name));
        }
        if let Some(owner) = st.ports.get(&config.remote_port) {
            return Err(RegistryError::PortInUse {
                port: config.remote_port,
                owner: owner.clone(),
            });
        }

        st.ports.insert(config.remote_port, config.name.clone());
        st.by_name.insert(
            config.name.clone(),
            Entry {
                config,
                session_id: session_id.to_string(),
            },
        );
        Ok(())
    }

    /// Drops every proxy owned by `session_id`; returns how many were removed.
    pub async fn unregister_session(&self, session_id: &str) -> usize {
        let mut st = self.state.write().await;
        let names: Vec<String> = st
            .by_name
            .iter()
            .filter(|(_, e)| e.session_id == session_id)
            .map(|(n, _)| n.clone())
            .collect();

        for name in &names {
            if let Some(e) = st.by_name.remove(name) {
                st.ports.remove(&e.config.remote_port);
            }
        }
        names.len()
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Vec<ProxySnapshot> {
        let st = self.state.read().await;
        let mut out: Vec<ProxySnapshot> = st
            .by_name
            .values()
            .map(|e| ProxySnapshot {
                config: e.config.clone(),
                session_id: e.session_id.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        out
    }
}
