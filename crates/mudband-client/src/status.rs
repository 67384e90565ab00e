// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, watch};

/// State of the tunnel session as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    NotReady,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reasserting,
    Invalid,
}

impl ConnectionStatus {
    /// Enrollments may not be added, switched or removed in these states.
    pub fn locks_enrollment(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reasserting)
    }

    /// States that only exist while the client is in the middle of a change.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting | Self::Reasserting)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotReady => "not ready",
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Reasserting => "reasserting",
            Self::Invalid => "invalid",
        })
    }
}

/// Shared, observable connection status.
#[derive(Debug, Clone)]
pub struct StatusCell {
    tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(ConnectionStatus::NotReady)
    }
}

impl StatusCell {
    pub fn new(initial: ConnectionStatus) -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(initial)),
        }
    }

    pub fn get(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    pub fn set(&self, status: ConnectionStatus) {
        self.tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Moves to `to` only when the current state is one of `from`. Returns the
    /// state that was observed.
    pub fn transition(
        &self,
        from: &[ConnectionStatus],
        to: ConnectionStatus,
    ) -> Result<ConnectionStatus, ConnectionStatus> {
        let mut observed = ConnectionStatus::NotReady;
        let mut allowed = false;
        self.tx.send_if_modified(|current| {
            observed = *current;
            allowed = from.contains(current);
            if allowed && *current != to {
                *current = to;
                true
            } else {
                false
            }
        });
        if allowed { Ok(observed) } else { Err(observed) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

/// Pending MFA challenge, holding the URL the user must visit.
#[derive(Debug, Clone)]
pub struct MfaState {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for MfaState {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(None)),
        }
    }
}

impl MfaState {
    pub fn set(&self, sso_url: impl Into<String>) {
        let sso_url = sso_url.into();
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(sso_url.as_str()) {
                false
            } else {
                *current = Some(sso_url);
                true
            }
        });
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn is_required(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

/// Serializes enrollment changes against tunnel start-up. Enrollment
/// operations hold it for their whole run, `connect` holds it until the tunnel
/// is Connected, so neither can start while the other is half done. Clones
/// share one lock.
#[derive(Debug, Clone, Default)]
pub struct LifecycleGate {
    lock: Arc<Mutex<()>>,
}

impl LifecycleGate {
    /// `None` when another lifecycle operation is in flight.
    pub fn try_enter(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock().ok()
    }
}
