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

//! Periodic `status_snapshot.json` for external tooling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::status::{ConnectionStatus, MfaState, StatusCell};
use crate::store::{BandStore, StoreError, write_atomic};

pub const SNAPSHOT_FILE: &str = "status_snapshot.json";
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub band_uuid: Option<String>,
    pub connection: ConnectionStatus,
    pub peers: Vec<SnapshotPeer>,
    pub status: MfaSnapshot,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotPeer {
    pub name: String,
    pub private_ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MfaSnapshot {
    pub mfa_authentication_required: bool,
    pub mfa_authentication_url: Option<String>,
}

pub async fn collect(
    store: &BandStore,
    connection: ConnectionStatus,
    mfa_url: Option<String>,
) -> Result<StatusSnapshot, StoreError> {
    let band_uuid = store.default_band_uuid().await;
    let peers = match &band_uuid {
        Some(uuid) => store
            .load_config(uuid)
            .await?
            .map(|conf| {
                conf.peers
                    .into_iter()
                    .map(|p| SnapshotPeer {
                        name: p.name,
                        private_ip: p.private_ip,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        None => Vec::new(),
    };
    Ok(StatusSnapshot {
        band_uuid,
        connection,
        peers,
        status: MfaSnapshot {
            mfa_authentication_required: mfa_url.is_some(),
            mfa_authentication_url: mfa_url,
        },
        updated_at: Utc::now(),
    })
}

pub async fn write(path: &Path, snapshot: &StatusSnapshot) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &bytes).await?;
    debug!(path = %path.display(), connection = %snapshot.connection, "wrote status snapshot");
    Ok(())
}

/// Writes a snapshot into the state directory every [`SNAPSHOT_INTERVAL`].
pub fn spawn(store: BandStore, status: StatusCell, mfa: MfaState) -> JoinHandle<()> {
    let path: PathBuf = store.root().join(SNAPSHOT_FILE);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        loop {
            ticker.tick().await;
            let result = match collect(&store, status.get(), mfa.current()).await {
                Ok(snapshot) => write(&path, &snapshot).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(error = %e, "failed to write status snapshot");
            }
        }
    })
}
