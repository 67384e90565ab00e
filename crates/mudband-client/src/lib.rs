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

//! mudband-client: enrollment, configuration sync and tunnel session control
//! for the mud.band mesh VPN.

pub mod api;
pub mod config;
pub mod confsync;
pub mod engine;
pub mod enroll;
pub mod error;
pub mod logging;
pub mod platform;
pub mod session;
pub mod snapshot;
pub mod status;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use crate::api::ApiClient;
use crate::confsync::ConfigSync;
use crate::engine::TunnelEngine;
use crate::enroll::EnrollmentManager;
use crate::platform::PlatformTunnelController;
use crate::session::SessionController;
use crate::status::{LifecycleGate, MfaState, StatusCell};
use crate::store::BandStore;

/// The managers wired to one store, engine and platform.
pub struct Client<E, P> {
    pub store: BandStore,
    pub status: StatusCell,
    pub mfa: MfaState,
    pub enrollment: EnrollmentManager<E>,
    pub sync: ConfigSync<E>,
    pub session: SessionController<E, P>,
}

impl<E: TunnelEngine, P: PlatformTunnelController> Client<E, P> {
    pub fn new(
        api: ApiClient,
        store: BandStore,
        engine: Arc<E>,
        platform: Arc<P>,
        ping_interval: Duration,
    ) -> Self {
        let status = StatusCell::default();
        let mfa = MfaState::default();
        let gate = LifecycleGate::default();
        let sync = ConfigSync::new(
            api.clone(),
            store.clone(),
            Arc::clone(&engine),
            status.clone(),
            mfa.clone(),
        );
        let enrollment = EnrollmentManager::new(
            api,
            store.clone(),
            Arc::clone(&engine),
            status.clone(),
            gate.clone(),
        );
        let session = SessionController::new(
            store.clone(),
            engine,
            platform,
            sync.clone(),
            status.clone(),
            mfa.clone(),
            gate,
            ping_interval,
        );
        Self {
            store,
            status,
            mfa,
            enrollment,
            sync,
            session,
        }
    }
}
