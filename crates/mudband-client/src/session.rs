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

//! Tunnel session orchestration.
//!
//! `connect` walks NotReady/Disconnected -> Connecting -> Connected, fetching
//! the band configuration, bringing up the platform tunnel and starting the
//! engine. While connected a ping task watches for MFA and an event listener
//! turns engine requests into configuration refreshes. `disconnect` stops the
//! background work before tearing the tunnel down.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mudband_types::api::{FetchType, STATUS_MFA_REQUIRED, STATUS_OK};
use mudband_types::conf::BandConfig;

use crate::confsync::{ConfigError, ConfigSync, FetchOutcome};
use crate::engine::{EngineError, EngineEvent, TunnelEngine};
use crate::error::ErrorKind;
use crate::platform::{PlatformError, PlatformTunnelController, TunnelHandle, TunnelSettings};
use crate::status::{ConnectionStatus, LifecycleGate, MfaState, StatusCell};
use crate::store::{BandStore, StoreError};

const ENGINE_EVENT_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {action} while {status}")]
    IllegalState {
        action: &'static str,
        status: ConnectionStatus,
    },

    #[error("an enrollment change is in progress")]
    InProgress,

    #[error("no band is enrolled")]
    NotEnrolled,

    #[error("no configuration is available for band {0}")]
    NoConfig(String),

    #[error("connection attempt was cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => e.kind(),
            _ => ErrorKind::LocalState,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    MfaRequired { sso_url: String },
}

pub struct SessionController<E, P> {
    inner: Arc<Inner<E, P>>,
}

impl<E, P> Clone for SessionController<E, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<E, P> {
    store: BandStore,
    engine: Arc<E>,
    platform: Arc<P>,
    sync: ConfigSync<E>,
    status: StatusCell,
    mfa: MfaState,
    gate: LifecycleGate,
    ping_interval: Duration,
    tunnel: Mutex<Option<TunnelHandle>>,
    tasks: std::sync::Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    ping: Option<JoinHandle<()>>,
    events: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [self.ping.take(), self.events.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

impl<E: TunnelEngine, P: PlatformTunnelController> SessionController<E, P> {
    pub fn new(
        store: BandStore,
        engine: Arc<E>,
        platform: Arc<P>,
        sync: ConfigSync<E>,
        status: StatusCell,
        mfa: MfaState,
        gate: LifecycleGate,
        ping_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                engine,
                platform,
                sync,
                status,
                mfa,
                gate,
                ping_interval,
                tunnel: Mutex::new(None),
                tasks: std::sync::Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn mfa_required(&self) -> Option<String> {
        self.inner.mfa.current()
    }

    pub fn clear_mfa(&self) {
        self.inner.mfa.clear();
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Tasks> {
        match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<ConnectOutcome, SessionError> {
        const FROM: [ConnectionStatus; 2] =
            [ConnectionStatus::NotReady, ConnectionStatus::Disconnected];
        let inner = &self.inner;

        let current = inner.status.get();
        if !FROM.contains(&current) {
            return Err(SessionError::IllegalState {
                action: "connect",
                status: current,
            });
        }
        // Held until Connected so enrollment cannot change underneath.
        let _gate = inner.gate.try_enter().ok_or(SessionError::InProgress)?;
        inner.platform.ensure_profile().await?;
        inner
            .status
            .transition(&FROM, ConnectionStatus::Connecting)
            .map_err(|status| SessionError::IllegalState {
                action: "connect",
                status,
            })?;
        info!("connecting");

        match self.establish().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "connect failed");
                if !matches!(e, SessionError::Engine(_) | SessionError::Cancelled) {
                    inner
                        .status
                        .transition(&[ConnectionStatus::Connecting], ConnectionStatus::Disconnected)
                        .ok();
                }
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<ConnectOutcome, SessionError> {
        let inner = &self.inner;
        let enrollment = inner
            .store
            .default_enrollment()
            .await?
            .ok_or(SessionError::NotEnrolled)?;

        let config = match inner.sync.fetch_config(FetchType::WhenItRunsFirst).await {
            Ok(FetchOutcome::MfaRequired { sso_url }) => {
                inner
                    .status
                    .transition(&[ConnectionStatus::Connecting], ConnectionStatus::Disconnected)
                    .ok();
                return Ok(ConnectOutcome::MfaRequired { sso_url });
            }
            Ok(FetchOutcome::Updated(config)) => config,
            Ok(FetchOutcome::NotModified | FetchOutcome::Superseded) => {
                self.cached_config(&enrollment.band_uuid).await?
            }
            Err(e) => match inner.store.load_config(&enrollment.band_uuid).await? {
                Some(config) => {
                    warn!(error = %e, "configuration fetch failed, using cached copy");
                    config
                }
                None => return Err(e.into()),
            },
        };

        let settings = TunnelSettings::from_interface(&config.interface)?;
        self.ensure_connecting()?;
        let tunnel = inner.platform.start(&settings).await?;

        let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_BUFFER);
        if let Err(e) = inner
            .engine
            .start_packet_loop(&tunnel, &enrollment, &config, events_tx)
            .await
        {
            error!(error = %e, "engine failed to start");
            if let Err(stop_err) = inner.platform.stop(&tunnel).await {
                warn!(error = %stop_err, "failed to stop tunnel after engine failure");
            }
            inner.status.set(ConnectionStatus::Invalid);
            return Err(e.into());
        }

        *inner.tunnel.lock().await = Some(tunnel.clone());
        if inner
            .status
            .transition(&[ConnectionStatus::Connecting], ConnectionStatus::Connected)
            .is_err()
        {
            warn!("connect cancelled before completion, tearing down");
            self.teardown().await.ok();
            return Err(SessionError::Cancelled);
        }

        let mut tasks = self.tasks();
        tasks.abort_all();
        tasks.events = Some(self.spawn_event_listener(events_rx));
        tasks.ping = Some(self.spawn_ping());
        drop(tasks);

        info!(
            band_uuid = %enrollment.band_uuid,
            interface = %tunnel.interface,
            peers = config.peers.len(),
            "connected"
        );
        Ok(ConnectOutcome::Connected)
    }

    async fn cached_config(&self, band_uuid: &str) -> Result<BandConfig, SessionError> {
        self.inner
            .store
            .load_config(band_uuid)
            .await?
            .ok_or_else(|| SessionError::NoConfig(band_uuid.to_string()))
    }

    fn ensure_connecting(&self) -> Result<(), SessionError> {
        match self.inner.status.get() {
            ConnectionStatus::Connecting => Ok(()),
            _ => Err(SessionError::Cancelled),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let status = self.inner.status.get();
        if status == ConnectionStatus::NotReady {
            return Err(SessionError::IllegalState {
                action: "disconnect",
                status,
            });
        }
        // The platform may report Disconnected while the engine still runs.
        if status == ConnectionStatus::Disconnected && self.inner.tunnel.lock().await.is_none() {
            return Ok(());
        }

        info!(from = %status, "disconnecting");
        self.inner.status.set(ConnectionStatus::Disconnecting);
        let result = self.teardown().await;
        self.inner.status.set(ConnectionStatus::Disconnected);
        info!("disconnected");
        result
    }

    /// Stops background work first, then the engine, then the platform tunnel.
    async fn teardown(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        inner.sync.cancel();
        self.tasks().abort_all();

        let mut result: Result<(), SessionError> = Ok(());
        if let Err(e) = inner.engine.stop_packet_loop().await {
            warn!(error = %e, "failed to stop engine");
            result = Err(e.into());
        }
        let tunnel = inner.tunnel.lock().await.take();
        if let Some(tunnel) = tunnel {
            if let Err(e) = inner.platform.stop(&tunnel).await {
                warn!(error = %e, interface = %tunnel.interface, "failed to stop tunnel");
                result = Err(e.into());
            }
        }
        result
    }

    /// Asks the platform for the tunnel state and records it unless a
    /// transition is in progress.
    pub async fn refresh_status(&self) -> ConnectionStatus {
        let current = self.inner.status.get();
        if current.is_transitional() {
            return current;
        }
        match self.inner.platform.status().await {
            Ok(reported) if reported.locks_enrollment() && reported != current => {
                // Only connect may enter a state that locks enrollment.
                debug!(%reported, %current, "ignoring platform status");
                current
            }
            Ok(reported) => {
                // Invalid is only left through disconnect.
                const SETTLED: [ConnectionStatus; 3] = [
                    ConnectionStatus::NotReady,
                    ConnectionStatus::Disconnected,
                    ConnectionStatus::Connected,
                ];
                match self.inner.status.transition(&SETTLED, reported) {
                    Ok(previous) if previous != reported => {
                        info!(from = %previous, to = %reported, "platform reported status change");
                        reported
                    }
                    Ok(_) => reported,
                    Err(observed) => observed,
                }
            }
            Err(e) => {
                debug!(error = %e, "platform status unavailable");
                current
            }
        }
    }

    fn spawn_event_listener(&self, mut events: mpsc::Receiver<EngineEvent>) -> JoinHandle<()> {
        let sync = self.inner.sync.clone();
        let status = self.inner.status.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::ConfigRefreshRequired => {
                        debug!("engine requested configuration refresh");
                        sync.request_fetch(FetchType::WhenItGotsAEvent);
                    }
                    EngineEvent::Fatal(reason) => {
                        error!(reason = %reason, "engine reported a fatal error");
                        status.set(ConnectionStatus::Invalid);
                    }
                }
            }
            debug!("engine event channel closed");
        })
    }

    fn spawn_ping(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.inner.engine);
        let mfa = self.inner.mfa.clone();
        let period = self.inner.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match engine.send_control_message("ping").await {
                    Ok(reply) if reply.status == STATUS_OK => {}
                    Ok(reply) if reply.status == STATUS_MFA_REQUIRED => {
                        let sso_url = reply.sso_url.unwrap_or_default();
                        info!(sso_url = %sso_url, "engine reports MFA authentication required");
                        mfa.set(sso_url);
                    }
                    Ok(reply) => warn!(status = reply.status, msg = ?reply.msg, "unexpected ping reply"),
                    Err(e) => warn!(error = %e, "ping failed"),
                }
            }
        })
    }
}
