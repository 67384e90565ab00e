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

//! The tunnel engine: key material, local address discovery and the WireGuard
//! packet loop. The session and sync managers only talk to [`TunnelEngine`].

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use mudband_types::api::ControlReply;
use mudband_types::conf::{BandConfig, Peer};
use mudband_types::{Enrollment, NatType};

use crate::config::ClientToml;
use crate::platform::TunnelHandle;

/// Most interface addresses reported to the control plane.
const MAX_LOCAL_ADDRESSES: usize = 16;
const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("packet loop is not running")]
    NotRunning,

    #[error("packet loop is already running")]
    AlreadyRunning,

    #[error("failed to decode base64 key: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("IP address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("wireguard device error: {0}")]
    Device(String),
}

/// Notifications from a running packet loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The band configuration should be fetched again.
    ConfigRefreshRequired,
    /// The loop stopped and cannot recover.
    Fatal(String),
}

/// Base64 WireGuard key pair.
#[derive(Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

pub trait TunnelEngine: Send + Sync + 'static {
    fn create_key_pair(&self) -> Result<KeyPair, EngineError>;
    fn local_interface_addresses(&self) -> Vec<String>;
    fn listen_port(&self) -> u16;
    fn stun_mapped_address(&self) -> Option<String>;
    fn stun_nat_type(&self) -> NatType;
    fn start_packet_loop(
        &self,
        tunnel: &TunnelHandle,
        enrollment: &Enrollment,
        config: &BandConfig,
        events: mpsc::Sender<EngineEvent>,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
    fn update_config(
        &self,
        config: &BandConfig,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;
    fn stop_packet_loop(&self) -> impl Future<Output = Result<(), EngineError>> + Send;
    fn send_control_message(
        &self,
        message: &str,
    ) -> impl Future<Output = Result<ControlReply, EngineError>> + Send;
}

pub type CurrentEngine = KernelEngine;

// -- Helper utilities --

pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(&mut rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], EngineError> {
    let bytes = STANDARD.decode(b64)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| EngineError::InvalidKeyLength(len))
}

/// Addresses worth advertising to peers: IPv4 only, without loopback,
/// unspecified, broadcast or benchmark (198.18.0.0/15) addresses.
pub fn filter_local_addresses(candidates: impl IntoIterator<Item = IpAddr>) -> Vec<String> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .filter(|ip| !(ip.is_loopback() || ip.is_unspecified() || ip.is_broadcast()))
        .filter(|ip| !is_benchmark(ip))
        .filter(|ip| seen.insert(*ip))
        .take(MAX_LOCAL_ADDRESSES)
        .map(|ip| ip.to_string())
        .collect()
}

fn is_benchmark(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    a == 198 && (b & 0xfe) == 18
}

/// No keepalive is needed when neither side is behind NAT.
pub fn keepalive_interval(local: NatType, peer: NatType) -> u16 {
    if local == NatType::Open && peer == NatType::Open {
        0
    } else {
        PERSISTENT_KEEPALIVE_SECS
    }
}

/// First direct endpoint of a peer. A relay is only used when the peer has no
/// direct address and at least one side is behind NAT.
pub fn peer_endpoint(local: NatType, peer: &Peer) -> Option<SocketAddr> {
    let parse = |address: &str, port: u16| {
        address
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, port))
    };
    if let Some(direct) = peer.direct_address() {
        return parse(&direct.address, direct.port);
    }
    if keepalive_interval(local, peer.nat()) == 0 {
        return None;
    }
    peer.device_addresses
        .iter()
        .filter(|a| a.is_proxy())
        .find_map(|a| parse(&a.address, a.port))
}

// -- Kernel WireGuard engine --

/// Drives the kernel WireGuard device created by the platform layer.
pub struct KernelEngine {
    listen_port: u16,
    mapped_addr: Option<String>,
    nat_type: NatType,
    refresh_interval: Duration,
    state: Mutex<Option<LoopState>>,
}

struct LoopState {
    interface: String,
    private_key: [u8; 32],
    refresh: JoinHandle<()>,
}

impl KernelEngine {
    pub fn new(config: &ClientToml) -> Self {
        let nat_type = NatType::try_from(config.stun.nat_type).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring configured NAT type");
            NatType::Unknown
        });
        Self {
            listen_port: config.listen_port,
            mapped_addr: config.stun.mapped_addr.clone().filter(|a| !a.is_empty()),
            nat_type,
            refresh_interval: config.conf_refresh_interval(),
            state: Mutex::new(None),
        }
    }

    fn effective_port(&self, config: &BandConfig) -> u16 {
        match config.interface.listen_port {
            0 => self.listen_port,
            port => port,
        }
    }
}

impl TunnelEngine for KernelEngine {
    fn create_key_pair(&self) -> Result<KeyPair, EngineError> {
        Ok(generate_key_pair())
    }

    fn local_interface_addresses(&self) -> Vec<String> {
        match get_if_addrs::get_if_addrs() {
            Ok(interfaces) => filter_local_addresses(interfaces.iter().map(|i| i.ip())),
            Err(e) => {
                warn!(error = %e, "failed to enumerate interfaces");
                Vec::new()
            }
        }
    }

    fn listen_port(&self) -> u16 {
        self.listen_port
    }

    fn stun_mapped_address(&self) -> Option<String> {
        self.mapped_addr.clone()
    }

    fn stun_nat_type(&self) -> NatType {
        self.nat_type
    }

    async fn start_packet_loop(
        &self,
        tunnel: &TunnelHandle,
        enrollment: &Enrollment,
        config: &BandConfig,
        events: mpsc::Sender<EngineEvent>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let private_key = decode_key(&enrollment.wireguard_privkey)?;
        device::apply(&tunnel.interface, &private_key, self.effective_port(config), config)?;

        let interval = self.refresh_interval;
        let refresh = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                debug!("requesting periodic configuration refresh");
                if events.send(EngineEvent::ConfigRefreshRequired).await.is_err() {
                    break;
                }
            }
        });

        info!(
            interface = %tunnel.interface,
            band_uuid = %enrollment.band_uuid,
            peers = config.peers.len(),
            "packet loop started"
        );
        *state = Some(LoopState {
            interface: tunnel.interface.clone(),
            private_key,
            refresh,
        });
        Ok(())
    }

    async fn update_config(&self, config: &BandConfig) -> Result<(), EngineError> {
        let state = self.state.lock().await;
        let state = state.as_ref().ok_or(EngineError::NotRunning)?;
        device::apply(
            &state.interface,
            &state.private_key,
            self.effective_port(config),
            config,
        )?;
        info!(interface = %state.interface, peers = config.peers.len(), "packet loop reconfigured");
        Ok(())
    }

    async fn stop_packet_loop(&self) -> Result<(), EngineError> {
        if let Some(state) = self.state.lock().await.take() {
            state.refresh.abort();
            info!(interface = %state.interface, "packet loop stopped");
        }
        Ok(())
    }

    async fn send_control_message(&self, message: &str) -> Result<ControlReply, EngineError> {
        match message.trim() {
            "" => Ok(ControlReply::bad_message()),
            "ping" => {
                if self.state.lock().await.is_none() {
                    return Err(EngineError::NotRunning);
                }
                Ok(ControlReply::okay())
            }
            other => {
                debug!(message = other, "unknown control message");
                Ok(ControlReply::unknown_message(other))
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod device {
    use mudband_types::conf::BandConfig;

    use super::EngineError;

    pub fn apply(
        _interface: &str,
        _private_key: &[u8; 32],
        _listen_port: u16,
        _config: &BandConfig,
    ) -> Result<(), EngineError> {
        Err(EngineError::Unsupported)
    }
}

#[cfg(target_os = "linux")]
mod device {
    use std::net::{IpAddr, SocketAddr};

    use tracing::debug;
    use wireguard_uapi::{WgSocket, set};

    use mudband_types::conf::BandConfig;

    use super::{EngineError, decode_key, keepalive_interval, peer_endpoint};

    struct PeerOwned {
        pub_key: [u8; 32],
        endpoint: Option<SocketAddr>,
        allowed_ip: IpAddr,
        keepalive: u16,
    }

    pub fn apply(
        interface: &str,
        private_key: &[u8; 32],
        listen_port: u16,
        config: &BandConfig,
    ) -> Result<(), EngineError> {
        let local_nat = config.interface.nat();

        let peer_data: Vec<PeerOwned> = config
            .peers
            .iter()
            .map(|p| {
                Ok(PeerOwned {
                    pub_key: decode_key(&p.wireguard_pubkey)?,
                    endpoint: peer_endpoint(local_nat, p),
                    allowed_ip: p.private_ip.parse()?,
                    keepalive: keepalive_interval(local_nat, p.nat()),
                })
            })
            .collect::<Result<_, EngineError>>()?;

        let peers: Vec<set::Peer<'_>> = peer_data
            .iter()
            .map(|p| {
                let mut peer = set::Peer::from_public_key(&p.pub_key)
                    .flags(vec![set::WgPeerF::ReplaceAllowedIps]);

                if let Some(ref ep) = p.endpoint {
                    peer = peer.endpoint(ep);
                }
                if p.keepalive > 0 {
                    peer = peer.persistent_keepalive_interval(p.keepalive);
                }

                let mut aip = set::AllowedIp::from_ipaddr(&p.allowed_ip);
                aip.cidr_mask = Some(32);
                peer.allowed_ips(vec![aip])
            })
            .collect();

        let dev = set::Device::from_ifname(interface)
            .private_key(private_key)
            .listen_port(listen_port)
            .flags(vec![set::WgDeviceF::ReplacePeers])
            .peers(peers);

        let mut wg = WgSocket::connect().map_err(|e| EngineError::Device(e.to_string()))?;
        wg.set_device(dev)
            .map_err(|e| EngineError::Device(e.to_string()))?;

        if config.acl.is_some() {
            debug!(interface, "band ACL is not enforced by the kernel device");
        }
        debug!(
            interface,
            listen_port,
            peer_count = config.peers.len(),
            "applied wireguard device config"
        );
        Ok(())
    }
}
