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

use std::future::Future;
use std::net::Ipv4Addr;

use thiserror::Error;

use mudband_types::conf::InterfaceConf;

use crate::status::ConnectionStatus;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("IP address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("invalid netmask: {0}")]
    InvalidMask(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the OS tunnel needs from the band configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    pub interface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u32,
}

impl TunnelSettings {
    pub fn from_interface(conf: &InterfaceConf) -> Result<Self, PlatformError> {
        let address: Ipv4Addr = conf.private_ip.parse()?;
        let prefix_len = conf
            .prefix_len()
            .ok_or_else(|| PlatformError::InvalidMask(conf.private_mask.clone()))?;
        Ok(Self {
            interface: conf.name.clone(),
            address,
            prefix_len,
            mtu: conf.mtu,
        })
    }
}

/// A tunnel brought up by [`PlatformTunnelController::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub interface: String,
}

pub trait PlatformTunnelController: Send + Sync + 'static {
    fn ensure_profile(&self) -> impl Future<Output = Result<(), PlatformError>> + Send;
    fn start(
        &self,
        settings: &TunnelSettings,
    ) -> impl Future<Output = Result<TunnelHandle, PlatformError>> + Send;
    fn stop(&self, tunnel: &TunnelHandle) -> impl Future<Output = Result<(), PlatformError>> + Send;
    fn status(&self) -> impl Future<Output = Result<ConnectionStatus, PlatformError>> + Send;
}

#[cfg(target_os = "linux")]
pub type CurrentPlatform = linux::NetlinkPlatform;

#[cfg(not(target_os = "linux"))]
pub type CurrentPlatform = StubPlatform;

// -- Stub platform for non-Linux --

#[derive(Debug, Default)]
pub struct StubPlatform;

impl PlatformTunnelController for StubPlatform {
    async fn ensure_profile(&self) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn start(&self, _settings: &TunnelSettings) -> Result<TunnelHandle, PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn stop(&self, _tunnel: &TunnelHandle) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn status(&self) -> Result<ConnectionStatus, PlatformError> {
        Ok(ConnectionStatus::NotReady)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::net::IpAddr;

    use futures::TryStreamExt;
    use tokio::sync::Mutex;
    use tracing::{debug, info};
    use wireguard_uapi::{RouteSocket, WgSocket};

    use super::{PlatformError, PlatformTunnelController, TunnelHandle, TunnelSettings};
    use crate::status::ConnectionStatus;

    /// Kernel WireGuard interface managed over netlink.
    #[derive(Debug, Default)]
    pub struct NetlinkPlatform {
        active: Mutex<Option<String>>,
    }

    impl NetlinkPlatform {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn route_socket() -> Result<RouteSocket, PlatformError> {
        RouteSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))
    }

    fn interface_exists(route: &mut RouteSocket, name: &str) -> Result<bool, PlatformError> {
        let existing = route
            .list_device_names()
            .map_err(|e| PlatformError::Interface(e.to_string()))?;
        Ok(existing.iter().any(|n| n == name))
    }

    impl PlatformTunnelController for NetlinkPlatform {
        async fn ensure_profile(&self) -> Result<(), PlatformError> {
            route_socket()?;
            WgSocket::connect().map_err(|e| PlatformError::Interface(e.to_string()))?;
            debug!("wireguard netlink family available");
            Ok(())
        }

        async fn start(&self, settings: &TunnelSettings) -> Result<TunnelHandle, PlatformError> {
            let name = settings.interface.as_str();
            {
                let mut route = route_socket()?;
                if interface_exists(&mut route, name)? {
                    debug!(interface = name, "interface already exists");
                } else {
                    info!(interface = name, "creating wireguard interface");
                    route
                        .add_device(name)
                        .map_err(|e| PlatformError::Interface(e.to_string()))?;
                }
            }

            assign_address(name, IpAddr::V4(settings.address), settings.prefix_len).await?;
            set_link_up(name, settings.mtu).await?;

            *self.active.lock().await = Some(name.to_string());
            info!(
                interface = name,
                address = %settings.address,
                prefix = settings.prefix_len,
                mtu = settings.mtu,
                "tunnel interface up"
            );
            Ok(TunnelHandle {
                interface: name.to_string(),
            })
        }

        async fn stop(&self, tunnel: &TunnelHandle) -> Result<(), PlatformError> {
            let name = tunnel.interface.as_str();
            {
                let mut route = route_socket()?;
                if interface_exists(&mut route, name)? {
                    info!(interface = name, "removing interface");
                    route
                        .del_device(name)
                        .map_err(|e| PlatformError::Interface(e.to_string()))?;
                }
            }
            let mut active = self.active.lock().await;
            if active.as_deref() == Some(name) {
                *active = None;
            }
            Ok(())
        }

        async fn status(&self) -> Result<ConnectionStatus, PlatformError> {
            let active = self.active.lock().await;
            let Some(name) = active.as_deref() else {
                return Ok(ConnectionStatus::Disconnected);
            };
            let mut route = route_socket()?;
            Ok(if interface_exists(&mut route, name)? {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            })
        }
    }

    /// Resolve interface name to its index via rtnetlink.
    async fn get_link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, PlatformError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?
            .ok_or_else(|| PlatformError::Interface(format!("interface {name} not found")))?;
        Ok(link.header.index)
    }

    async fn assign_address(name: &str, addr: IpAddr, prefix: u8) -> Result<(), PlatformError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let existing: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        for addr_msg in existing {
            handle
                .address()
                .del(addr_msg)
                .execute()
                .await
                .map_err(|e| PlatformError::Interface(e.to_string()))?;
        }
        debug!(interface = name, "flushed existing addresses");

        handle
            .address()
            .add(index, addr, prefix)
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        info!(interface = name, %addr, prefix, "assigned address via netlink");
        Ok(())
    }

    async fn set_link_up(name: &str, mtu: u32) -> Result<(), PlatformError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let msg = rtnetlink::LinkUnspec::new_with_index(index)
            .mtu(mtu)
            .up()
            .build();
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(|e| PlatformError::Interface(e.to_string()))?;

        info!(interface = name, mtu, "set link up via netlink");
        Ok(())
    }
}
