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

//! Band configuration as served by `/api/band/conf`.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::NatType;

/// The band configuration for one device, cached per band together with the
/// ETag it was served with.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BandConfig {
    /// Local interface settings.
    pub interface: InterfaceConf,
    /// Other devices in the band.
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Band links shown to the user.
    #[serde(default)]
    pub links: Vec<Link>,
    /// Packet filter handed to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Acl>,
    /// Entity tag of the response this configuration came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Interface section of [`BandConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConf {
    /// Interface name.
    #[serde(default = "default_interface_name")]
    pub name: String,
    /// Address assigned to this device inside the band.
    pub private_ip: String,
    /// Dotted netmask for `private_ip`.
    pub private_mask: String,
    /// Interface MTU.
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    /// UDP port the server expects this device to listen on.
    #[serde(default)]
    pub listen_port: u16,
    /// NAT classification the server recorded for this device.
    #[serde(default)]
    pub nat_type: i32,
    /// Device identifier, present on newer servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<String>,
}

impl Default for InterfaceConf {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            private_ip: String::new(),
            private_mask: String::new(),
            mtu: default_mtu(),
            listen_port: 0,
            nat_type: 0,
            device_uuid: None,
        }
    }
}

fn default_interface_name() -> String {
    "mudband".into()
}

fn default_mtu() -> u32 {
    1420
}

impl InterfaceConf {
    /// Prefix length of `private_mask`, or `None` when it is not a
    /// contiguous dotted netmask.
    pub fn prefix_len(&self) -> Option<u8> {
        mask_to_prefix(&self.private_mask)
    }

    /// The NAT type, with unknown integers read as [`NatType::Unknown`].
    pub fn nat(&self) -> NatType {
        NatType::try_from(self.nat_type).unwrap_or_default()
    }
}

/// Another device in the band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Device name.
    pub name: String,
    /// Address inside the band.
    pub private_ip: String,
    /// Dotted netmask for `private_ip`.
    #[serde(default)]
    pub private_mask: String,
    /// NAT classification of the peer.
    #[serde(default)]
    pub nat_type: i32,
    /// Base64 WireGuard public key.
    pub wireguard_pubkey: String,
    /// Addresses the peer may be reached at.
    #[serde(default)]
    pub device_addresses: Vec<DeviceAddress>,
}

impl Peer {
    /// The NAT type, with unknown integers read as [`NatType::Unknown`].
    pub fn nat(&self) -> NatType {
        NatType::try_from(self.nat_type).unwrap_or_default()
    }

    /// First address that is not a relay.
    pub fn direct_address(&self) -> Option<&DeviceAddress> {
        self.device_addresses.iter().find(|a| !a.is_proxy())
    }
}

/// A candidate endpoint for a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// IP address.
    pub address: String,
    /// UDP port.
    pub port: u16,
    /// Address kind; `"proxy"` marks a relay.
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl DeviceAddress {
    /// Whether this endpoint is a relay.
    pub fn is_proxy(&self) -> bool {
        self.kind == "proxy"
    }
}

/// A band link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Display name.
    pub name: String,
    /// Target URL.
    pub url: String,
}

/// Band packet filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acl {
    /// Policy when no program matches.
    #[serde(default)]
    pub default_policy: AclPolicy,
    /// Filter programs as `[code, jt, jf, k]` instructions.
    #[serde(default)]
    pub programs: Vec<[i64; 4]>,
}

/// Default ACL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclPolicy {
    /// Accept unmatched traffic.
    #[default]
    Allow,
    /// Drop unmatched traffic.
    Block,
}

/// Converts a dotted netmask like `255.255.255.0` into a prefix length.
pub fn mask_to_prefix(mask: &str) -> Option<u8> {
    let bits = u32::from(mask.parse::<Ipv4Addr>().ok()?);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return None;
    }
    u8::try_from(prefix).ok()
}
