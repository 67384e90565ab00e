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

//! mudband-types: Shared type definitions for the mudband client.
//!
//! This crate contains the control-plane request/response envelopes, the
//! band configuration model, and the records the client persists locally.

#![warn(missing_docs)]

pub mod api;
pub mod conf;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A device's membership in a band, as stored on disk.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Band identifier assigned by the control plane.
    pub band_uuid: String,
    /// Human-readable band name.
    pub band_name: String,
    /// Credential used for every authenticated call on behalf of this device.
    pub jwt: String,
    /// Base64 WireGuard private key generated at enrollment time.
    pub wireguard_privkey: String,
    /// Whether the band is public (WebCLI sign-in is available).
    #[serde(default)]
    pub opt_public: bool,
    /// Name this device registered under.
    #[serde(default)]
    pub device_name: String,
    /// When the enrollment completed.
    pub enrolled_at: DateTime<Utc>,
}

impl fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enrollment")
            .field("band_uuid", &self.band_uuid)
            .field("band_name", &self.band_name)
            .field("jwt", &"<redacted>")
            .field("wireguard_privkey", &"<redacted>")
            .field("opt_public", &self.opt_public)
            .field("device_name", &self.device_name)
            .field("enrolled_at", &self.enrolled_at)
            .finish()
    }
}

/// Listing entry for a locally stored enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentSummary {
    /// Band identifier.
    pub band_uuid: String,
    /// Band name.
    pub band_name: String,
    /// Whether this is the default (active) enrollment.
    pub is_default: bool,
}

/// Administrator credential for a band this device created as a guest.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct BandAdmin {
    /// Band identifier.
    pub band_uuid: String,
    /// Administrator credential.
    pub jwt: String,
}

impl fmt::Debug for BandAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandAdmin")
            .field("band_uuid", &self.band_uuid)
            .field("jwt", &"<redacted>")
            .finish()
    }
}

/// NAT classification reported by the STUN client. Sent as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    /// Not classified yet.
    #[default]
    Unknown,
    /// Classification failed.
    Failure,
    /// No NAT in the path.
    Open,
    /// UDP is blocked.
    Blocked,
    /// Full-cone NAT.
    FullCone,
    /// Address-restricted cone NAT.
    RestrictedCone,
    /// Port-restricted cone NAT.
    PortRestrictedCone,
    /// Symmetric NAT.
    Symmetric,
    /// Firewalled, no NAT.
    Firewall,
}

/// Integer that does not correspond to any [`NatType`].
#[derive(Debug, Error)]
#[error("unknown NAT type: {0}")]
pub struct UnknownNatType(pub i32);

impl NatType {
    /// Wire representation.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Failure => 1,
            Self::Open => 2,
            Self::Blocked => 3,
            Self::FullCone => 4,
            Self::RestrictedCone => 5,
            Self::PortRestrictedCone => 6,
            Self::Symmetric => 7,
            Self::Firewall => 8,
        }
    }
}

impl TryFrom<i32> for NatType {
    type Error = UnknownNatType;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Unknown,
            1 => Self::Failure,
            2 => Self::Open,
            3 => Self::Blocked,
            4 => Self::FullCone,
            5 => Self::RestrictedCone,
            6 => Self::PortRestrictedCone,
            7 => Self::Symmetric,
            8 => Self::Firewall,
            other => return Err(UnknownNatType(other)),
        })
    }
}
