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

//! Control-plane request and response envelopes.
//!
//! Every response carries an in-body `status` that is independent of the HTTP
//! status code; `200` means success.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::conf::BandConfig;

/// Body status for success.
pub const STATUS_OK: i64 = 200;
/// Body status asking the client to complete MFA at `sso_url`.
pub const STATUS_MFA_REQUIRED: i64 = 301;
/// Control-channel reply for a message that could not be decoded.
pub const STATUS_BAD_MESSAGE: i64 = 501;
/// Control-channel reply for a message the engine does not understand.
pub const STATUS_UNKNOWN_MESSAGE: i64 = 502;
/// Unenroll: the band no longer exists.
pub const STATUS_BAND_NOT_FOUND: i64 = 505;
/// Unenroll: the device is not registered in the band.
pub const STATUS_DEVICE_NOT_FOUND: i64 = 506;

/// `POST /api/band/enroll` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// Enrollment token issued by a band administrator.
    pub token: String,
    /// Device name.
    pub name: String,
    /// Base64 WireGuard public key of the new device.
    pub wireguard_pubkey: String,
    /// Optional enrollment secret; empty when unused.
    pub secret: String,
}

/// `POST /api/band/enroll` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollResponse {
    /// Body status.
    pub status: i64,
    /// Server message on failure.
    #[serde(default)]
    pub msg: Option<String>,
    /// MFA redirect on status 301.
    #[serde(default)]
    pub sso_url: Option<String>,
    /// The band joined on success.
    #[serde(default)]
    pub band: Option<EnrolledBand>,
    /// Device credential on success.
    #[serde(default)]
    pub jwt: Option<String>,
}

/// Band description returned by a successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledBand {
    /// Band identifier.
    pub uuid: String,
    /// Band name.
    pub name: String,
    /// Public band flag, sent as `0`/`1`.
    #[serde(default, with = "int_flag")]
    pub opt_public: bool,
    /// Some server versions nest the credential inside the band object.
    #[serde(default)]
    pub jwt: Option<String>,
}

/// Minimal `{status, msg}` envelope (unenroll and error bodies).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    /// Body status.
    pub status: i64,
    /// Server message.
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
}

/// Reason the client is asking for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchType {
    /// First fetch when the tunnel starts.
    #[serde(rename = "when_it_runs_first")]
    WhenItRunsFirst,
    /// Fetch triggered by an engine event while the tunnel runs.
    #[serde(rename = "when_it_gots_a_event")]
    WhenItGotsAEvent,
}

impl fmt::Display for FetchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WhenItRunsFirst => "when_it_runs_first",
            Self::WhenItGotsAEvent => "when_it_gots_a_event",
        })
    }
}

/// `POST /api/band/conf` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfRequest {
    /// Why the fetch happens.
    pub fetch_type: FetchType,
    /// Address as seen from the STUN server.
    pub stun_mapped_addr: String,
    /// NAT classification as an integer.
    pub stun_nattype: i32,
    /// Local interface information.
    pub interface: ConfInterface,
}

/// Local interface section of [`ConfRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfInterface {
    /// UDP port the engine listens on.
    pub listen_port: u16,
    /// Candidate addresses for peers to reach this device.
    pub addresses: Vec<String>,
}

/// `POST /api/band/conf` response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfResponse {
    /// Body status.
    pub status: i64,
    /// Server message on failure.
    #[serde(default)]
    pub msg: Option<String>,
    /// MFA redirect on status 301.
    #[serde(default)]
    pub sso_url: Option<String>,
    /// Band configuration on success.
    #[serde(default)]
    pub conf: Option<BandConfig>,
}

/// `GET /webcli/signin` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebCliResponse {
    /// Body status.
    pub status: i64,
    /// Server message on failure.
    #[serde(default)]
    pub msg: Option<String>,
    /// Sign-in URL on success.
    #[serde(default)]
    pub url: Option<String>,
}

/// `POST /api/band/anonymous/create` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymousBandRequest {
    /// Band name.
    pub name: String,
    /// Free-form description.
    pub description: String,
}

/// `POST /api/band/anonymous/create` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymousBandResponse {
    /// Body status.
    pub status: i64,
    /// Server message on failure.
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    /// Identifier of the created band.
    #[serde(default)]
    pub band_uuid: Option<String>,
    /// Administrator credential for the created band.
    #[serde(default)]
    pub jwt: Option<String>,
}

/// `GET /api/band/anonymous/enrollment/token/create` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentTokenCreateResponse {
    /// Body status.
    pub status: i64,
    /// Server message on failure.
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    /// Enrollment token usable by this device.
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /api/band/anonymous/enrollment/token` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentTokenResponse {
    /// Body status.
    pub status: i64,
    /// Server message on failure.
    #[serde(default, alias = "message")]
    pub msg: Option<String>,
    /// Shareable enrollment token.
    #[serde(default)]
    pub token_uuid: Option<String>,
}

/// Reply to a message sent over the engine control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    /// Body status.
    pub status: i64,
    /// Free-form message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// MFA redirect on status 301.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso_url: Option<String>,
}

impl ControlReply {
    /// `{status: 200, msg: "Okay"}`.
    pub fn okay() -> Self {
        Self {
            status: STATUS_OK,
            msg: Some("Okay".into()),
            sso_url: None,
        }
    }

    /// `{status: 301, sso_url}`.
    pub fn mfa_required(sso_url: impl Into<String>) -> Self {
        Self {
            status: STATUS_MFA_REQUIRED,
            msg: None,
            sso_url: Some(sso_url.into()),
        }
    }

    /// Reply for a message that is empty or cannot be decoded.
    pub fn bad_message() -> Self {
        Self {
            status: STATUS_BAD_MESSAGE,
            msg: Some("Bad message".into()),
            sso_url: None,
        }
    }

    /// Reply for a message the engine does not handle.
    pub fn unknown_message(message: &str) -> Self {
        Self {
            status: STATUS_UNKNOWN_MESSAGE,
            msg: Some(format!("Unknown message {message}")),
            sso_url: None,
        }
    }
}

/// Integer `0`/`1` flags that some server versions send as booleans.
mod int_flag {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Int(i64),
        Bool(bool),
    }

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Flag::deserialize(deserializer)? {
            Flag::Int(v) => v != 0,
            Flag::Bool(b) => b,
        })
    }
}
