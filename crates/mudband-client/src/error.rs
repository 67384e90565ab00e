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

use serde::Serialize;

/// How a failure should be presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The control plane could not be reached. Retrying may help.
    Transport,
    /// The control plane answered but refused the request.
    ServerRejected,
    /// The engine, platform or local store failed.
    LocalState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transport => "transport",
            Self::ServerRejected => "server rejected",
            Self::LocalState => "local state",
        })
    }
}

/// Message shown for [`ErrorKind::LocalState`] failures; details go to the log.
pub const LOCAL_FAILURE_MESSAGE: &str = "an internal error occurred, see the log for details";
