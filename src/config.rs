//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version  3 of the License, or  (at your option)
// any later version.
//
// Postern is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Postern. If not, see <http://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Configuration for the reference `postern` daemon.
///
/// This is stored in a file named `postern.toml`. The library itself is
/// configured programmatically through [`crate::Server`]; this type exists
/// so the daemon binary has something to bind a config file to.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// The address to listen on, e.g. `0.0.0.0:2525`.
    pub listen: String,

    /// The host name reported in the greeting banner.
    pub domain: String,

    /// If true, offer AUTH on unencrypted connections.
    #[serde(default)]
    pub allow_insecure_auth: bool,

    /// Maximum message size in bytes; 0 means unlimited.
    #[serde(default)]
    pub max_message_bytes: u64,

    /// Maximum recipients per message; 0 means unlimited.
    #[serde(default)]
    pub max_recipients: usize,

    /// Seconds a connection may sit idle before it is dropped; 0 disables
    /// the deadline.
    #[serde(default)]
    pub max_idle_seconds: u64,

    /// Maximum concurrent connections; 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,

    /// Extra capability lines to report in EHLO, e.g. `8BITMIME`.
    #[serde(default)]
    pub extra_capabilities: Vec<String>,

    /// Configuration for TLS. STARTTLS is offered when present.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Accounts the demo backend accepts, as username = "password" pairs.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
