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

use std::any::Any;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use openssl::ssl::SslAcceptor;
use tokio::net::TcpListener;

use crate::backend::Backend;
use crate::conn;
use crate::sasl::Mechanism;
use crate::support::{
    async_io::ServerIo, error::Error, log_prefix::LogPrefix, tee::DebugSink,
};

/// An ESMTP server: shared configuration plus the backend that does the
/// actual authentication and delivery.
///
/// All configuration is fixed once serving starts; each accepted connection
/// gets its own task and owns all of its session state exclusively.
pub struct Server<B: Backend> {
    pub(crate) backend: B,
    /// The name we report in the greeting banner.
    pub(crate) domain: String,
    /// Enables STARTTLS when present.
    pub(crate) tls: Option<SslAcceptor>,
    /// Whether AUTH is offered on unencrypted connections.
    pub(crate) allow_insecure_auth: bool,
    /// Maximum message size in bytes; advertised as SIZE and enforced on the
    /// body. Zero means unlimited.
    pub(crate) max_message_bytes: u64,
    /// Maximum recipients per envelope. Zero means unlimited.
    pub(crate) max_recipients: usize,
    /// Idle deadline for reads and writes. `None` means no deadline.
    pub(crate) max_idle: Option<Duration>,
    /// Maximum concurrent connections before new ones are rejected with
    /// `421`. Zero means unlimited.
    pub(crate) max_connections: usize,
    /// AUTH mechanisms, in the order they are advertised.
    pub(crate) mechanisms: Vec<(String, Mechanism)>,
    /// Extra capability lines reported verbatim in EHLO.
    pub(crate) extra_caps: Vec<String>,
    /// Observes a copy of all bytes in both directions when set.
    pub(crate) debug: Option<DebugSink>,
}

impl<B: Backend> Server<B> {
    /// Creates a server with the given banner domain and backend.
    ///
    /// PLAIN and LOGIN authentication are registered by default; neither is
    /// offered until the connection is encrypted unless
    /// [`allow_insecure_auth`](Self::allow_insecure_auth) is set.
    pub fn new(domain: impl Into<String>, backend: B) -> Self {
        Server {
            backend,
            domain: domain.into(),
            tls: None,
            allow_insecure_auth: false,
            max_message_bytes: 0,
            max_recipients: 0,
            max_idle: None,
            max_connections: 0,
            mechanisms: vec![
                ("PLAIN".to_owned(), Mechanism::Plain),
                ("LOGIN".to_owned(), Mechanism::Login),
            ],
            extra_caps: Vec::new(),
            debug: None,
        }
    }

    /// Enables STARTTLS with the given acceptor.
    pub fn tls(mut self, acceptor: SslAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Permits AUTH on unencrypted connections.
    pub fn allow_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    /// Caps the message size; zero means unlimited.
    pub fn max_message_bytes(mut self, bytes: u64) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Caps the recipient count per envelope; zero means unlimited.
    pub fn max_recipients(mut self, count: usize) -> Self {
        self.max_recipients = count;
        self
    }

    /// Sets the idle deadline, refreshed on every read and write; zero
    /// disables it.
    pub fn max_idle_seconds(mut self, seconds: u64) -> Self {
        self.max_idle = if 0 == seconds {
            None
        } else {
            Some(Duration::from_secs(seconds))
        };
        self
    }

    /// Caps concurrent connections; beyond the cap, new connections are
    /// answered with `421` and closed. Zero means unlimited.
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Adds a capability line reported verbatim in the EHLO response.
    pub fn extra_capability(mut self, cap: impl Into<String>) -> Self {
        self.extra_caps.push(cap.into());
        self
    }

    /// Replaces the AUTH mechanism registry. Names are uppercased; order
    /// determines the EHLO advertisement.
    pub fn auth_mechanisms(
        mut self,
        mechanisms: Vec<(String, Mechanism)>,
    ) -> Self {
        self.mechanisms = mechanisms
            .into_iter()
            .map(|(name, mech)| (name.to_ascii_uppercase(), mech))
            .collect();
        self
    }

    /// Installs a sink observing a copy of all inbound and outbound bytes.
    pub fn debug_sink(mut self, sink: DebugSink) -> Self {
        self.debug = Some(sink);
        self
    }

    pub(crate) fn mechanism(&self, name: &str) -> Option<Mechanism> {
        self.mechanisms
            .iter()
            .find(|&&(ref n, _)| n == name)
            .map(|&(_, ref mech)| mech.clone())
    }

    /// Accepts connections from the listener forever, spawning one task per
    /// connection.
    ///
    /// Returns only if accepting fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        info!("SMTP server listening on {}", listener.local_addr()?);

        let server = Arc::new(self);
        let active = Arc::new(AtomicUsize::new(0));

        loop {
            let (socket, peer) = listener.accept().await?;
            let server = Arc::clone(&server);
            let active = Arc::clone(&active);

            tokio::spawn(async move {
                let log_prefix = LogPrefix::new(peer.to_string());

                let socket = match socket.into_std() {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!("{log_prefix} Failed to detach socket: {e}");
                        return;
                    },
                };

                let active_now = active.fetch_add(1, Ordering::SeqCst) + 1;
                let _guard = ActiveGuard(active);

                let result = match ServerIo::new_owned_socket(socket) {
                    Err(e) => Err(e.into()),
                    Ok(io) => {
                        if server.max_connections > 0
                            && active_now > server.max_connections
                        {
                            warn!(
                                "{log_prefix} Rejecting connection, \
                                 {active_now} already active",
                            );
                            conn::reject(io, server.debug.clone()).await
                        } else {
                            conn::run(
                                Arc::clone(&server),
                                io,
                                log_prefix.clone(),
                            )
                            .await
                        }
                    },
                };

                match result {
                    Ok(()) => info!("{log_prefix} Normal client disconnect"),
                    Err(e) => {
                        warn!("{log_prefix} Abnormal client disconnect: {e}")
                    },
                }
            });
        }
    }

    /// Serves a single already-accepted connection.
    ///
    /// This is the entry point for embedders that run their own accept loop
    /// (or inherit sockets inetd-style); `serve` is a convenience wrapper
    /// around it.
    pub async fn handle(
        self: Arc<Self>,
        socket: impl AsRawFd + Any + Send + Sync,
        peer: impl Into<String>,
    ) -> Result<(), Error> {
        let io = ServerIo::new_owned_socket(socket)?;
        conn::run(self, io, LogPrefix::new(peer.into())).await
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
