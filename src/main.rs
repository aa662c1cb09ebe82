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

//! The reference Postern daemon.
//!
//! This is a thin, illustrative wrapper: it binds a TOML config file to the
//! library's `Server` and serves a backend that merely logs each accepted
//! message. Real deployments are expected to embed the library behind their
//! own backend instead.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use log::{error, info};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use structopt::StructOpt;
use tokio::io::AsyncReadExt;

use postern::config::{DaemonConfig, TlsConfig};
use postern::{AuthError, Backend, DeliveryError, Message, Server, User};

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// Path to the configuration file.
    #[structopt(long, parse(from_os_str), default_value = "postern.toml")]
    config: PathBuf,
}

/// Accepts the accounts listed in the config and logs whatever arrives.
struct DemoBackend {
    users: BTreeMap<String, String>,
}

struct DemoUser {
    username: String,
}

impl Backend for DemoBackend {
    type User = DemoUser;

    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<DemoUser, AuthError> {
        match self.users.get(username) {
            Some(expected) if expected == password => Ok(DemoUser {
                username: username.to_owned(),
            }),
            _ => Err(AuthError::new("Invalid username or password")),
        }
    }
}

impl User for DemoUser {
    async fn send(
        &mut self,
        msg: &mut Message<'_>,
    ) -> Result<(), DeliveryError> {
        let mut body = Vec::new();
        msg.data.read_to_end(&mut body).await?;
        info!(
            "{}: accepted message from <{}> for {:?} ({} bytes)",
            self.username,
            msg.from,
            msg.to,
            body.len(),
        );
        Ok(())
    }
}

fn create_ssl_acceptor(tls: &TlsConfig) -> SslAcceptor {
    let mut acceptor =
        match SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()) {
            Ok(a) => a,
            Err(e) => {
                die(&format!("Failed to initialise OpenSSL acceptor: {e}"))
            },
        };

    if let Err(e) =
        acceptor.set_private_key_file(&tls.private_key, SslFiletype::PEM)
    {
        die(&format!(
            "Unable to load TLS private key from '{}': {e}",
            tls.private_key.display(),
        ));
    }

    if let Err(e) = acceptor.set_certificate_chain_file(&tls.certificate_chain)
    {
        die(&format!(
            "Unable to load TLS certificate chain from '{}': {e}",
            tls.certificate_chain.display(),
        ));
    }

    if let Err(e) = acceptor.check_private_key() {
        die(&format!("TLS key seems to be invalid: {e}"));
    }

    acceptor.build()
}

fn init_simple_log() {
    let stderr = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    let log_config = log4rs::config::Config::builder()
        .appender(
            log4rs::config::Appender::builder()
                .build("stderr", Box::new(stderr)),
        )
        .build(
            log4rs::config::Root::builder()
                .appender("stderr")
                .build(log::LevelFilter::Info),
        )
        .unwrap();
    log4rs::init_config(log_config).unwrap();
}

fn die(message: &str) -> ! {
    error!("{message}");
    process::exit(1)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let options = Options::from_args();
    init_simple_log();

    let config = match DaemonConfig::load(&options.config) {
        Ok(config) => config,
        Err(e) => die(&format!(
            "Unable to load '{}': {e}",
            options.config.display(),
        )),
    };

    let mut server = Server::new(
        config.domain.as_str(),
        DemoBackend {
            users: config.users.clone(),
        },
    )
    .allow_insecure_auth(config.allow_insecure_auth)
    .max_message_bytes(config.max_message_bytes)
    .max_recipients(config.max_recipients)
    .max_idle_seconds(config.max_idle_seconds)
    .max_connections(config.max_connections);

    for cap in &config.extra_capabilities {
        server = server.extra_capability(cap.as_str());
    }

    if let Some(ref tls) = config.tls {
        server = server.tls(create_ssl_acceptor(tls));
    }

    let listener = match tokio::net::TcpListener::bind(&config.listen).await {
        Ok(listener) => listener,
        Err(e) => die(&format!("Unable to listen on {}: {e}", config.listen)),
    };

    if let Err(e) = server.serve(listener).await {
        die(&format!("Server terminated: {e}"));
    }
}
