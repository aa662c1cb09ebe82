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

//! Postern is an embeddable ESMTP server library.
//!
//! It speaks the RFC 5321 command/reply protocol over TCP with the AUTH
//! (RFC 4954), STARTTLS, PIPELINING, and SIZE extensions, drives each
//! accepted connection through the protocol state machine, and hands every
//! completed message to a [`Backend`] of your choosing. Everything beyond
//! that point (queueing, relaying, storage) is the backend's business.
//!
//! ```no_run
//! use postern::{AuthError, Backend, DeliveryError, Message, Server, User};
//! use tokio::io::AsyncReadExt;
//!
//! struct Demo;
//! struct DemoUser;
//!
//! impl Backend for Demo {
//!     type User = DemoUser;
//!
//!     async fn login(
//!         &self,
//!         username: &str,
//!         password: &str,
//!     ) -> Result<DemoUser, AuthError> {
//!         if "username" == username && "password" == password {
//!             Ok(DemoUser)
//!         } else {
//!             Err(AuthError::new("Invalid username or password"))
//!         }
//!     }
//! }
//!
//! impl User for DemoUser {
//!     async fn send(
//!         &mut self,
//!         msg: &mut Message<'_>,
//!     ) -> Result<(), DeliveryError> {
//!         let mut body = Vec::new();
//!         msg.data.read_to_end(&mut body).await?;
//!         println!("{} => {:?}: {} bytes", msg.from, msg.to, body.len());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener =
//!         tokio::net::TcpListener::bind("127.0.0.1:2525").await.unwrap();
//!     Server::new("example.com", Demo)
//!         .allow_insecure_auth(true)
//!         .max_message_bytes(1024 * 1024)
//!         .serve(listener)
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod backend;
pub mod codes;
pub mod config;
pub mod sasl;
pub mod server;
pub mod support;
pub mod syntax;

mod conn;
mod data;

#[cfg(test)]
mod integration_test_common;

pub use backend::{AuthError, Backend, DeliveryError, Message, User};
pub use data::DataReader;
pub use sasl::{Mechanism, Session, Step};
pub use server::Server;
pub use support::error::Error;
pub use support::tee::DebugSink;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().is_some_and(|v| "1" == v) {
            return;
        }

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
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}
