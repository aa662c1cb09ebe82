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

//! The contract between the protocol engine and whatever actually delivers
//! mail.
//!
//! The engine consumes exactly three operations: `Backend::login` to turn
//! credentials into a [`User`], `User::send` to deliver a completed message,
//! and `User::logout` when the session identity is discarded.

use std::future::Future;
use std::io;

use thiserror::Error;

use crate::data::DataReader;

/// Authentication failure.
///
/// The text is reported to the client verbatim in a `454` reply, so it
/// should not contain anything sensitive.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct AuthError(pub String);

impl AuthError {
    pub fn new(text: impl Into<String>) -> Self {
        AuthError(text.into())
    }
}

/// Delivery failure reported by `User::send`.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Rejection with a specific SMTP code and text, reported to the client
    /// verbatim.
    #[error("{text}")]
    Rejected { code: u16, text: String },
    /// Any other failure; reported as a generic `554`.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A message envelope being delivered.
///
/// `data` is a finite, non-restartable stream of the message body, already
/// de-transparentised (dot-unstuffing applied) and terminated at the final
/// `.` line. It is only valid for the duration of the `send` call; whatever
/// the backend leaves unread is discarded by the engine afterwards.
pub struct Message<'a> {
    /// The reverse-path, with angle brackets stripped.
    pub from: String,
    /// The forward-paths, in the order the client supplied them. Duplicates
    /// are permitted.
    pub to: Vec<String>,
    /// The message body.
    pub data: DataReader<'a>,
}

/// A provider of authentication and delivery.
///
/// One backend serves every connection of a server, so implementations must
/// be shareable; per-session state belongs on the [`User`].
pub trait Backend: Send + Sync + 'static {
    type User: User;

    /// Authenticates the given credentials, producing the session principal.
    ///
    /// The error text is sent to the client in a `454` reply.
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<Self::User, AuthError>> + Send;
}

/// An authenticated session principal.
pub trait User: Send {
    /// Delivers one message.
    ///
    /// The engine imposes no timeout on this call. `msg.data` must not be
    /// retained beyond it.
    fn send(
        &mut self,
        msg: &mut Message<'_>,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    /// Called when the session identity is discarded: on RSET, STARTTLS,
    /// and connection close.
    fn logout(&mut self) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}
