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

//! SASL mechanisms for the AUTH command.
//!
//! A mechanism session is a pure challenge/response state machine over raw
//! octets; the engine owns the wire framing (base64 both ways) and performs
//! the actual `Backend::login` when a session yields credentials.

use std::fmt;
use std::sync::Arc;

use crate::backend::AuthError;

/// The outcome of one step of a SASL exchange.
pub enum Step {
    /// Send the contained challenge to the client and feed its response to
    /// the next `step` call.
    Challenge(Vec<u8>),
    /// The exchange produced credentials; the engine verifies them through
    /// the backend and the session is finished.
    Credentials { username: String, password: String },
    /// The exchange is finished without credentials for the engine to
    /// verify. Unless the session authenticated the connection some other
    /// way, the AUTH command ends without effect.
    Done,
}

/// One in-progress SASL exchange, bound to a single connection.
pub trait Session: Send {
    /// Consumes the client's latest response (empty on the first step when
    /// no initial response was given) and decides how to continue.
    fn step(&mut self, response: &[u8]) -> Result<Step, AuthError>;
}

type SessionFactory = Arc<dyn Fn() -> Box<dyn Session> + Send + Sync>;

/// An authentication mechanism offered in EHLO.
///
/// `PLAIN` and `LOGIN` are built in; anything else plugs in through
/// `Custom`, whose factory is invoked once per AUTH command.
#[derive(Clone)]
pub enum Mechanism {
    Plain,
    Login,
    Custom(SessionFactory),
}

impl Mechanism {
    pub(crate) fn session(&self) -> Box<dyn Session> {
        match *self {
            Mechanism::Plain => Box::new(PlainSession::default()),
            Mechanism::Login => Box::new(LoginSession::default()),
            Mechanism::Custom(ref factory) => factory(),
        }
    }
}

impl fmt::Debug for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Mechanism::Plain => f.write_str("Plain"),
            Mechanism::Login => f.write_str("Login"),
            Mechanism::Custom(..) => f.write_str("Custom(..)"),
        }
    }
}

/// RFC 4616 PLAIN: a single response of
/// `<authorize-id> NUL <authenticate-id> NUL <password>`.
#[derive(Default)]
struct PlainSession {
    challenged: bool,
}

impl Session for PlainSession {
    fn step(&mut self, response: &[u8]) -> Result<Step, AuthError> {
        if response.is_empty() && !self.challenged {
            self.challenged = true;
            return Ok(Step::Challenge(Vec::new()));
        }

        let mut parts = response.split(|&b| 0 == b);
        let (Some(authorize), Some(authenticate), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::new("Invalid PLAIN response syntax"));
        };

        // <authorize-id> is optional if it is the same as <authenticate-id>.
        if !authorize.is_empty() && authorize != authenticate {
            return Err(AuthError::new(
                "authorize-id must match authenticate-id",
            ));
        }

        Ok(Step::Credentials {
            username: String::from_utf8_lossy(authenticate).into_owned(),
            password: String::from_utf8_lossy(password).into_owned(),
        })
    }
}

/// The legacy LOGIN mechanism: `Username:` and `Password:` prompts, one
/// response each.
#[derive(Default)]
struct LoginSession {
    state: LoginState,
}

#[derive(Default)]
enum LoginState {
    #[default]
    Init,
    WantUsername,
    WantPassword(String),
}

impl Session for LoginSession {
    fn step(&mut self, response: &[u8]) -> Result<Step, AuthError> {
        match std::mem::take(&mut self.state) {
            LoginState::Init if response.is_empty() => {
                self.state = LoginState::WantUsername;
                Ok(Step::Challenge(b"Username:".to_vec()))
            },
            // An initial response carries the username directly.
            LoginState::Init | LoginState::WantUsername => {
                self.state = LoginState::WantPassword(
                    String::from_utf8_lossy(response).into_owned(),
                );
                Ok(Step::Challenge(b"Password:".to_vec()))
            },
            LoginState::WantPassword(username) => Ok(Step::Credentials {
                username,
                password: String::from_utf8_lossy(response).into_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn expect_credentials(step: Step) -> (String, String) {
        match step {
            Step::Credentials { username, password } => (username, password),
            Step::Challenge(..) => panic!("got unexpected challenge"),
            Step::Done => panic!("got unexpected Done"),
        }
    }

    #[test]
    fn plain_with_initial_response() {
        let mut session = PlainSession::default();
        let (username, password) = expect_credentials(
            session.step(b"\x00azure\x00hunter2").unwrap(),
        );
        assert_eq!("azure", username);
        assert_eq!("hunter2", password);
    }

    #[test]
    fn plain_challenges_when_no_initial_response() {
        let mut session = PlainSession::default();
        match session.step(b"").unwrap() {
            Step::Challenge(ch) => assert!(ch.is_empty()),
            _ => panic!("expected empty challenge"),
        }

        let (username, password) = expect_credentials(
            session.step(b"azure\x00azure\x00hunter2").unwrap(),
        );
        assert_eq!("azure", username);
        assert_eq!("hunter2", password);
    }

    #[test]
    fn plain_rejects_mismatched_authorize_id() {
        let mut session = PlainSession::default();
        assert!(session.step(b"zim\x00azure\x00hunter2").is_err());
    }

    #[test]
    fn plain_rejects_malformed_response() {
        let mut session = PlainSession::default();
        session.step(b"").unwrap();
        assert!(session.step(b"no separators here").is_err());
        let mut session = PlainSession::default();
        assert!(session.step(b"a\x00b\x00c\x00d").is_err());
    }

    #[test]
    fn login_full_exchange() {
        let mut session = LoginSession::default();
        match session.step(b"").unwrap() {
            Step::Challenge(ch) => assert_eq!(b"Username:".to_vec(), ch),
            _ => panic!("expected Username challenge"),
        }
        match session.step(b"azure").unwrap() {
            Step::Challenge(ch) => assert_eq!(b"Password:".to_vec(), ch),
            _ => panic!("expected Password challenge"),
        }
        let (username, password) =
            expect_credentials(session.step(b"hunter2").unwrap());
        assert_eq!("azure", username);
        assert_eq!("hunter2", password);
    }

    #[test]
    fn login_with_initial_response() {
        let mut session = LoginSession::default();
        match session.step(b"azure").unwrap() {
            Step::Challenge(ch) => assert_eq!(b"Password:".to_vec(), ch),
            _ => panic!("expected Password challenge"),
        }
        let (username, password) =
            expect_credentials(session.step(b"hunter2").unwrap());
        assert_eq!("azure", username);
        assert_eq!("hunter2", password);
    }
}
