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

//! The per-connection protocol engine.
//!
//! One `Conn` drives one accepted connection through the command loop until
//! the client quits, the transport fails, or the idle timer fires. All
//! session state lives here and is exclusively owned by the connection's
//! task.

use std::fmt::Write as _;
use std::io;
use std::str;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::sync::watch;

use crate::backend::{Backend, DeliveryError, Message, User};
use crate::codes::*;
use crate::data::DataReader;
use crate::sasl::Step;
use crate::server::Server;
use crate::support::{
    async_io::ServerIo,
    error::Error,
    log_prefix::LogPrefix,
    tee::{DebugSink, TeeIo},
};
use crate::syntax::{Command, ParseError};

const MAX_LINE: usize = 1024;

/// How many unrecognized commands are answered individually before the
/// connection is dropped.
const MAX_UNKNOWN_COMMANDS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, phinal: bool) -> Self {
        if phinal {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

/// The mail transaction being assembled.
///
/// Created empty when authentication succeeds; `from` and `to` fill in as
/// MAIL and RCPT arrive.
struct Envelope {
    from: Option<String>,
    to: Vec<String>,
}

struct Conn<B: Backend> {
    server: Arc<Server<B>>,
    io: BufStream<TeeIo>,
    log_prefix: LogPrefix,
    deadline_tx: watch::Sender<Option<Instant>>,

    helo: Option<String>,
    user: Option<B::User>,
    envelope: Option<Envelope>,
    unknown_commands: u32,
    quit: bool,
}

/// Runs the protocol engine over the given transport until the connection
/// ends.
pub(crate) async fn run<B: Backend>(
    server: Arc<Server<B>>,
    io: ServerIo,
    log_prefix: LogPrefix,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = watch::channel(None);
    let idle = server.max_idle;

    let mut conn = Conn {
        io: BufStream::new(TeeIo::new(io, server.debug.clone())),
        server,
        log_prefix,
        deadline_tx,
        helo: None,
        user: None,
        envelope: None,
        unknown_commands: 0,
        quit: false,
    };

    let result = match idle {
        Some(idle) => tokio::select! {
            r = conn.run() => r,
            _ = idle_timer(deadline_rx, idle) => {
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection idle timer expired",
                )))
            },
        },
        None => conn.run().await,
    };

    if let Some(mut user) = conn.user.take() {
        user.logout().await;
    }

    result
}

/// Answers an over-capacity connection with `421` and hangs up.
pub(crate) async fn reject(
    io: ServerIo,
    debug: Option<DebugSink>,
) -> Result<(), Error> {
    let mut io = BufStream::new(TeeIo::new(io, debug));
    io.write_all(b"421 Too busy. Try again later.\r\n").await?;
    io.flush().await?;
    Ok(())
}

impl<B: Backend> Conn<B> {
    async fn run(&mut self) -> Result<(), Error> {
        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        self.refresh_deadline();
        buffer.clear();

        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', buffer)
            .await?;
        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.send_reply(
                    Final,
                    pc::CommandSyntaxError,
                    "Command line too long",
                )
                .await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let command_line =
            match str::from_utf8(&buffer[..buffer.len() - line_ending_len]) {
                Ok(s) => s,
                Err(_) => {
                    warn!("{} Non-UTF-8 command received", self.log_prefix);
                    self.send_reply(
                        Final,
                        pc::CommandSyntaxError,
                        "Malformed UTF-8",
                    )
                    .await?;
                    return Ok(());
                },
            };

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(ParseError::Empty) => {
                return self
                    .send_reply(Final, pc::CommandSyntaxError, "Speak up")
                    .await;
            },
            Err(ParseError::Syntax(message)) => {
                return self
                    .send_reply(Final, pc::ParameterSyntaxError, message)
                    .await;
            },
            Err(ParseError::Unrecognized(verb)) => {
                return self.unrecognized_command(&verb).await;
            },
        };

        match command {
            Command::Helo { extended, domain } => {
                self.cmd_helo(extended, domain).await
            },
            Command::Mail { from, size } => self.cmd_mail(from, size).await,
            Command::Rcpt { to } => self.cmd_rcpt(to).await,
            Command::Auth { mechanism, initial } => {
                self.cmd_auth(mechanism, initial).await
            },
            Command::Data => self.cmd_data().await,
            Command::Reset => self.cmd_reset().await,
            Command::Noop => self.cmd_noop().await,
            Command::Verify => self.cmd_verify().await,
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
            Command::Unimplemented(verb) => {
                self.cmd_unimplemented(&verb).await
            },
        }
    }

    async fn unrecognized_command(&mut self, verb: &str) -> Result<(), Error> {
        if self.unknown_commands >= MAX_UNKNOWN_COMMANDS {
            warn!(
                "{} Terminating connection after too many \
                 unrecognized commands",
                self.log_prefix,
            );
            self.send_reply(
                Final,
                pc::CommandSyntaxError,
                "Too many unrecognized commands",
            )
            .await?;
            self.quit = true;
            return Ok(());
        }

        self.unknown_commands += 1;

        let mut debug_verb = verb;
        if let Some((truncate_len, _)) = debug_verb.char_indices().nth(64) {
            debug_verb = &debug_verb[..truncate_len];
        }
        warn!(
            "{} Received unknown command {debug_verb:?}",
            self.log_prefix
        );

        self.send_reply(
            Final,
            pc::CommandSyntaxError,
            &format!("Syntax error, {verb} command unrecognized"),
        )
        .await
    }

    async fn cmd_helo(
        &mut self,
        extended: bool,
        domain: String,
    ) -> Result<(), Error> {
        self.log_prefix.set_helo(domain.clone());
        info!(
            "{} SMTP {}",
            self.log_prefix,
            if extended { "EHLO" } else { "HELO" },
        );
        self.helo = Some(domain.clone());

        if !extended {
            return self
                .send_reply(Final, pc::Ok, &format!("Hello {domain}"))
                .await;
        }

        let is_ssl = self.io.get_ref().get_ref().is_ssl();
        let mut caps = self.server.extra_caps.clone();
        // RFC 3207 requires not sending STARTTLS after TLS has been
        // negotiated.
        if self.server.tls.is_some() && !is_ssl {
            caps.push("STARTTLS".to_owned());
        }
        if is_ssl || self.server.allow_insecure_auth {
            let mut auth_cap = "AUTH".to_owned();
            for (name, _) in &self.server.mechanisms {
                auth_cap.push(' ');
                auth_cap.push_str(name);
            }
            caps.push(auth_cap);
        }
        if self.server.max_message_bytes > 0 {
            caps.push(format!("SIZE {}", self.server.max_message_bytes));
        }

        self.send_reply(
            Delayable.or_final(caps.is_empty()),
            pc::Ok,
            &format!("Hello {domain}"),
        )
        .await?;

        let count = caps.len();
        for (ix, cap) in caps.iter().enumerate() {
            self.send_reply(Delayable.or_final(ix + 1 == count), pc::Ok, cap)
                .await?;
        }

        Ok(())
    }

    async fn cmd_mail(
        &mut self,
        from: String,
        size: Option<u64>,
    ) -> Result<(), Error> {
        if self.helo.is_none() {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Please introduce yourself first.",
                )
                .await;
        }
        if self.envelope.is_none() {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Please authenticate first.",
                )
                .await;
        }

        if let Some(size) = size {
            if self.server.max_message_bytes > 0
                && size > self.server.max_message_bytes
            {
                return self
                    .send_reply(
                        Final,
                        pc::ExceededStorageAllocation,
                        "Max message size exceeded",
                    )
                    .await;
            }
        }

        if let Some(envelope) = self.envelope.as_mut() {
            envelope.from = Some(from.clone());
        }

        info!("{} Start mail transaction from <{from}>", self.log_prefix);
        self.send_reply(
            Final,
            pc::Ok,
            &format!("Roger, accepting mail from <{from}>"),
        )
        .await
    }

    async fn cmd_rcpt(&mut self, to: String) -> Result<(), Error> {
        if !self
            .envelope
            .as_ref()
            .is_some_and(|envelope| envelope.from.is_some())
        {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Missing MAIL FROM command.",
                )
                .await;
        }

        let max_recipients = self.server.max_recipients;
        if max_recipients > 0
            && self
                .envelope
                .as_ref()
                .map_or(0, |envelope| envelope.to.len())
                >= max_recipients
        {
            return self
                .send_reply(
                    Final,
                    pc::ExceededStorageAllocation,
                    &format!(
                        "Maximum limit of {max_recipients} recipients reached"
                    ),
                )
                .await;
        }

        if let Some(envelope) = self.envelope.as_mut() {
            envelope.to.push(to.clone());
        }

        self.send_reply(
            Final,
            pc::Ok,
            &format!("I'll make sure <{to}> gets this"),
        )
        .await
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial: Option<String>,
    ) -> Result<(), Error> {
        if self.helo.is_none() {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Please introduce yourself first.",
                )
                .await;
        }
        if mechanism.is_empty() {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Missing parameter",
                )
                .await;
        }
        if !self.io.get_ref().get_ref().is_ssl()
            && !self.server.allow_insecure_auth
        {
            warn!("{} Rejected attempt to AUTH without TLS", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Authentication requires a TLS connection",
                )
                .await;
        }
        if self.user.is_some() {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Already authenticated",
                )
                .await;
        }

        let mechanism = mechanism.to_ascii_uppercase();
        let Some(mech) = self.server.mechanism(&mechanism) else {
            warn!(
                "{} Rejected attempt to auth with mechanism {mechanism:?}",
                self.log_prefix,
            );
            return self
                .send_reply(
                    Final,
                    pc::CommandParameterNotImplemented,
                    "Unsupported authentication mechanism",
                )
                .await;
        };

        // Parse the client initial response if there is one. A malformed
        // initial response ends the exchange without a reply.
        let mut response = Vec::new();
        if let Some(initial) = initial {
            match base64::decode(&initial) {
                Ok(decoded) => response = decoded,
                Err(_) => {
                    warn!(
                        "{} Malformed base64 in AUTH initial response",
                        self.log_prefix,
                    );
                    return Ok(());
                },
            }
        }

        let mut session = mech.session();
        loop {
            match session.step(&response) {
                Err(e) => {
                    warn!(
                        "{} AUTH {mechanism} failed: {e}",
                        self.log_prefix
                    );
                    return self
                        .send_reply(
                            Final,
                            pc::TemporaryAuthenticationFailure,
                            &e.to_string(),
                        )
                        .await;
                },

                Ok(Step::Done) => break,

                Ok(Step::Credentials { username, password }) => {
                    // No deadline applies while the backend verifies
                    // credentials; the next reply re-arms it.
                    self.pause_deadline();
                    match self.server.backend.login(&username, &password).await
                    {
                        Ok(user) => {
                            self.user = Some(user);
                            self.log_prefix.set_user(username);
                            break;
                        },
                        Err(e) => {
                            warn!(
                                "{} Login failed for {username:?}: {e}",
                                self.log_prefix,
                            );
                            return self
                                .send_reply(
                                    Final,
                                    pc::TemporaryAuthenticationFailure,
                                    &e.to_string(),
                                )
                                .await;
                        },
                    }
                },

                Ok(Step::Challenge(challenge)) => {
                    let encoded = if challenge.is_empty() {
                        String::new()
                    } else {
                        base64::encode(&challenge)
                    };
                    self.send_reply(Final, pc::ServerChallenge, &encoded)
                        .await?;

                    let line = self.read_auth_line().await?;
                    match base64::decode(&line) {
                        Ok(decoded) => response = decoded,
                        Err(_) => {
                            return self
                                .send_reply(
                                    Final,
                                    pc::TemporaryAuthenticationFailure,
                                    "Invalid base64 data",
                                )
                                .await;
                        },
                    }
                },
            }
        }

        if self.user.is_some() {
            info!("{} Authentication succeeded", self.log_prefix);
            self.envelope = Some(Envelope {
                from: None,
                to: Vec::new(),
            });
            self.send_reply(
                Final,
                pc::AuthenticationSucceeded,
                "Authentication succeeded",
            )
            .await?;
        }

        Ok(())
    }

    /// Reads one line of an AUTH exchange.
    ///
    /// If the transport ends mid-exchange, the exchange is abandoned without
    /// a reply.
    async fn read_auth_line(&mut self) -> Result<String, Error> {
        self.refresh_deadline();

        let mut buffer = Vec::new();
        (&mut self.io)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await?;

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF during AUTH exchange",
            )));
        }

        if !buffer.ends_with(b"\n") {
            self.send_reply(Final, pc::CommandSyntaxError, "Line too long")
                .await?;
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "Authentication line too long",
            )));
        }

        let _ = buffer.pop();
        if Some(&b'\r') == buffer.last() {
            let _ = buffer.pop();
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        let envelope = match self.envelope.take() {
            Some(envelope)
                if envelope.from.is_some() && !envelope.to.is_empty() =>
            {
                envelope
            },
            envelope => {
                self.envelope = envelope;
                return self
                    .send_reply(
                        Final,
                        pc::CommandNotImplemented,
                        "Missing RCPT TO command.",
                    )
                    .await;
            },
        };

        let Some(mut user) = self.user.take() else {
            // Unreachable while the envelope only exists for authenticated
            // sessions, but the reply keeps the protocol sensible if that
            // ever changes.
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Please authenticate first.",
                )
                .await;
        };

        // We have recipients, go to accept data
        self.send_reply(
            Final,
            pc::StartMailInput,
            "Go ahead. End your data with <CR><LF>.<CR><LF>",
        )
        .await?;

        info!("{} Begin data transfer", self.log_prefix);

        let limit = self.server.max_message_bytes;
        let deadline = self
            .server
            .max_idle
            .map(|idle| (self.deadline_tx.clone(), idle));
        let mut msg = Message {
            from: envelope.from.unwrap_or_default(),
            to: envelope.to,
            data: DataReader::new(&mut self.io, limit, deadline),
        };

        let result = user.send(&mut msg).await;

        // The data reader's validity ends with the delivery call; whatever
        // the backend left unread is discarded up to the terminator so the
        // next command is read from the right place.
        let Message {
            data: mut reader, ..
        } = msg;
        let drained = reader.drain().await;
        let overflowed = reader.overflowed();
        drop(reader);

        // The transaction always ends here; a fresh HELO and AUTH are
        // required for the next one.
        self.pause_deadline();
        user.logout().await;
        self.reset().await;

        if let Err(e) = drained {
            let _ = self
                .send_reply(
                    Final,
                    pc::TransactionFailed,
                    "Error: transaction failed, connection lost in \
                     message data",
                )
                .await;
            return Err(e.into());
        }

        if overflowed {
            info!("{} Rejected oversized message", self.log_prefix);
            return self
                .send_reply(
                    Final,
                    pc::ExceededStorageAllocation,
                    "Max message size exceeded",
                )
                .await;
        }

        match result {
            Ok(()) => {
                info!("{} Message accepted for delivery", self.log_prefix);
                self.send_reply(Final, pc::Ok, "Ok: queued").await
            },
            Err(DeliveryError::Rejected { code, text }) => {
                info!(
                    "{} Backend rejected message: {code} {text}",
                    self.log_prefix,
                );
                self.send_reply_raw(Final, code, &text).await
            },
            Err(e) => {
                warn!("{} Delivery failed: {e}", self.log_prefix);
                self.send_reply(
                    Final,
                    pc::TransactionFailed,
                    &format!(
                        "Error: transaction failed, blame it on the \
                         weather: {e}"
                    ),
                )
                .await
            },
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        self.reset().await;
        self.send_reply(Final, pc::Ok, "Session reset").await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.send_reply(Final, pc::Ok, "I have successfully done nothing")
            .await
    }

    async fn cmd_verify(&mut self) -> Result<(), Error> {
        self.send_reply(
            Final,
            pc::CannotVerify,
            "Cannot VRFY user, but will accept message",
        )
        .await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_reply(Final, pc::ServiceClosing, "Goodnight and good luck")
            .await;
        Ok(())
    }

    async fn cmd_unimplemented(&mut self, verb: &str) -> Result<(), Error> {
        self.send_reply(
            Final,
            pc::CommandNotImplemented,
            &format!("{verb} command not implemented"),
        )
        .await
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        if self.io.get_ref().get_ref().is_ssl() {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "Already running in TLS",
                )
                .await;
        }

        let Some(acceptor) = self.server.tls.clone() else {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    "TLS not supported",
                )
                .await;
        };

        self.send_reply(Final, pc::ServiceReady, "Ready to start TLS")
            .await?;

        info!("{} Start TLS handshake", self.log_prefix);

        if let Err(e) = self.io.get_ref().get_ref().ssl_accept(&acceptor).await
        {
            warn!("{} TLS handshake failed: {e}", self.log_prefix);
            let _ = self
                .send_reply(
                    Final,
                    pc::ActionNotTakenPermanent,
                    "Handshake error",
                )
                .await;
            return Err(e);
        }

        info!(
            "{} TLS handshake completed ({})",
            self.log_prefix,
            self.io
                .get_ref()
                .get_ref()
                .ssl_string()
                .unwrap_or_default(),
        );

        // Rebuild the buffered reader/writer atop the encrypted transport,
        // discarding anything buffered from the cleartext phase, and require
        // a fresh HELO.
        let tee = self.io.get_ref().clone();
        self.io = BufStream::new(tee);
        self.reset().await;

        Ok(())
    }

    /// Forgets the session identity and any transaction in progress.
    async fn reset(&mut self) {
        if let Some(mut user) = self.user.take() {
            self.pause_deadline();
            user.logout().await;
        }

        self.helo = None;
        self.envelope = None;
        self.log_prefix.clear_identity();
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        let greeting = format!("{} ESMTP Service Ready", self.server.domain);
        self.send_reply(Final, pc::ServiceReady, &greeting).await
    }

    async fn send_reply(
        &mut self,
        kind: ResponseKind,
        code: PrimaryCode,
        text: &str,
    ) -> Result<(), Error> {
        self.send_reply_raw(kind, code as u16, text).await
    }

    async fn send_reply_raw(
        &mut self,
        kind: ResponseKind,
        code: u16,
        text: &str,
    ) -> Result<(), Error> {
        self.refresh_deadline();

        let mut s = String::new();
        let _ = write!(s, "{}{}{}\r\n", code, kind.indicator(), text);

        self.io.write_all(s.as_bytes()).await?;
        match kind {
            Final => self.io.flush().await?,
            Delayable => (),
        }

        Ok(())
    }

    /// Pushes the idle deadline forward. Called before every read and as
    /// part of every reply.
    fn refresh_deadline(&self) {
        if let Some(idle) = self.server.max_idle {
            let _ = self.deadline_tx.send(Some(Instant::now() + idle));
        }
    }

    /// Disarms the idle deadline while the engine waits on the backend.
    fn pause_deadline(&self) {
        let _ = self.deadline_tx.send(None);
    }
}

// Runs until the current deadline expires. Used to force-close idle
// connections. `None` on the channel disarms the deadline entirely, which
// happens while a delivery is pending in the backend; the engine imposes no
// timeout there.
async fn idle_timer(
    mut deadline_rx: watch::Receiver<Option<Instant>>,
    idle: Duration,
) {
    let mut deadline = Some(Instant::now() + idle);

    loop {
        let changed = match deadline {
            Some(d) => {
                match tokio::time::timeout_at(d.into(), deadline_rx.changed())
                    .await
                {
                    Err(_) => return, // Timed out
                    Ok(changed) => changed,
                }
            },
            None => deadline_rx.changed().await,
        };

        if changed.is_err() {
            // Sender dropped; the connection is gone.
            return;
        }

        deadline = *deadline_rx.borrow_and_update();
    }
}
