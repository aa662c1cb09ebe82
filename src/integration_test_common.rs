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

use std::io::{self, BufRead, Read, Write};
use std::mem;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use tokio::io::AsyncReadExt;

use crate::backend::{AuthError, Backend, DeliveryError, Message, User};
use crate::server::Server;
use crate::support::error::Error;

lazy_static! {
    static ref CERTIFICATE_PRIVATE_KEY: openssl::pkey::PKey<openssl::pkey::Private> =
        openssl::pkey::PKey::from_rsa(
            openssl::rsa::Rsa::generate(2048).unwrap()
        )
        .unwrap();
    static ref CERTIFICATE: openssl::x509::X509 = {
        let mut builder = openssl::x509::X509Builder::new().unwrap();
        builder.set_pubkey(&CERTIFICATE_PRIVATE_KEY).unwrap();
        builder
            .sign(
                &CERTIFICATE_PRIVATE_KEY,
                openssl::hash::MessageDigest::sha256(),
            )
            .unwrap();
        builder.set_version(2).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::from_unix(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(2).unwrap())
            .unwrap();
        builder.build()
    };
}

pub fn ssl_acceptor() -> SslAcceptor {
    let mut ssl_acceptor =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
    ssl_acceptor
        .set_private_key(&CERTIFICATE_PRIVATE_KEY)
        .unwrap();
    ssl_acceptor.set_certificate(&CERTIFICATE).unwrap();
    ssl_acceptor.build()
}

/// A message as the test backend received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMail {
    pub from: String,
    pub to: Vec<String>,
    pub body: Vec<u8>,
}

/// Backend accepting the account `username`/`password` and recording
/// everything sent through it.
#[derive(Default)]
pub struct TestBackend {
    delivered: Arc<Mutex<Vec<ReceivedMail>>>,
    /// When set, `send` fails with this code/text after consuming the body.
    pub reject: Option<(u16, String)>,
    /// When set, `send` reads only this many body bytes and returns,
    /// leaving the rest for the engine to drain.
    pub consume_only: Option<usize>,
}

impl TestBackend {
    pub fn new() -> (Self, Arc<Mutex<Vec<ReceivedMail>>>) {
        let backend = TestBackend::default();
        let delivered = Arc::clone(&backend.delivered);
        (backend, delivered)
    }
}

pub struct TestUser {
    delivered: Arc<Mutex<Vec<ReceivedMail>>>,
    reject: Option<(u16, String)>,
    consume_only: Option<usize>,
}

impl Backend for TestBackend {
    type User = TestUser;

    async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TestUser, AuthError> {
        if "username" == username && "password" == password {
            Ok(TestUser {
                delivered: Arc::clone(&self.delivered),
                reject: self.reject.clone(),
                consume_only: self.consume_only,
            })
        } else {
            Err(AuthError::new("Invalid username or password"))
        }
    }
}

impl User for TestUser {
    async fn send(
        &mut self,
        msg: &mut Message<'_>,
    ) -> Result<(), DeliveryError> {
        let mut body = Vec::new();
        match self.consume_only {
            Some(n) => {
                body.resize(n, 0);
                msg.data.read_exact(&mut body).await?;
            },
            None => {
                msg.data.read_to_end(&mut body).await?;
            },
        }

        if let Some((code, text)) = self.reject.clone() {
            return Err(DeliveryError::Rejected { code, text });
        }

        self.delivered.lock().unwrap().push(ReceivedMail {
            from: msg.from.clone(),
            to: msg.to.clone(),
            body,
        });
        Ok(())
    }
}

/// Runs `server` against one end of a socket pair on its own thread and
/// returns a client for the other end.
pub fn spawn_server(
    cxn_name: &'static str,
    server: Server<TestBackend>,
) -> SmtpClient {
    crate::init_test_log();

    let (client_io, server_io) = UnixStream::pair().unwrap();
    std::thread::spawn(move || run_server(cxn_name, server, server_io));
    SmtpClient::new(cxn_name, client_io)
}

/// Binds a TCP listener on localhost, runs `server` on it in its own
/// thread, and returns the bound address.
pub fn spawn_tcp_server(server: Server<TestBackend>) -> std::net::SocketAddr {
    crate::init_test_log();

    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || run_tcp_server(server, addr_tx));
    addr_rx.recv().unwrap()
}

#[tokio::main(flavor = "current_thread")]
async fn run_tcp_server(
    server: Server<TestBackend>,
    addr_tx: std::sync::mpsc::Sender<std::net::SocketAddr>,
) {
    let listener =
        tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    addr_tx.send(listener.local_addr().unwrap()).unwrap();
    let _ = server.serve(listener).await;
}

#[tokio::main(flavor = "current_thread")]
async fn run_server(
    cxn_name: &'static str,
    server: Server<TestBackend>,
    server_io: UnixStream,
) {
    let result = Arc::new(server).handle(server_io, cxn_name).await;
    match result {
        Ok(()) => (),
        Err(Error::Io(e))
            if io::ErrorKind::UnexpectedEof == e.kind()
                || io::ErrorKind::TimedOut == e.kind()
                || io::ErrorKind::BrokenPipe == e.kind()
                || Some(nix::libc::EPIPE) == e.raw_os_error() =>
        {
            ()
        },
        Err(e) => panic!("Unexpected server error: {e} {e:?}"),
    }
}

pub trait ReadWrite: Read + Write {}
impl<T: Read + Write + ?Sized> ReadWrite for T {}

pub struct SmtpClient {
    name: &'static str,
    io: Box<dyn ReadWrite>,
}

impl SmtpClient {
    pub fn new(name: &'static str, io: impl ReadWrite + 'static) -> Self {
        Self {
            name,
            io: Box::new(io),
        }
    }

    /// Read responses from the server up to and including the final
    /// response.
    ///
    /// This creates a `BufReader` over `io` and will lose any data which was
    /// buffered after the last read line. This should be fine since we don't
    /// read pipelined responses through it.
    pub fn read_responses(&mut self) -> Vec<String> {
        let mut ret = Vec::<String>::new();
        let mut r = io::BufReader::new(&mut self.io);

        loop {
            let mut line = String::new();
            r.read_line(&mut line).unwrap();
            println!("[{}] >> {:?}", self.name, line);

            if line.is_empty() {
                panic!("Unexpected EOF");
            }

            let last = " " == &line[3..4];
            ret.push(line);

            if last {
                break;
            }
        }

        ret
    }

    /// Reads the responses to `count` pipelined commands through a single
    /// buffered reader, returning the final line of each.
    pub fn read_pipelined_responses(&mut self, count: usize) -> Vec<String> {
        let mut ret = Vec::<String>::new();
        let mut r = io::BufReader::new(&mut self.io);

        while ret.len() < count {
            let mut line = String::new();
            r.read_line(&mut line).unwrap();
            println!("[{}] >> {:?}", self.name, line);

            if line.is_empty() {
                panic!("Unexpected EOF");
            }

            if " " == &line[3..4] {
                ret.push(line);
            }
        }

        ret
    }

    /// Writes the given complete line to the server.
    pub fn write_line(&mut self, s: &str) {
        assert!(s.ends_with('\n'));
        for line in s.split_inclusive('\n') {
            println!("[{}] << {:?}", self.name, line);
        }
        self.io.write_all(s.as_bytes()).unwrap();
    }

    /// Writes the given raw data to the server.
    pub fn write_raw(&mut self, data: &[u8]) {
        println!("[{}] << [{} bytes]", self.name, data.len());
        self.io.write_all(data).unwrap();
    }

    /// Send a command which is expected to have one response with the given
    /// prefix.
    pub fn simple_command(&mut self, command: &str, prefix: &str) {
        self.write_line(&format!("{}\r\n", command));
        let responses = self.read_responses();
        assert_eq!(1, responses.len());
        assert!(
            responses[0].starts_with(prefix),
            "expected {:?}, got {:?}",
            prefix,
            responses[0],
        );
    }

    /// Skip the server greeting, then send the given command and consume
    /// the responses. Assert that the command succeeds.
    pub fn skip_pleasantries(&mut self, cmd: &str) {
        self.read_responses();
        self.write_line(&format!("{}\r\n", cmd));
        let responses = self.read_responses();
        assert!(responses.last().unwrap().starts_with("250"));
    }

    /// Authenticate with AUTH PLAIN and an initial response.
    pub fn auth_plain(&mut self, username: &str, password: &str) {
        let auth = format!(
            "AUTH PLAIN {}",
            base64::encode(format!("\x00{username}\x00{password}")),
        );
        self.simple_command(&auth, "235 ");
    }

    /// Performs a TLS handshake on the connection.
    pub fn start_tls(&mut self) {
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        println!("[{}] <> Start TLS handshake", self.name);
        let cxn = mem::replace(&mut self.io, Box::new(io::empty()));
        let cxn = connector
            .build()
            .connect("localhost", cxn)
            .map_err(|_| "SSL handshake failed")
            .unwrap();
        println!("[{}] <> TLS handshake succeeded", self.name);
        self.io = Box::new(cxn);
    }

    /// Asserts that the server has hung up on us.
    pub fn expect_eof(&mut self) {
        let mut buf = [0u8; 1];
        match self.io.read(&mut buf) {
            Ok(0) | Err(_) => println!("[{}] >> EOF", self.name),
            Ok(_) => panic!("Expected EOF, got more data"),
        }
    }
}
