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

use std::io::{self, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::support::async_io::ServerIo;

/// A sink observing a copy of all bytes a connection reads and writes.
///
/// The sink is shared by every connection of a server, so it must tolerate
/// interleaved appends; each observed chunk is delivered with a single
/// `write_all` call.
pub type DebugSink = Arc<Mutex<dyn Write + Send>>;

/// Decorates the connection transport with an optional debug tee.
///
/// Bytes are observed after decryption on the way in and before encryption
/// on the way out, so the sink always sees the SMTP dialogue in the clear.
/// Errors from the sink are discarded; debugging must not break the session.
#[derive(Clone)]
pub struct TeeIo {
    inner: ServerIo,
    sink: Option<DebugSink>,
}

impl TeeIo {
    pub fn new(inner: ServerIo, sink: Option<DebugSink>) -> Self {
        Self { inner, sink }
    }

    pub fn get_ref(&self) -> &ServerIo {
        &self.inner
    }

    fn observe(&self, data: &[u8]) {
        if let Some(ref sink) = self.sink {
            if !data.is_empty() {
                let _ = sink.lock().unwrap().write_all(data);
            }
        }
    }
}

impl AsyncRead for TeeIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        let already_filled = buf.filled().len();
        futures::ready!(Pin::new(&mut this.inner).poll_read(ctx, buf))?;
        this.observe(&buf.filled()[already_filled..]);
        task::Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TeeIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = futures::ready!(Pin::new(&mut this.inner).poll_write(ctx, buf))?;
        this.observe(&buf[..n]);
        task::Poll::Ready(Ok(n))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(ctx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(ctx)
    }
}
