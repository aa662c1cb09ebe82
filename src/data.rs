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

use std::io;
use std::mem;
use std::pin::Pin;
use std::task;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};
use tokio::sync::watch;

/// Streams the payload of a DATA command out of the command stream.
///
/// The payload runs until a line which is just `.`; that line is consumed
/// but not part of the content. If a line which is not `.` begins with `.`,
/// the first `.` on the line is removed. The CRLF before the final `.` line
/// is part of the content.
///
/// To be binary-safe, CRLFs are handled strictly, and a bare LF is not
/// treated as a line ending. E.g., the sequence `\n.\n` may occur by itself
/// in the input and should be part of the message.
///
/// The reader is handed to the backend for the duration of delivery; the
/// engine drains whatever the backend leaves unread afterwards so that the
/// next command is read from the right place.
pub struct DataReader<'a> {
    io: &'a mut (dyn AsyncBufRead + Unpin + Send),
    /// Maximum content size to accept, after unstuffing. Zero means
    /// unlimited.
    limit: u64,
    seen: u64,
    /// Raw line being accumulated from the transport, possibly across
    /// several polls.
    raw: Vec<u8>,
    /// Unstuffed content of the last complete line, being handed out from
    /// `pos` onwards.
    line: Vec<u8>,
    pos: usize,
    /// Whether the next line starts at the beginning of a line; i.e., true
    /// at the beginning of the payload and after each CRLF.
    start_of_line: bool,
    /// Whether the last line ended with CR. This means that if the next
    /// line is just `\n`, we still treat it as a line ending.
    has_trailing_cr: bool,
    finished: bool,
    overflowed: bool,
    deadline: Option<(watch::Sender<Option<Instant>>, Duration)>,
}

impl<'a> DataReader<'a> {
    pub(crate) fn new(
        io: &'a mut (dyn AsyncBufRead + Unpin + Send),
        limit: u64,
        deadline: Option<(watch::Sender<Option<Instant>>, Duration)>,
    ) -> Self {
        Self {
            io,
            limit,
            seen: 0,
            raw: Vec::new(),
            line: Vec::new(),
            pos: 0,
            start_of_line: true,
            has_trailing_cr: false,
            finished: false,
            overflowed: false,
            deadline,
        }
    }

    /// Whether the terminating `.` line has been consumed.
    pub(crate) fn finished(&self) -> bool {
        self.finished
    }

    /// Whether the content exceeded the size limit.
    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Consumes and discards payload up to and including the terminator.
    ///
    /// Called by the engine after delivery returns so that pipelined
    /// commands behind the payload stay aligned. Fails only if the
    /// transport ends before the terminator.
    pub(crate) async fn drain(&mut self) -> io::Result<()> {
        std::future::poll_fn(|ctx| {
            loop {
                if self.finished {
                    return task::Poll::Ready(Ok(()));
                }

                self.line.clear();
                self.pos = 0;
                futures::ready!(self.poll_next_line(ctx))?;
            }
        })
        .await
    }

    /// Reads the next raw line (through its `\n`) and processes it into
    /// `line`.
    fn poll_next_line(
        &mut self,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        loop {
            let buffer =
                futures::ready!(Pin::new(&mut *self.io).poll_fill_buf(ctx))?;
            if buffer.is_empty() {
                return task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF encountered in DATA payload",
                )));
            }

            match memchr::memchr(b'\n', buffer) {
                Some(eol) => {
                    self.raw.extend_from_slice(&buffer[..=eol]);
                    Pin::new(&mut *self.io).consume(eol + 1);
                    break;
                },
                None => {
                    self.raw.extend_from_slice(buffer);
                    let len = buffer.len();
                    Pin::new(&mut *self.io).consume(len);
                },
            }
        }

        if let Some((ref tx, idle)) = self.deadline {
            let _ = tx.send(Some(Instant::now() + idle));
        }

        self.process_line();

        // The payload is complete; disarm the idle deadline so a slow
        // backend is not cut off mid-delivery.
        if self.finished {
            if let Some((ref tx, _)) = self.deadline {
                let _ = tx.send(None);
            }
        }

        task::Poll::Ready(Ok(()))
    }

    fn process_line(&mut self) {
        let raw = mem::take(&mut self.raw);
        self.line.clear();
        self.pos = 0;

        if self.start_of_line && b".\r\n" == &raw[..] {
            // End of content
            self.finished = true;
            return;
        }

        // Everything in the line is content, except possibly a leading '.'.
        let content = if self.start_of_line && raw.starts_with(b".") {
            &raw[1..]
        } else {
            &raw[..]
        };

        self.start_of_line = raw.ends_with(b"\r\n")
            || (b"\n" == &raw[..] && self.has_trailing_cr);
        self.has_trailing_cr = raw.ends_with(b"\r");

        if !self.overflowed {
            self.seen += content.len() as u64;
            if self.limit > 0 && self.seen > self.limit {
                self.overflowed = true;
            } else {
                self.line.extend_from_slice(content);
            }
        }
    }
}

impl AsyncRead for DataReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.line.len() {
                let n = (this.line.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.line[this.pos..this.pos + n]);
                this.pos += n;
                return task::Poll::Ready(Ok(()));
            }

            if this.finished {
                return task::Poll::Ready(Ok(()));
            }

            if this.overflowed {
                return task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "maximum message size exceeded",
                )));
            }

            futures::ready!(this.poll_next_line(ctx))?;
        }
    }
}

#[cfg(test)]
mod test {
    use std::str;

    use proptest::prelude::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};

    use super::*;

    fn decode_with_limit(
        stuffed: &[u8],
        buffer_size: usize,
        limit: u64,
    ) -> io::Result<Vec<u8>> {
        let mut reader =
            tokio::io::BufReader::with_capacity(buffer_size, stuffed);
        let mut data = DataReader::new(&mut reader, limit, None);
        let mut decoded = Vec::new();
        futures::executor::block_on(data.read_to_end(&mut decoded))?;
        Ok(decoded)
    }

    fn decode(stuffed: &[u8], buffer_size: usize) -> Vec<u8> {
        decode_with_limit(stuffed, buffer_size, 0).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 4096,
            ..ProptestConfig::default()
        })]

        #[test]
        fn dot_stuffing_decodes_properly(
            content in "[x.\r\n]{0,100}\r\n",
            buffer_size in 1usize..=32,
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with('.') {
                stuffed = format!(".{}", stuffed);
            }
            stuffed.push_str(".\r\n");

            let decoded = decode(stuffed.as_bytes(), buffer_size);
            assert_eq!(content, str::from_utf8(&decoded).unwrap());
        }
    }

    #[test]
    fn empty_payload() {
        assert_eq!(b"".to_vec(), decode(b".\r\n", 16));
    }

    #[test]
    fn leading_dot_unstuffed() {
        assert_eq!(b".foo\r\n".to_vec(), decode(b"..foo\r\n.\r\n", 16));
    }

    #[test]
    fn interior_dot_kept_verbatim() {
        assert_eq!(
            b"foo . bar\r\n".to_vec(),
            decode(b"foo . bar\r\n.\r\n", 16)
        );
    }

    #[test]
    fn bare_line_endings_do_not_terminate() {
        // "\n.\n" is not a terminator; only CRLF counts.
        assert_eq!(b"x\n.x\r\n".to_vec(), decode(b"x\n.x\r\n.\r\n", 4));
    }

    #[test]
    fn eof_before_terminator() {
        let mut reader = tokio::io::BufReader::new(&b"foo\r\n"[..]);
        let mut data = DataReader::new(&mut reader, 0, None);
        let mut decoded = Vec::new();
        let err =
            futures::executor::block_on(data.read_to_end(&mut decoded))
                .unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
        assert!(!data.finished());
    }

    #[test]
    fn oversize_payload_is_bounded() {
        let mut reader =
            tokio::io::BufReader::new(&b"hello world\r\nmore\r\n.\r\nNOOP\r\n"[..]);
        let mut data = DataReader::new(&mut reader, 5, None);
        let mut decoded = Vec::new();
        let err =
            futures::executor::block_on(data.read_to_end(&mut decoded))
                .unwrap_err();
        assert_eq!(io::ErrorKind::Other, err.kind());
        assert!(data.overflowed());

        // Draining still finds the terminator and leaves the command
        // stream aligned.
        futures::executor::block_on(data.drain()).unwrap();
        assert!(data.finished());

        let mut rest = String::new();
        futures::executor::block_on(reader.read_line(&mut rest)).unwrap();
        assert_eq!("NOOP\r\n", rest);
    }

    #[test]
    fn drain_discards_unread_payload() {
        let mut reader = tokio::io::BufReader::new(
            &b"line one\r\nline two\r\n.\r\nQUIT\r\n"[..],
        );
        let mut data = DataReader::new(&mut reader, 0, None);
        let mut first = [0u8; 4];
        futures::executor::block_on(data.read_exact(&mut first)).unwrap();
        assert_eq!(b"line", &first);

        futures::executor::block_on(data.drain()).unwrap();
        assert!(data.finished());

        let mut rest = String::new();
        futures::executor::block_on(reader.read_line(&mut rest)).unwrap();
        assert_eq!("QUIT\r\n", rest);
    }
}
