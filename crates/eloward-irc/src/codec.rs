//! Tokio codecs for newline-framed IRC streams.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::message::Message;

/// Line-based codec handling `\r\n`-terminated (or bare `\n`) messages.
///
/// The default limit of 512 bytes matches the classic IRC line length;
/// servers that attach message tags need a larger limit via
/// [`LineCodec::with_max_len`].
pub struct LineCodec {
    /// Index of the next byte to check for a newline.
    next_index: usize,
    max_len: usize,
}

impl LineCodec {
    pub fn new() -> LineCodec {
        LineCodec {
            next_index: 0,
            max_len: 512,
        }
    }

    pub fn with_max_len(max_len: usize) -> LineCodec {
        LineCodec {
            next_index: 0,
            max_len,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;
            if line.len() > self.max_len {
                return Err(ProtocolError::LineTooLong {
                    len: line.len(),
                    max: self.max_len,
                });
            }
            let text = String::from_utf8_lossy(&line);
            Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
        } else {
            if src.len() > self.max_len {
                // Discard the oversized partial line so the stream can make
                // progress; the tail up to the next newline will fail to
                // parse and be skipped.
                let len = src.len();
                src.clear();
                self.next_index = 0;
                return Err(ProtocolError::LineTooLong {
                    len,
                    max: self.max_len,
                });
            }
            self.next_index = src.len();
            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        if !line.ends_with('\n') {
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

/// Codec that parses framed lines into [`Message`] values.
pub struct IrcCodec {
    inner: LineCodec,
}

impl IrcCodec {
    pub fn new() -> IrcCodec {
        IrcCodec {
            inner: LineCodec::new(),
        }
    }

    pub fn with_max_len(max_len: usize) -> IrcCodec {
        IrcCodec {
            inner: LineCodec::with_max_len(max_len),
        }
    }

    /// Sanitize an outgoing line: truncate at the first line ending and
    /// reject embedded control characters that would smuggle a second
    /// command onto the wire.
    pub fn sanitize(mut line: String) -> Result<String> {
        if let Some(pos) = line.find(['\r', '\n']) {
            line.truncate(pos);
        }
        if let Some(c) = line.chars().find(|c| *c == '\0') {
            return Err(ProtocolError::IllegalControlChar(c));
        }
        Ok(line)
    }
}

impl Default for IrcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.inner.decode(src)? {
                // Servers may send keepalive blank lines; skip them rather
                // than surfacing a parse error per empty frame.
                Some(line) if line.is_empty() => continue,
                Some(line) => return line.parse::<Message>().map(Some),
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let line = Self::sanitize(msg.to_string())?;
        self.inner.encode(line, dst)
    }
}
