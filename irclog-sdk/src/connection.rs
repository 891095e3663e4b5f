//! Line framing on top of a [`Transport`].
//!
//! Each tick consumes the incoming buffer up to and including the *last*
//! `\r\n`; any partial line after it stays buffered for the next tick.

use std::time::Duration;

use crate::error::{DecodeError, Error};
use crate::irc::{Decoder, Message};
use crate::transport::Transport;

/// Line delimiter on the wire.
pub const EOL: &[u8] = b"\r\n";

/// Default cap on buffered bytes that do not yet form a complete line.
pub const DEFAULT_MAX_PENDING: usize = 64 * 1024;

/// Called with every line that could not be decoded. The line is skipped.
pub type FaultHook = Box<dyn FnMut(&DecodeError)>;

pub struct ProtocolConnection {
    transport: Transport,
    decoder: Decoder,
    fault_hook: FaultHook,
    max_pending: usize,
}

impl ProtocolConnection {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            decoder: Decoder::default(),
            fault_hook: Box::new(|e: &DecodeError| {
                tracing::warn!(error = %e, "Skipping undecodable line");
            }),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = hook;
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Queue one command line. The delimiter is appended here.
    pub fn send(&mut self, line: &str) -> bool {
        let mut data = Vec::with_capacity(line.len() + EOL.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(EOL);
        self.transport.send(&data)
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    /// Service the socket once and return every complete message received,
    /// in arrival order.
    ///
    /// Fails with [`Error::ConnectionClosed`] once the transport has lost its
    /// socket; that is how the session learns the link is gone.
    pub async fn tick(&mut self, timeout: Duration) -> Result<Vec<Message>, Error> {
        if !self.transport.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        self.transport.tick(timeout).await?;
        self.drain_messages()
    }

    fn drain_messages(&mut self) -> Result<Vec<Message>, Error> {
        let buf = self.transport.peek();
        let Some(end) = rfind(buf, EOL) else {
            if buf.len() > self.max_pending {
                return Err(Error::LineTooLong {
                    limit: self.max_pending,
                });
            }
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        for line in split(&buf[..end], EOL).filter(|line| !line.is_empty()) {
            match self.decoder.decode(line) {
                Ok(text) => messages.push(Message::parse(&text)),
                Err(e) => (self.fault_hook)(&e),
            }
        }
        self.transport.discard(end + EOL.len());

        if self.transport.peek().len() > self.max_pending {
            return Err(Error::LineTooLong {
                limit: self.max_pending,
            });
        }
        Ok(messages)
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn split<'a>(mut data: &'a [u8], delim: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        match data.windows(delim.len()).position(|w| w == delim) {
            Some(pos) => {
                let line = &data[..pos];
                data = &data[pos + delim.len()..];
                Some(line)
            }
            None => {
                done = true;
                Some(data)
            }
        }
    })
}
