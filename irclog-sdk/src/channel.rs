//! Join tracking for a single channel.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::Error;
use crate::session::Session;

#[derive(Debug)]
struct ChannelState {
    name: String,
    joined: Cell<bool>,
}

/// Handle to a channel joined through [`Session::join`].
///
/// Cloning is cheap; all clones share the same join state. The session flips
/// the state when the server sends the end-of-names reply for this channel,
/// and resets it when a new connection starts.
#[derive(Debug, Clone)]
pub struct Channel {
    state: Rc<ChannelState>,
}

impl Channel {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            state: Rc::new(ChannelState {
                name: name.to_string(),
                joined: Cell::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// True once the server has confirmed the join.
    pub fn is_joined(&self) -> bool {
        self.state.joined.get()
    }

    /// Send `text` to the channel. Before the join is confirmed this does
    /// nothing and returns `Ok(false)`.
    pub fn msg(&self, session: &mut Session, text: &str) -> Result<bool, Error> {
        if !self.is_joined() {
            return Ok(false);
        }
        session.msg(self.name(), text)?;
        Ok(true)
    }

    /// Channel names compare case-insensitively.
    pub(crate) fn matches(&self, name: &str) -> bool {
        self.state.name.eq_ignore_ascii_case(name)
    }

    pub(crate) fn mark_joined(&self) {
        self.state.joined.set(true);
    }

    pub(crate) fn reset(&self) {
        self.state.joined.set(false);
    }
}
