//! Events emitted by a session and the publish/subscribe bus that delivers them.

use std::collections::HashMap;
use std::rc::Rc;

use crate::channel::Channel;
use crate::error::Error;
use crate::irc::Message;

/// Events that a session emits to its handlers (built-ins, client, observers).
#[derive(Debug, Clone)]
pub enum Event {
    /// A command was submitted for sending. Carries the raw line without
    /// delimiter; fires before the bytes reach the socket.
    Send(String),

    /// A message arrived from the server.
    Recv(Message),

    /// The server confirmed a channel join.
    Join(Channel),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Send(_) => EventKind::Send,
            Event::Recv(_) => EventKind::Recv,
            Event::Join(_) => EventKind::Join,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Send,
    Recv,
    Join,
}

/// What a handler wants to happen to the rest of the emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Let later handlers see the event too.
    Continue,
    /// Stop here; later handlers are skipped for this emission.
    Handled,
}

pub type HandlerResult = Result<Flow, Error>;

/// A registered handler. `S` is the context handed to every handler,
/// normally the [`Session`](crate::session::Session).
pub type Handler<S> = Rc<dyn Fn(&mut S, &Event) -> HandlerResult>;

/// Ordered publish/subscribe registry keyed by [`EventKind`].
pub struct EventBus<S> {
    handlers: HashMap<EventKind, Vec<Handler<S>>>,
}

impl<S> Default for EventBus<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> EventBus<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `kind`. Registration order is dispatch order.
    pub fn add_handler<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&mut S, &Event) -> HandlerResult + 'static,
    {
        self.add_shared(kind, Rc::new(handler));
    }

    pub fn add_shared(&mut self, kind: EventKind, handler: Handler<S>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Insert a handler ahead of every handler already registered for `kind`.
    pub fn prepend<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&mut S, &Event) -> HandlerResult + 'static,
    {
        self.handlers.entry(kind).or_default().insert(0, Rc::new(handler));
    }

    /// Snapshot of the handlers currently registered for `kind`.
    pub fn handlers(&self, kind: EventKind) -> Vec<Handler<S>> {
        self.handlers.get(&kind).cloned().unwrap_or_default()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Emit to a context that does not own this bus.
    pub fn emit(&self, ctx: &mut S, event: &Event) -> HandlerResult {
        dispatch(&self.handlers(event.kind()), ctx, event)
    }
}

/// Run `handlers` in order until one returns [`Flow::Handled`] or fails.
///
/// Errors are not caught; they abort the emission and go to the caller.
pub fn dispatch<S>(handlers: &[Handler<S>], ctx: &mut S, event: &Event) -> HandlerResult {
    for handler in handlers {
        if handler(ctx, event)? == Flow::Handled {
            return Ok(Flow::Handled);
        }
    }
    Ok(Flow::Continue)
}
