//! Failover IRC client.
//!
//! This is the main entry point for SDK consumers. It builds one
//! [`Session`], then loops forever: pick the next server (round robin),
//! connect, run until the connection fails, back off, repeat. Nickname
//! collisions are resolved by rotating through the configured nicknames and
//! configured channels are joined once the server welcomes us.
//!
//! ## Interrupts
//!
//! [`Client::run`] stops on Ctrl-C. Before returning [`Error::Interrupted`]
//! every observer is flushed. The interrupt is never retried.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, Flow, HandlerResult};
use crate::irc::reply;
use crate::log::FlushRegistry;
use crate::session::{Session, SessionSettings};
use crate::transport::TlsMode;

/// One server to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A channel to join after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub key: Option<String>,
}

/// Configuration for the failover client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Nicknames in rotation order. The first one is tried first.
    pub nicknames: Vec<String>,
    /// Username (ident).
    pub username: String,
    /// Real name.
    pub realname: String,
    /// Servers in rotation order.
    pub servers: Vec<ServerEndpoint>,
    /// Channels joined on every successful registration.
    pub channels: Vec<ChannelSpec>,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
    /// Delay before retrying after a failed connection.
    pub backoff: Duration,
    /// Period of the automatic observer flush.
    pub flush_period: Duration,
    pub session: SessionSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nicknames: Vec::new(),
            username: "irclog".to_string(),
            realname: "irclog".to_string(),
            servers: Vec::new(),
            channels: Vec::new(),
            tls_insecure: false,
            backoff: Duration::from_secs(5),
            flush_period: Duration::from_secs(60),
            session: SessionSettings::default(),
        }
    }
}

/// An external consumer of session traffic, such as a protocol logger.
///
/// `observe` sees the raw command text on [`Event::Send`] and the parsed
/// message on [`Event::Recv`]. A failing observer is not retried; its
/// error unwinds like any other handler error.
pub trait Observer {
    fn observe(&self, session: &mut Session, event: &Event) -> HandlerResult;

    /// Write out anything buffered.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Which events an observer receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub send: bool,
    pub recv: bool,
    /// Flush the observer periodically from the session timer.
    pub auto_flush: bool,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            send: true,
            recv: true,
            auto_flush: false,
        }
    }
}

struct Registration {
    observer: Rc<dyn Observer>,
    subscription: Subscription,
}

pub struct Client {
    config: ClientConfig,
    observers: Vec<Registration>,
    nick_index: Rc<Cell<usize>>,
    server_index: Option<usize>,
    connected: Rc<Cell<bool>>,
    running: bool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            observers: Vec::new(),
            nick_index: Rc::new(Cell::new(0)),
            server_index: None,
            connected: Rc::new(Cell::new(false)),
            running: false,
        }
    }

    pub fn add_nick(&mut self, nick: &str) {
        self.config.nicknames.push(nick.to_string());
    }

    pub fn add_server(&mut self, host: &str, port: u16, tls: bool) {
        self.config.servers.push(ServerEndpoint {
            host: host.to_string(),
            port,
            tls,
        });
    }

    pub fn add_channel(&mut self, name: &str, key: Option<&str>) {
        self.config.channels.push(ChannelSpec {
            name: name.to_string(),
            key: key.map(str::to_string),
        });
    }

    pub fn add_observer(&mut self, observer: Rc<dyn Observer>, subscription: Subscription) {
        self.observers.push(Registration {
            observer,
            subscription,
        });
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Index of the nickname currently in use.
    pub fn nick_index(&self) -> usize {
        self.nick_index.get()
    }

    /// True once the current connection has been welcomed.
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Build the session with the client's handlers installed. Nickname
    /// rotation runs ahead of everything, including the session built-ins;
    /// registration (auto-join) and then observers follow the built-ins.
    pub fn build_session(&self) -> Result<Session> {
        if self.config.nicknames.is_empty() {
            return Err(Error::Config("no nicknames configured".to_string()));
        }

        let nicknames = self.config.nicknames.clone();
        let first = &nicknames[self.nick_index.get() % nicknames.len()];
        let mut session = Session::with_settings(
            first,
            &self.config.username,
            &self.config.realname,
            self.config.session.clone(),
        );

        let index = self.nick_index.clone();
        session.prepend_handler(EventKind::Recv, move |session, event| {
            let Event::Recv(msg) = event else {
                return Ok(Flow::Continue);
            };
            if !msg.is(reply::ERR_NICKNAMEINUSE) {
                return Ok(Flow::Continue);
            }
            let next = (index.get() + 1) % nicknames.len();
            index.set(next);
            tracing::info!(nick = %nicknames[next], "Nickname in use, rotating");
            session.nick(Some(&nicknames[next]))?;
            Ok(Flow::Handled)
        });

        let connected = self.connected.clone();
        let channels = self.config.channels.clone();
        session.add_handler(EventKind::Recv, move |session, event| {
            let Event::Recv(msg) = event else {
                return Ok(Flow::Continue);
            };
            if connected.get() || !(msg.is(reply::RPL_WELCOME) || msg.is(reply::RPL_ENDOFMOTD)) {
                return Ok(Flow::Continue);
            }
            connected.set(true);
            for channel in &channels {
                session.join(&channel.name, channel.key.as_deref())?;
            }
            Ok(Flow::Continue)
        });

        for registration in &self.observers {
            let Subscription { send, recv, .. } = registration.subscription;
            for (kind, wanted) in [(EventKind::Send, send), (EventKind::Recv, recv)] {
                if wanted {
                    let observer = registration.observer.clone();
                    session.add_handler(kind, move |session, event| {
                        observer.observe(session, event)
                    });
                }
            }
        }

        Ok(session)
    }

    /// Flush every attached observer, logging failures.
    pub fn flush_observers(&self) {
        for registration in &self.observers {
            if let Err(e) = registration.observer.flush() {
                tracing::warn!(error = %e, "Observer flush failed");
            }
        }
    }

    /// Run until Ctrl-C or until the session quits.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `interrupt` completes or until the session quits.
    ///
    /// Connection faults are logged and retried against the next server
    /// after `backoff`. Completion of `interrupt` flushes the observers and
    /// returns [`Error::Interrupted`].
    pub async fn run_until<F>(&mut self, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.config.servers.is_empty() {
            return Err(Error::Config("no servers configured".to_string()));
        }
        let mut session = self.build_session()?;

        let mut registry = FlushRegistry::new(self.config.flush_period);
        for registration in &self.observers {
            if registration.subscription.auto_flush {
                registry.register(registration.observer.clone());
            }
        }
        FlushRegistry::arm(&Rc::new(registry), &mut session);

        tokio::pin!(interrupt);
        self.running = true;
        while self.running {
            let server = self.next_server();
            let tls = self.tls_mode(&server);
            self.connected.set(false);

            let attempt = async {
                session.connect(&server.host, server.port, tls).await?;
                session.run().await
            };
            let outcome = tokio::select! {
                result = attempt => result,
                () = &mut interrupt => Err(Error::Interrupted),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(%server, "Session ended");
                    self.running = false;
                }
                Err(e) if e.is_interrupt() => {
                    self.running = false;
                    self.flush_observers();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        %server,
                        error = %e,
                        delay_ms = self.config.backoff.as_millis() as u64,
                        "Connection failed, reconnecting"
                    );
                    let interrupted = tokio::select! {
                        () = tokio::time::sleep(self.config.backoff) => false,
                        () = &mut interrupt => true,
                    };
                    if interrupted {
                        self.running = false;
                        self.flush_observers();
                        return Err(Error::Interrupted);
                    }
                }
            }
        }
        Ok(())
    }

    fn next_server(&mut self) -> ServerEndpoint {
        let next = self
            .server_index
            .map_or(0, |i| (i + 1) % self.config.servers.len());
        self.server_index = Some(next);
        self.config.servers[next].clone()
    }

    fn tls_mode(&self, server: &ServerEndpoint) -> TlsMode {
        match (server.tls, self.config.tls_insecure) {
            (false, _) => TlsMode::Plain,
            (true, false) => TlsMode::Verified,
            (true, true) => TlsMode::Insecure,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::irc::Message;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
        flushes: Cell<usize>,
    }

    impl Observer for Recorder {
        fn observe(&self, _session: &mut Session, event: &Event) -> HandlerResult {
            let line = match event {
                Event::Send(line) => format!("> {line}"),
                Event::Recv(msg) => format!("< {}", msg.raw),
                Event::Join(channel) => format!("= {}", channel.name()),
            };
            self.events.borrow_mut().push(line);
            Ok(Flow::Continue)
        }

        fn flush(&self) -> Result<()> {
            self.flushes.set(self.flushes.get() + 1);
            Ok(())
        }
    }

    fn client(nicks: &[&str]) -> Client {
        let mut client = Client::new(ClientConfig::default());
        for nick in nicks {
            client.add_nick(nick);
        }
        client
    }

    #[test]
    fn nickname_rotation_wraps() {
        let mut client = client(&["a", "b", "c"]);
        let recorder = Rc::new(Recorder::default());
        client.add_observer(recorder.clone(), Subscription::default());
        let mut session = client.build_session().unwrap();
        assert_eq!(session.current_nick(), "a");

        let in_use = Message::parse(":srv 433 * a :Nickname is already in use");
        let mut seen = Vec::new();
        for _ in 0..3 {
            session.received_message(in_use.clone()).unwrap();
            seen.push(client.nick_index());
        }
        assert_eq!(seen, vec![1, 2, 0]);
        assert_eq!(session.current_nick(), "a");
        assert_eq!(
            recorder.events.borrow().as_slice(),
            &["> NICK b", "> NICK c", "> NICK a"]
        );
    }

    #[test]
    fn collision_reply_is_not_seen_by_observers() {
        let mut client = client(&["a", "b"]);
        let recorder = Rc::new(Recorder::default());
        client.add_observer(
            recorder.clone(),
            Subscription {
                send: false,
                ..Subscription::default()
            },
        );
        let mut session = client.build_session().unwrap();

        session
            .received_message(Message::parse(":srv 433 * a :in use"))
            .unwrap();
        session
            .received_message(Message::parse(":srv NOTICE * :hello"))
            .unwrap();
        assert_eq!(recorder.events.borrow().as_slice(), &["< :srv NOTICE * :hello"]);
    }

    #[test]
    fn welcome_joins_channels_once() {
        let mut client = client(&["a"]);
        client.add_channel("#one", None);
        client.add_channel("#two", Some("key"));
        let recorder = Rc::new(Recorder::default());
        client.add_observer(
            recorder.clone(),
            Subscription {
                recv: false,
                ..Subscription::default()
            },
        );
        let mut session = client.build_session().unwrap();
        assert!(!client.is_connected());

        session
            .received_message(Message::parse(":srv 001 a :Welcome"))
            .unwrap();
        session
            .received_message(Message::parse(":srv 376 a :End of MOTD"))
            .unwrap();

        assert!(client.is_connected());
        assert_eq!(
            recorder.events.borrow().as_slice(),
            &["> JOIN #one", "> JOIN #two key"]
        );
        assert_eq!(session.channels().len(), 2);
    }

    #[test]
    fn build_requires_a_nickname() {
        let client = client(&[]);
        assert!(matches!(client.build_session(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn run_requires_a_server() {
        let mut client = client(&["a"]);
        let err = client.run_until(async {}).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn servers_rotate_round_robin() {
        let mut client = client(&["a"]);
        client.add_server("one", 6667, false);
        client.add_server("two", 6697, true);

        let order: Vec<String> = (0..3).map(|_| client.next_server().host).collect();
        assert_eq!(order, vec!["one", "two", "one"]);
    }

    #[test]
    fn tls_mode_follows_config() {
        let mut client = client(&["a"]);
        let plain = ServerEndpoint {
            host: "h".into(),
            port: 6667,
            tls: false,
        };
        let secure = ServerEndpoint {
            tls: true,
            ..plain.clone()
        };
        assert_eq!(client.tls_mode(&plain), TlsMode::Plain);
        assert_eq!(client.tls_mode(&secure), TlsMode::Verified);
        client.config.tls_insecure = true;
        assert_eq!(client.tls_mode(&secure), TlsMode::Insecure);
    }

    #[tokio::test]
    async fn interrupt_flushes_observers() {
        let mut client = client(&["a"]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        client.add_server("127.0.0.1", port, false);
        let recorder = Rc::new(Recorder::default());
        client.add_observer(recorder.clone(), Subscription::default());

        let err = client
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_interrupt());
        assert_eq!(recorder.flushes.get(), 1);
        assert!(!client.is_running());
    }
}
