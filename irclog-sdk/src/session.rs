//! A live IRC session: one connection, one identity.
//!
//! The session owns the [`ProtocolConnection`], an [`EventBus`] and a
//! [`TimerScheduler`], exposes the command API, and runs the cooperative
//! loop that ticks timers, checks liveness and services the socket.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use crate::channel::Channel;
use crate::connection::{ProtocolConnection, DEFAULT_MAX_PENDING};
use crate::error::{Error, Result};
use crate::event::{self, Event, EventBus, EventKind, Flow, Handler, HandlerResult};
use crate::irc::{reply, Message};
use crate::timer::TimerScheduler;
use crate::transport::{TlsMode, Transport, DEFAULT_TICK_TIMEOUT};

/// Timing and buffer limits for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Upper bound on the socket readiness wait per tick.
    pub io_timeout: Duration,
    /// Pause at the end of every run-loop iteration.
    pub loop_interval: Duration,
    /// Silence after which a keepalive PING is sent.
    pub keepalive_idle: Duration,
    /// How long an unanswered keepalive PING may stay outstanding.
    pub keepalive_timeout: Duration,
    /// Delay between sending QUIT and closing the socket.
    pub quit_grace: Duration,
    /// Cap on buffered bytes without a line delimiter.
    pub max_pending: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_TICK_TIMEOUT,
            loop_interval: Duration::from_millis(125),
            keepalive_idle: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(120),
            quit_grace: Duration::from_millis(500),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Resolving and opening the socket.
    Connecting,
    /// Socket open, NICK/USER sent, waiting for the welcome.
    Handshaking,
    /// Welcome or end-of-MOTD received.
    Registered,
}

pub struct Session {
    nick: String,
    user: String,
    realname: String,
    settings: SessionSettings,
    connection: Option<ProtocolConnection>,
    events: EventBus<Session>,
    timers: TimerScheduler<Session>,
    channels: Vec<Channel>,
    state: SessionState,
    running: bool,
    quitting: bool,
    last_data_received: Instant,
    last_ping_sent: Option<Instant>,
}

impl Session {
    pub fn new(nick: &str, user: &str, realname: &str) -> Self {
        Self::with_settings(nick, user, realname, SessionSettings::default())
    }

    pub fn with_settings(nick: &str, user: &str, realname: &str, settings: SessionSettings) -> Self {
        let mut session = Self {
            nick: nick.to_string(),
            user: user.to_string(),
            realname: realname.to_string(),
            settings,
            connection: None,
            events: EventBus::new(),
            timers: TimerScheduler::new(),
            channels: Vec::new(),
            state: SessionState::Disconnected,
            running: false,
            quitting: false,
            last_data_received: Instant::now(),
            last_ping_sent: None,
        };
        session.add_handler(EventKind::Recv, answer_ping);
        session.add_handler(EventKind::Recv, confirm_joins);
        session
    }

    pub fn current_nick(&self) -> &str {
        &self.nick
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == SessionState::Registered
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(ProtocolConnection::is_connected)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Channels joined on the current connection, confirmed or not.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    // ── Events and timers ───────────────────────────────────────────

    pub fn add_handler<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&mut Session, &Event) -> HandlerResult + 'static,
    {
        self.events.add_handler(kind, handler);
    }

    pub fn add_shared_handler(&mut self, kind: EventKind, handler: Handler<Session>) {
        self.events.add_shared(kind, handler);
    }

    /// Register a handler that runs before the built-in ones.
    pub fn prepend_handler<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&mut Session, &Event) -> HandlerResult + 'static,
    {
        self.events.prepend(kind, handler);
    }

    /// Dispatch `event` to the handlers registered when the call starts.
    pub fn emit(&mut self, event: &Event) -> HandlerResult {
        let handlers = self.events.handlers(event.kind());
        event::dispatch(&handlers, self, event)
    }

    pub fn call_in<F>(&mut self, delay: Duration, callback: F)
    where
        F: FnOnce(&mut Session) -> Result<()> + 'static,
    {
        self.timers.call_in(delay, callback);
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Open a connection and start registration. An unreachable server is
    /// not an error here; the first tick reports it as a closed connection.
    pub async fn connect(&mut self, host: &str, port: u16, tls: TlsMode) -> Result<()> {
        self.state = SessionState::Connecting;
        tracing::info!(%host, port, ?tls, nick = %self.nick, "Connecting");
        let transport = Transport::connect(host, port, tls).await;
        self.attach(transport)
    }

    /// Start a new connection over `transport` and send NICK/USER.
    pub fn attach(&mut self, transport: Transport) -> Result<()> {
        let connected = transport.is_connected();
        self.connection =
            Some(ProtocolConnection::new(transport).with_max_pending(self.settings.max_pending));
        for channel in self.channels.drain(..) {
            channel.reset();
        }
        self.state = if connected {
            SessionState::Handshaking
        } else {
            SessionState::Disconnected
        };
        self.running = true;
        self.quitting = false;
        self.last_data_received = Instant::now();
        self.last_ping_sent = None;

        self.nick(None)?;
        let user = format!("USER {} * * :{}", self.user, self.realname);
        self.send_raw(&user)
    }

    /// Close the socket immediately.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.disconnect();
        }
        self.state = SessionState::Disconnected;
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Emit `line` on the send event, then queue it on the socket.
    pub fn send_raw(&mut self, line: &str) -> Result<()> {
        self.emit(&Event::Send(line.to_string()))?;
        let queued = self.connection.as_mut().is_some_and(|c| c.send(line));
        if !queued {
            tracing::debug!(%line, "Not connected, command dropped");
        }
        Ok(())
    }

    /// Send NICK. With `Some`, the new nick becomes the session identity.
    pub fn nick(&mut self, nick: Option<&str>) -> Result<()> {
        if let Some(nick) = nick {
            self.nick = nick.to_string();
        }
        let line = format!("NICK {}", self.nick);
        self.send_raw(&line)
    }

    pub fn join(&mut self, channel: &str, key: Option<&str>) -> Result<Channel> {
        match key.filter(|k| !k.is_empty()) {
            Some(key) => self.send_raw(&format!("JOIN {channel} {key}"))?,
            None => self.send_raw(&format!("JOIN {channel}"))?,
        }
        if let Some(existing) = self.channels.iter().find(|c| c.matches(channel)) {
            return Ok(existing.clone());
        }
        let created = Channel::new(channel);
        self.channels.push(created.clone());
        Ok(created)
    }

    pub fn msg(&mut self, receiver: &str, text: &str) -> Result<()> {
        self.send_raw(&format!("PRIVMSG {receiver} :{text}"))
    }

    /// Send a liveness PING stamped with the current unix time.
    pub fn ping(&mut self) -> Result<()> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.send_raw(&format!("PING {stamp}"))?;
        self.last_ping_sent = Some(Instant::now());
        Ok(())
    }

    /// Send QUIT and close the socket after the grace delay, so the QUIT
    /// line can leave the send buffer first.
    pub fn quit(&mut self, message: Option<&str>) -> Result<()> {
        match message {
            Some(message) => self.send_raw(&format!("QUIT :{message}"))?,
            None => self.send_raw("QUIT")?,
        }
        self.quitting = true;
        self.call_in(self.settings.quit_grace, |session| {
            session.running = false;
            session.disconnect();
            Ok(())
        });
        Ok(())
    }

    // ── Receiving ───────────────────────────────────────────────────

    /// Deliver one parsed message to the recv handlers.
    pub fn received_message(&mut self, msg: Message) -> Result<()> {
        if self.state == SessionState::Handshaking
            && (msg.is(reply::RPL_WELCOME) || msg.is(reply::RPL_ENDOFMOTD))
        {
            self.state = SessionState::Registered;
            tracing::info!(nick = %self.nick, "Registered");
        }
        let result = self.emit(&Event::Recv(msg));
        self.last_data_received = Instant::now();
        result.map(|_| ())
    }

    /// Ping after `keepalive_idle` of silence; fail with [`Error::Timeout`]
    /// once a keepalive PING has been outstanding for `keepalive_timeout`.
    pub fn check_liveness(&mut self) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.last_data_received) < self.settings.keepalive_idle {
            return Ok(());
        }
        match self.last_ping_sent {
            Some(sent) if sent >= self.last_data_received => {
                if now.duration_since(sent) >= self.settings.keepalive_timeout {
                    tracing::warn!(nick = %self.nick, "Ping timeout");
                    return Err(Error::Timeout);
                }
                Ok(())
            }
            _ => {
                tracing::debug!("Connection idle, sending keepalive ping");
                self.ping()
            }
        }
    }

    // ── Run loop ────────────────────────────────────────────────────

    /// One loop iteration: fire due timers, check liveness, service the
    /// socket and dispatch whatever arrived, in arrival order.
    pub async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let watermark = self.timers.watermark();
        while let Some(callback) = self.timers.pop_due(now, watermark) {
            callback(self)?;
        }
        if !self.running {
            return Ok(());
        }
        self.check_liveness()?;

        let wait = self.io_wait();
        let connection = self.connection.as_mut().ok_or(Error::ConnectionClosed)?;
        let messages = match connection.tick(wait).await {
            Ok(messages) => messages,
            // Servers close the link in answer to QUIT, often before the
            // grace timer fires.
            Err(Error::ConnectionClosed) if self.quitting => {
                tracing::debug!("Link closed after QUIT");
                self.running = false;
                self.state = SessionState::Disconnected;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for msg in messages {
            self.received_message(msg)?;
        }
        Ok(())
    }

    /// Tick until the session stops or an error unwinds.
    ///
    /// Returns `Ok` only after a requested stop (see [`Session::quit`]).
    pub async fn run(&mut self) -> Result<()> {
        self.running = true;
        while self.running {
            if let Err(e) = self.tick().await {
                self.running = false;
                self.disconnect();
                return Err(e);
            }
            tokio::time::sleep(self.settings.loop_interval).await;
        }
        Ok(())
    }

    /// Never wait on the socket past the next timer deadline.
    fn io_wait(&self) -> Duration {
        let cap = self.settings.io_timeout;
        match self.timers.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(cap),
            None => cap,
        }
    }
}

/// Built-in: answer server PINGs. Never short-circuits.
fn answer_ping(session: &mut Session, event: &Event) -> HandlerResult {
    if let Event::Recv(msg) = event {
        if msg.command == "PING" {
            let pong = match msg.params.last() {
                Some(token) => format!("PONG :{token}"),
                None => "PONG".to_string(),
            };
            session.send_raw(&pong)?;
        }
    }
    Ok(Flow::Continue)
}

/// Built-in: an end-of-names reply confirms the matching pending channel,
/// or every pending channel if the reply names none.
fn confirm_joins(session: &mut Session, event: &Event) -> HandlerResult {
    let Event::Recv(msg) = event else {
        return Ok(Flow::Continue);
    };
    if !msg.is(reply::RPL_ENDOFNAMES) {
        return Ok(Flow::Continue);
    }

    // `<me> <channel> :text`; the short `<me> :text` form names no channel.
    let target = if msg.params.len() >= 3 {
        msg.params.get(1)
    } else {
        None
    };
    let confirmed: Vec<Channel> = session
        .channels
        .iter()
        .filter(|c| !c.is_joined() && target.map_or(true, |t| c.matches(t)))
        .cloned()
        .collect();
    for channel in confirmed {
        channel.mark_joined();
        tracing::info!(channel = channel.name(), "Joined");
        session.emit(&Event::Join(channel))?;
    }
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn record_sends(session: &mut Session) -> Rc<RefCell<Vec<String>>> {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let log = sent.clone();
        session.add_handler(EventKind::Send, move |_, event| {
            if let Event::Send(line) = event {
                log.borrow_mut().push(line.clone());
            }
            Ok(Flow::Continue)
        });
        sent
    }

    fn pings_sent(sent: &RefCell<Vec<String>>) -> usize {
        sent.borrow().iter().filter(|l| l.starts_with("PING ")).count()
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_once_then_times_out() {
        let mut session = Session::new("me", "me", "Me");
        let sent = record_sends(&mut session);

        tokio::time::advance(Duration::from_secs(19)).await;
        session.check_liveness().unwrap();
        assert_eq!(pings_sent(&sent), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        session.check_liveness().unwrap();
        assert_eq!(pings_sent(&sent), 1);

        tokio::time::advance(Duration::from_secs(119)).await;
        session.check_liveness().unwrap();
        assert_eq!(pings_sent(&sent), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let err = session.check_liveness().unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(pings_sent(&sent), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn received_data_clears_outstanding_ping() {
        let mut session = Session::new("me", "me", "Me");
        let sent = record_sends(&mut session);

        tokio::time::advance(Duration::from_secs(20)).await;
        session.check_liveness().unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        session
            .received_message(Message::parse(":srv PONG srv :1700000000"))
            .unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        session.check_liveness().unwrap();
        assert_eq!(pings_sent(&sent), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        session.check_liveness().unwrap();
        assert_eq!(pings_sent(&sent), 2);
    }

    #[test]
    fn prepended_handler_can_claim_a_ping() {
        let mut session = Session::new("me", "me", "Me");
        let sent = record_sends(&mut session);
        session.prepend_handler(EventKind::Recv, |_, event| match event {
            Event::Recv(msg) if msg.command == "PING" => Ok(Flow::Handled),
            _ => Ok(Flow::Continue),
        });
        session
            .received_message(Message::parse("PING :irc.example.net"))
            .unwrap();
        assert!(sent.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_scheduled_by_a_timer_waits_for_next_tick() {
        let mut session = Session::new("me", "me", "Me");
        let sent = record_sends(&mut session);
        session.call_in(Duration::ZERO, |session| {
            session.msg("#c", "outer")?;
            session.call_in(Duration::ZERO, |session| session.msg("#c", "inner"));
            Ok(())
        });

        session.tick().await.unwrap();
        assert_eq!(sent.borrow().as_slice(), &["PRIVMSG #c :outer"]);
        session.tick().await.unwrap();
        assert_eq!(sent.borrow().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_timer_keeps_co_due_timers() {
        let mut session = Session::new("me", "me", "Me");
        let sent = record_sends(&mut session);
        session.call_in(Duration::from_secs(1), |_| Err(Error::Timeout));
        session.call_in(Duration::from_secs(1), |session| session.msg("#c", "rearm"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(session.tick().await, Err(Error::Timeout)));
        assert!(sent.borrow().is_empty());

        session.tick().await.unwrap();
        assert_eq!(sent.borrow().as_slice(), &["PRIVMSG #c :rearm"]);
    }

    #[test]
    fn server_ping_is_answered() {
        let mut session = Session::new("me", "me", "Me");
        let sent = record_sends(&mut session);
        session
            .received_message(Message::parse("PING :irc.example.net"))
            .unwrap();
        assert_eq!(sent.borrow().as_slice(), &["PONG :irc.example.net"]);
    }

    #[test]
    fn ping_answer_does_not_short_circuit() {
        let mut session = Session::new("me", "me", "Me");
        let seen = Rc::new(RefCell::new(0));
        let count = seen.clone();
        session.add_handler(EventKind::Recv, move |_, _| {
            *count.borrow_mut() += 1;
            Ok(Flow::Continue)
        });
        session.received_message(Message::parse("PING :x")).unwrap();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn command_formatting() {
        let mut session = Session::new("me", "me", "Me");
        let sent = record_sends(&mut session);

        session.nick(Some("other")).unwrap();
        session.nick(None).unwrap();
        session.join("#a", Some("key")).unwrap();
        session.join("#b", Some("")).unwrap();
        session.msg("bob", "hi there").unwrap();
        session.quit(Some("bye")).unwrap();
        session.quit(None).unwrap();

        assert_eq!(session.current_nick(), "other");
        assert_eq!(
            sent.borrow().as_slice(),
            &[
                "NICK other",
                "NICK other",
                "JOIN #a key",
                "JOIN #b",
                "PRIVMSG bob :hi there",
                "QUIT :bye",
                "QUIT",
            ]
        );
    }

    #[tokio::test]
    async fn attach_registers_identity() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut session = Session::new("me", "meuser", "Real Name");
        session.attach(Transport::from_stream(local)).unwrap();
        assert_eq!(session.state(), SessionState::Handshaking);

        session.tick().await.unwrap();
        let mut buf = [0u8; 128];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"NICK me\r\nUSER meuser * * :Real Name\r\n");
    }

    #[tokio::test]
    async fn welcome_moves_to_registered() {
        let (local, _remote) = tokio::io::duplex(4096);
        let mut session = Session::new("me", "me", "Me");
        session.attach(Transport::from_stream(local)).unwrap();

        session
            .received_message(Message::parse(":srv 001 me :Welcome"))
            .unwrap();
        assert!(session.is_registered());
    }

    #[tokio::test]
    async fn new_connection_resets_channels() {
        let mut session = Session::new("me", "me", "Me");
        let (first, _r1) = tokio::io::duplex(4096);
        session.attach(Transport::from_stream(first)).unwrap();
        let channel = session.join("#rust", None).unwrap();
        session
            .received_message(Message::parse(":srv 366 me #rust :End"))
            .unwrap();
        assert!(channel.is_joined());

        let (second, _r2) = tokio::io::duplex(4096);
        session.attach(Transport::from_stream(second)).unwrap();
        assert!(!channel.is_joined());
        assert!(session.channels().is_empty());
    }

    #[tokio::test]
    async fn run_fails_when_peer_closes() {
        let (local, remote) = tokio::io::duplex(4096);
        let mut session = Session::new("me", "me", "Me");
        session.attach(Transport::from_stream(local)).unwrap();
        session.tick().await.unwrap();
        drop(remote);

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn run_without_connection_fails() {
        let mut session = Session::new("me", "me", "Me");
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let (local, _remote) = tokio::io::duplex(4096);
        let mut session = Session::new("me", "me", "Me");
        session.attach(Transport::from_stream(local)).unwrap();

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn quit_flushes_then_stops() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut session = Session::new("me", "me", "Me");
        session.attach(Transport::from_stream(local)).unwrap();
        session.quit(Some("bye")).unwrap();

        session.run().await.unwrap();
        assert!(!session.is_running());
        assert!(!session.is_connected());

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(
            String::from_utf8(received).unwrap(),
            "NICK me\r\nUSER me * * :Me\r\nQUIT :bye\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn server_closing_after_quit_is_a_clean_stop() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut session = Session::new("me", "me", "Me");
        session.attach(Transport::from_stream(local)).unwrap();
        session.tick().await.unwrap();

        session.quit(None).unwrap();
        session.tick().await.unwrap();
        let mut buf = [0u8; 256];
        let n = remote.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).ends_with("QUIT\r\n"));
        drop(remote);

        session.run().await.unwrap();
        assert!(!session.is_running());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_from_the_run_loop() {
        let (local, _remote) = tokio::io::duplex(4096);
        let mut session = Session::new("me", "me", "Me");
        session.attach(Transport::from_stream(local)).unwrap();
        let sent = record_sends(&mut session);

        session.call_in(Duration::from_secs(1), |session| {
            session.msg("#c", "later")?;
            session.quit(None)
        });
        session.run().await.unwrap();
        assert_eq!(sent.borrow().as_slice(), &["PRIVMSG #c :later", "QUIT"]);
    }
}
