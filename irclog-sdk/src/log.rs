//! Protocol loggers: line sinks, formats, and the periodic flush timer.
//!
//! A [`LogObserver`] formats session traffic with a [`LogFormat`] and hands
//! the lines to a [`Sink`]. Sinks buffer; nothing reaches the disk until the
//! buffer overflows or the observer is flushed, either by the
//! [`FlushRegistry`] timer or by the client on interrupt.

use std::cell::{Ref, RefCell};
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate};

use crate::client::Observer;
use crate::error::Result;
use crate::event::{Event, Flow, HandlerResult};
use crate::irc::Message;
use crate::session::Session;

/// Destination for formatted log lines.
pub trait Sink {
    fn append(&mut self, line: String) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Buffers lines in memory and writes them to `W` in batches.
///
/// The buffer is written out once it holds more than `max_lines` lines;
/// `0` writes every line immediately.
pub struct BufferedSink<W> {
    out: W,
    lines: Vec<String>,
    max_lines: usize,
}

impl<W: Write> BufferedSink<W> {
    pub fn new(out: W, max_lines: usize) -> Self {
        Self {
            out,
            lines: Vec::new(),
            max_lines,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    /// Lines waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.lines.len()
    }
}

impl<W: Write> Sink for BufferedSink<W> {
    fn append(&mut self, line: String) -> io::Result<()> {
        self.lines.push(line);
        if self.lines.len() > self.max_lines {
            Sink::flush(self)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        write_lines(&mut self.out, &self.lines)?;
        self.lines.clear();
        Ok(())
    }
}

/// Appends to `<basename>-YYYY-MM-DD.txt`, one file per local day.
///
/// The date is taken when the buffer is written, so lines buffered just
/// before midnight land in the next day's file.
pub struct DailyFileSink {
    basename: String,
    lines: Vec<String>,
    max_lines: usize,
}

impl DailyFileSink {
    pub fn new(basename: impl Into<String>, max_lines: usize) -> Self {
        Self {
            basename: basename.into(),
            lines: Vec::new(),
            max_lines,
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        PathBuf::from(format!("{}-{}.txt", self.basename, date.format("%Y-%m-%d")))
    }

    fn write_to(&mut self, path: PathBuf) -> io::Result<()> {
        if self.lines.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        write_lines(&mut BufWriter::new(file), &self.lines)?;
        tracing::debug!(path = %path.display(), lines = self.lines.len(), "Flushed log");
        self.lines.clear();
        Ok(())
    }
}

impl Sink for DailyFileSink {
    fn append(&mut self, line: String) -> io::Result<()> {
        self.lines.push(line);
        if self.lines.len() > self.max_lines {
            Sink::flush(self)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        let path = self.path_for(Local::now().date_naive());
        self.write_to(path)
    }
}

fn write_lines(out: &mut impl Write, lines: &[String]) -> io::Result<()> {
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()
}

/// How traffic is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// `<unix time, ms precision> <raw line>` for everything sent and received.
    Raw,
    /// Human-readable messages, joins, parts and quits. Everything else is dropped.
    Pretty,
}

impl LogFormat {
    /// Render one event, or `None` if this format ignores it.
    ///
    /// `own_nick` names the sender of outgoing messages.
    pub fn format(&self, own_nick: &str, event: &Event, now: DateTime<Local>) -> Option<String> {
        match self {
            LogFormat::Raw => {
                let raw = match event {
                    Event::Send(line) => line.as_str(),
                    Event::Recv(msg) => msg.raw.as_str(),
                    Event::Join(_) => return None,
                };
                let millis = now.timestamp_millis();
                Some(format!(
                    "{}.{:03} {raw}",
                    millis.div_euclid(1000),
                    millis.rem_euclid(1000)
                ))
            }
            LogFormat::Pretty => {
                let text = match event {
                    Event::Send(line) => pretty_sent(own_nick, &Message::parse(line)),
                    Event::Recv(msg) => pretty_received(msg),
                    Event::Join(_) => None,
                }?;
                Some(format!("[{}] {text}", now.format("%Y-%m-%d %H:%M:%S")))
            }
        }
    }
}

fn pretty_sent(own_nick: &str, msg: &Message) -> Option<String> {
    if msg.command != "PRIVMSG" || msg.params.len() < 2 {
        return None;
    }
    Some(format!(
        "<{}:{}> {}",
        clean(own_nick),
        clean(&msg.params[0]),
        clean(&msg.params[1])
    ))
}

fn pretty_received(msg: &Message) -> Option<String> {
    let (nick, user, host) = msg.sender()?;
    let (nick, user, host) = (clean(nick), clean(user), clean(host));
    let first = clean(msg.params.first().map(String::as_str).unwrap_or_default());
    match msg.command.as_str() {
        "PRIVMSG" => {
            let text = clean(msg.params.get(1)?);
            Some(format!("<{nick}:{first}> {text}"))
        }
        "JOIN" => Some(format!("{nick} ({user}@{host}) joined {first}.")),
        "PART" => Some(format!("{nick} ({user}@{host}) left {first}.")),
        "QUIT" => Some(format!("{nick} ({user}@{host}) quit. ({first})")),
        _ => None,
    }
}

/// Strip control characters.
fn clean(s: &str) -> String {
    s.chars().filter(|c| u32::from(*c) >= 32).collect()
}

/// An [`Observer`] that writes formatted traffic to a sink.
pub struct LogObserver<S> {
    format: LogFormat,
    sink: RefCell<S>,
}

impl<S: Sink> LogObserver<S> {
    pub fn new(format: LogFormat, sink: S) -> Self {
        Self {
            format,
            sink: RefCell::new(sink),
        }
    }

    pub fn sink(&self) -> Ref<'_, S> {
        self.sink.borrow()
    }
}

impl<S: Sink> Observer for LogObserver<S> {
    fn observe(&self, session: &mut Session, event: &Event) -> HandlerResult {
        if let Some(line) = self.format.format(session.current_nick(), event, Local::now()) {
            self.sink.borrow_mut().append(line)?;
        }
        Ok(Flow::Continue)
    }

    fn flush(&self) -> Result<()> {
        self.sink.borrow_mut().flush()?;
        Ok(())
    }
}

/// Observers flushed on a fixed period from the session's timer queue.
pub struct FlushRegistry {
    period: Duration,
    observers: Vec<Rc<dyn Observer>>,
}

impl FlushRegistry {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            observers: Vec::new(),
        }
    }

    pub fn register(&mut self, observer: Rc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn flush_all(&self) {
        for observer in &self.observers {
            if let Err(e) = observer.flush() {
                tracing::warn!(error = %e, "Periodic flush failed");
            }
        }
    }

    /// Schedule the next flush on `session`. Each flush re-arms the timer.
    pub fn arm(registry: &Rc<Self>, session: &mut Session) {
        if registry.is_empty() {
            return;
        }
        let registry = Rc::clone(registry);
        session.call_in(registry.period, move |session| {
            registry.flush_all();
            FlushRegistry::arm(&registry, session);
            Ok(())
        });
    }
}
