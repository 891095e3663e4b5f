//! IRC message types and the line parser.
//! This is a minimal RFC 1459 parser: `:prefix COMMAND middle params :trailing`.
//!
//! Parsing is infallible; decoding raw bytes into text is not, see [`Decoder`].

use std::fmt;

use encoding_rs::Encoding;

use crate::error::DecodeError;

/// Numeric and symbolic replies the engine reacts to.
pub mod reply {
    pub const RPL_WELCOME: &[&str] = &["001", "RPL_WELCOME"];
    pub const RPL_ENDOFMOTD: &[&str] = &["376", "RPL_ENDOFMOTD"];
    pub const RPL_ENDOFNAMES: &[&str] = &["366", "RPL_ENDOFNAMES"];
    pub const ERR_NICKNAMEINUSE: &[&str] = &["433", "ERR_NICKNAMEINUSE"];
}

/// A parsed IRC message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Source of the message without the leading `:`; empty if absent.
    pub prefix: String,
    /// Verb or three-digit numeric reply. Empty only for malformed lines.
    pub command: String,
    /// Parameters in order. The last one may contain spaces if it was sent
    /// as the trailing parameter.
    pub params: Vec<String>,
    /// The line as received.
    pub raw: String,
}

impl Message {
    /// Parse one protocol line (delimiter optional).
    pub fn parse(line: &str) -> Self {
        let raw = line.trim_end_matches(['\r', '\n']);
        let mut rest = raw;

        // Parse prefix: :server or :nick!user@host
        let mut prefix = "";
        if let Some(stripped) = rest.strip_prefix(':') {
            (prefix, rest) = stripped.split_once(' ').unwrap_or((stripped, ""));
        }

        let (command, tail) = rest.split_once(' ').unwrap_or((rest, ""));

        let params = if let Some(trailing) = tail.strip_prefix(':') {
            vec![trailing.to_string()]
        } else {
            let (middle, trailing) = match tail.split_once(" :") {
                Some((middle, trailing)) => (middle, Some(trailing)),
                None => (tail, None),
            };
            middle
                .split(' ')
                .filter(|p| !p.is_empty())
                .chain(trailing)
                .map(str::to_string)
                .collect()
        };

        Message {
            prefix: prefix.to_string(),
            command: command.to_string(),
            params,
            raw: raw.to_string(),
        }
    }

    /// Decode raw bytes with the default encoding chain, then parse.
    pub fn decode(line: &[u8]) -> Result<Self, DecodeError> {
        Decoder::default().decode(line).map(|text| Self::parse(&text))
    }

    /// True if the command is any of `names` (numeric or symbolic).
    pub fn is(&self, names: &[&str]) -> bool {
        names.contains(&self.command.as_str())
    }

    /// Nick part of a `nick!user@host` prefix.
    pub fn nick(&self) -> &str {
        self.prefix.split('!').next().unwrap_or("")
    }

    /// Split a `nick!user@host` prefix into its three parts.
    pub fn sender(&self) -> Option<(&str, &str, &str)> {
        let (nick, rest) = self.prefix.split_once('!')?;
        let (user, host) = rest.split_once('@')?;
        Some((nick, user, host))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Fallback chain of text encodings tried in order on each received line.
#[derive(Debug, Clone)]
pub struct Decoder {
    encodings: Vec<&'static Encoding>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(vec![
            encoding_rs::UTF_8,
            encoding_rs::ISO_8859_15,
            encoding_rs::SHIFT_JIS,
            encoding_rs::WINDOWS_1252,
        ])
    }
}

impl Decoder {
    pub fn new(encodings: Vec<&'static Encoding>) -> Self {
        Self { encodings }
    }

    /// Decode with the first encoding that accepts every byte.
    pub fn decode(&self, line: &[u8]) -> Result<String, DecodeError> {
        self.encodings
            .iter()
            .find_map(|enc| enc.decode_without_bom_handling_and_without_replacement(line))
            .map(|text| text.into_owned())
            .ok_or_else(|| DecodeError {
                line: line.to_vec(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_privmsg_with_prefix() {
        let msg = Message::parse(":nick!user@host PRIVMSG #chan :hello world");
        assert_eq!(msg.prefix, "nick!user@host");
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello world"]);
        assert_eq!(msg.nick(), "nick");
        assert_eq!(msg.sender(), Some(("nick", "user", "host")));
    }

    #[test]
    fn parse_no_prefix() {
        let msg = Message::parse("PING 12345");
        assert_eq!(msg.prefix, "");
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["12345"]);
    }

    #[test]
    fn parse_no_trailing() {
        let msg = Message::parse("JOIN #chan");
        assert_eq!(msg.params, vec!["#chan"]);
    }

    #[test]
    fn parse_only_trailing() {
        let msg = Message::parse("PING :irc.example.net");
        assert_eq!(msg.params, vec!["irc.example.net"]);
    }

    #[test]
    fn parse_numeric_with_trailing() {
        let msg = Message::parse(":server 366 alice #chan :End of /NAMES list.\r\n");
        assert_eq!(msg.command, "366");
        assert_eq!(msg.params, vec!["alice", "#chan", "End of /NAMES list."]);
        assert_eq!(msg.raw, ":server 366 alice #chan :End of /NAMES list.");
        assert!(msg.is(reply::RPL_ENDOFNAMES));
    }

    #[test]
    fn trailing_keeps_colons_and_spaces() {
        let msg = Message::parse(":a PRIVMSG #c :see: this  :thing");
        assert_eq!(msg.params, vec!["#c", "see: this  :thing"]);
    }

    #[test]
    fn malformed_prefix_only() {
        let msg = Message::parse(":lonely");
        assert_eq!(msg.prefix, "lonely");
        assert_eq!(msg.command, "");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn command_without_params() {
        let msg = Message::parse("QUIT");
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn sender_without_user_host() {
        let msg = Message::parse(":irc.example.net NOTICE * :hi");
        assert_eq!(msg.nick(), "irc.example.net");
        assert_eq!(msg.sender(), None);
    }

    #[test]
    fn decode_falls_back_to_latin() {
        let msg = Message::decode(b":a PRIVMSG #c :caf\xe9").unwrap();
        assert_eq!(msg.params[1], "café");
    }

    #[test]
    fn decode_utf8_first() {
        let msg = Message::decode(":a PRIVMSG #c :日本".as_bytes()).unwrap();
        assert_eq!(msg.params[1], "日本");
    }

    #[test]
    fn decode_fails_when_chain_exhausted() {
        let decoder = Decoder::new(vec![encoding_rs::UTF_8]);
        let err = decoder.decode(b"\xff\xfe").unwrap_err();
        assert_eq!(err.line, b"\xff\xfe");
    }
}
