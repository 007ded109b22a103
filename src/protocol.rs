//! Line-oriented text protocol spoken by the browser client.
//!
//! A message holds one command per line. A command is `[@ordinal] verb arg...` with
//! space separated tokens:
//!
//! ```text
//! set A 1 LSx -0.25
//! @42 set RT 0.8
//! reset
//! mode xbox
//! log free text for the server log
//! ping
//! ```

use crate::virtual_controller::Mode;

/// Close code sent to clients when the server shuts down
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent when no virtual controller could be created
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const SERVER_CLOSED_REASON: &str = "Server closed";
pub const DEVICE_UNAVAILABLE_REASON: &str = "Device unavailable";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Key/value pairs in the order they were sent
    Set(Vec<(String, f32)>),
    Reset,
    Mode(Mode),
    Log(String),
    /// Optional token echoed back in the reply
    Ping(Option<String>),
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Set(_) => "set",
            Command::Reset => "reset",
            Command::Mode(_) => "mode",
            Command::Log(_) => "log",
            Command::Ping(_) => "ping",
        }
    }
}

/// A parsed command with the sender's ordinal, if it supplied one
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub ordinal: Option<u64>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown command {0:?}")]
    UnknownVerb(String),
    #[error("Missing arguments for {0:?}")]
    MissingArguments(&'static str),
    #[error("Unexpected arguments for {verb:?}: {args:?}")]
    UnexpectedArguments { verb: &'static str, args: String },
    #[error("Missing value for {0:?}")]
    MissingValue(String),
    #[error("Invalid value {value:?} for {key:?}")]
    InvalidValue { key: String, value: String },
    #[error("Wrong mode {0:?}")]
    UnknownMode(String),
    #[error("Invalid ordinal {0:?}")]
    InvalidOrdinal(String),
    #[error("Ordinal without a command")]
    MissingVerb,
}

/// Split an inbound message into its command lines, skipping blank ones
pub fn lines(message: &str) -> impl Iterator<Item = &str> {
    message
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
}

/// Parse one command line
pub fn parse_line(line: &str) -> Result<Envelope, ProtocolError> {
    let line = line.trim_start();
    let (ordinal, rest) = match line.strip_prefix('@') {
        Some(tagged) => {
            let (tag, rest) = tagged.split_once(' ').unwrap_or((tagged, ""));
            // The largest value is reserved so every ordinal has a successor
            let ordinal = tag
                .parse::<u64>()
                .ok()
                .filter(|&ordinal| ordinal < u64::MAX)
                .ok_or_else(|| ProtocolError::InvalidOrdinal(tag.to_string()))?;
            (Some(ordinal), rest.trim_start())
        }
        None => (None, line),
    };

    let (verb, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let command = match verb {
        "" => return Err(ProtocolError::MissingVerb),
        "set" => parse_set(args)?,
        "reset" => {
            expect_no_args("reset", args)?;
            Command::Reset
        }
        "mode" => parse_mode(args)?,
        "log" => Command::Log(args.to_string()),
        "ping" => {
            let token = args.trim();
            Command::Ping((!token.is_empty()).then(|| token.to_string()))
        }
        other => return Err(ProtocolError::UnknownVerb(other.to_string())),
    };

    Ok(Envelope { ordinal, command })
}

fn expect_no_args(verb: &'static str, args: &str) -> Result<(), ProtocolError> {
    if args.trim().is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedArguments {
            verb,
            args: args.trim().to_string(),
        })
    }
}

// Every pair is validated before anything is returned, so a bad pair drops the
// whole command
fn parse_set(args: &str) -> Result<Command, ProtocolError> {
    let mut tokens = args.split_whitespace();
    let mut pairs = Vec::new();
    while let Some(key) = tokens.next() {
        let Some(raw) = tokens.next() else {
            return Err(ProtocolError::MissingValue(key.to_string()));
        };
        let value = raw
            .parse::<f32>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ProtocolError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            })?;
        pairs.push((key.to_string(), value));
    }
    if pairs.is_empty() {
        return Err(ProtocolError::MissingArguments("set"));
    }
    Ok(Command::Set(pairs))
}

fn parse_mode(args: &str) -> Result<Command, ProtocolError> {
    let mut tokens = args.split_whitespace();
    let name = tokens.next().ok_or(ProtocolError::MissingArguments("mode"))?;
    let mode = Mode::from_name(name).ok_or_else(|| ProtocolError::UnknownMode(name.to_string()))?;
    let extra: Vec<&str> = tokens.collect();
    if !extra.is_empty() {
        return Err(ProtocolError::UnexpectedArguments {
            verb: "mode",
            args: extra.join(" "),
        });
    }
    Ok(Command::Mode(mode))
}

/// Echo sent to the client for every feedback notification
pub fn format_feedback(large_motor: f32, small_motor: f32, led_number: u8) -> String {
    format!("set large_motor {large_motor} small_motor {small_motor} led_number {led_number}")
}

pub fn format_pong(token: Option<&str>) -> String {
    match token {
        Some(token) => format!("pong {token}"),
        None => "pong".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Command {
        parse_line(line).unwrap().command
    }

    #[test]
    fn set_keeps_pair_order() {
        assert_eq!(
            command("set A 1 LSx -0.25 A 0"),
            Command::Set(vec![
                ("A".to_string(), 1.0),
                ("LSx".to_string(), -0.25),
                ("A".to_string(), 0.0),
            ])
        );
    }

    #[test]
    fn set_rejects_malformed_pairs() {
        assert_eq!(
            parse_line("set LS"),
            Err(ProtocolError::MissingValue("LS".to_string()))
        );
        assert_eq!(
            parse_line("set A 1 B"),
            Err(ProtocolError::MissingValue("B".to_string()))
        );
        assert_eq!(
            parse_line("set A yes"),
            Err(ProtocolError::InvalidValue {
                key: "A".to_string(),
                value: "yes".to_string()
            })
        );
        assert!(matches!(
            parse_line("set A NaN"),
            Err(ProtocolError::InvalidValue { .. })
        ));
        assert_eq!(
            parse_line("set"),
            Err(ProtocolError::MissingArguments("set"))
        );
    }

    #[test]
    fn set_tolerates_repeated_spaces() {
        assert_eq!(
            command("set  A   1"),
            Command::Set(vec![("A".to_string(), 1.0)])
        );
    }

    #[test]
    fn ordinal_prefix() {
        let envelope = parse_line("@42 set RT 0.5").unwrap();
        assert_eq!(envelope.ordinal, Some(42));
        assert_eq!(envelope.command, Command::Set(vec![("RT".to_string(), 0.5)]));

        assert_eq!(parse_line("set RT 0.5").unwrap().ordinal, None);
        assert_eq!(
            parse_line("@x set RT 0.5"),
            Err(ProtocolError::InvalidOrdinal("x".to_string()))
        );
        assert_eq!(parse_line("@7"), Err(ProtocolError::MissingVerb));
    }

    #[test]
    fn verb_matches_the_parsed_word() {
        for line in ["set A 1", "reset", "mode ds4", "log hi", "ping 3"] {
            let word = line.split(' ').next().unwrap();
            assert_eq!(command(line).verb(), word);
        }
    }

    #[test]
    fn largest_ordinal_is_rejected() {
        assert_eq!(
            parse_line("@18446744073709551615 set B 1"),
            Err(ProtocolError::InvalidOrdinal(
                "18446744073709551615".to_string()
            ))
        );
        assert_eq!(
            parse_line("@18446744073709551614 set B 1").unwrap().ordinal,
            Some(u64::MAX - 1)
        );
        assert!(matches!(
            parse_line("@18446744073709551616 set B 1"),
            Err(ProtocolError::InvalidOrdinal(_))
        ));
    }

    #[test]
    fn mode_arity_and_names() {
        assert_eq!(command("mode xbox"), Command::Mode(Mode::Xbox));
        assert_eq!(command("mode ds4"), Command::Mode(Mode::Ds4));
        assert_eq!(
            parse_line("mode"),
            Err(ProtocolError::MissingArguments("mode"))
        );
        assert_eq!(
            parse_line("mode switch"),
            Err(ProtocolError::UnknownMode("switch".to_string()))
        );
        assert!(matches!(
            parse_line("mode xbox ds4"),
            Err(ProtocolError::UnexpectedArguments { verb: "mode", .. })
        ));
    }

    #[test]
    fn reset_takes_no_arguments() {
        assert_eq!(command("reset"), Command::Reset);
        assert!(matches!(
            parse_line("reset now"),
            Err(ProtocolError::UnexpectedArguments { verb: "reset", .. })
        ));
    }

    #[test]
    fn log_keeps_text_verbatim() {
        assert_eq!(
            command("log layout  loaded: 3 keys"),
            Command::Log("layout  loaded: 3 keys".to_string())
        );
        assert_eq!(command("log"), Command::Log(String::new()));
    }

    #[test]
    fn ping_with_and_without_token() {
        assert_eq!(command("ping"), Command::Ping(None));
        assert_eq!(command("ping 1712"), Command::Ping(Some("1712".to_string())));
        assert_eq!(format_pong(None), "pong");
        assert_eq!(format_pong(Some("1712")), "pong 1712");
    }

    #[test]
    fn unknown_verb() {
        assert_eq!(
            parse_line("jump high"),
            Err(ProtocolError::UnknownVerb("jump".to_string()))
        );
    }

    #[test]
    fn lines_skip_blanks_and_carriage_returns() {
        let found: Vec<&str> = lines("set A 1\r\n\nping\n  \nreset").collect();
        assert_eq!(found, vec!["set A 1", "ping", "reset"]);
    }

    #[test]
    fn feedback_echo_format() {
        assert_eq!(
            format_feedback(0.5, 0.25, 1),
            "set large_motor 0.5 small_motor 0.25 led_number 1"
        );
    }
}
