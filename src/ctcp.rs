//! CTCP DCC wire codec
//!
//! DCC negotiation rides inside IRC CTCP messages as ASCII, space-delimited
//! `DCC` payloads. [`DccMessage`] parses and formats the four payloads the
//! engine speaks:
//!
//! ```text
//! DCC CHAT <label> <ip> <port>
//! DCC SEND <filename> <ip> <port> [<size>] [<token>] [T]
//! DCC RESUME <filename> <port> <offset> [<token>]
//! DCC ACCEPT <filename> <port> <offset> [<token>]
//! ```
//!
//! IPv4 addresses travel as the decimal rendering of their 32-bit
//! network-order value. Filenames containing spaces are double-quoted. The
//! trailing literal `T` on SEND flags turbo mode; because size and token
//! are positionally optional, arguments after the port are classified by
//! shape (numeric, literal `T`, anything else).
//!
//! Parsing is strict: any malformed field makes the whole payload an error,
//! which the orchestration layer drops silently.

use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;

/// One CTCP `DCC` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMessage {
    /// Offer of a direct chat connection
    Chat {
        label: String,
        addr: Ipv4Addr,
        port: u16,
    },

    /// Offer of a file, or the answering half of a reverse offer
    Send {
        filename: String,
        addr: Ipv4Addr,
        port: u16,
        size: Option<u64>,
        token: Option<String>,
        turbo: bool,
    },

    /// Request to continue a previously offered file from an offset
    Resume {
        filename: String,
        port: u16,
        offset: u64,
        token: Option<String>,
    },

    /// Grant of a RESUME request
    Accept {
        filename: String,
        port: u16,
        offset: u64,
        token: Option<String>,
    },
}

/// Why a payload failed to parse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Payload did not start with the `DCC` keyword
    NotDcc,
    /// Subcommand is not CHAT, SEND, RESUME or ACCEPT
    UnknownCommand(String),
    /// Fewer arguments than the subcommand requires
    MissingArgument,
    /// A numeric field failed to parse
    InvalidNumber(String),
    /// An argument where none was expected
    UnexpectedArgument(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotDcc => write!(f, "not a DCC payload"),
            Self::UnknownCommand(cmd) => write!(f, "unknown DCC command: {cmd}"),
            Self::MissingArgument => write!(f, "missing argument"),
            Self::InvalidNumber(arg) => write!(f, "invalid numeric field: {arg}"),
            Self::UnexpectedArgument(arg) => write!(f, "unexpected argument: {arg}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Encode an IPv4 address as the wire's 32-bit decimal form
pub fn address_to_long(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Decode the wire's 32-bit decimal form back to an IPv4 address
pub fn long_to_address(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Parse a CTCP `DCC` payload
pub fn parse(payload: &str) -> Result<DccMessage, ParseError> {
    let args = split_args(payload);
    let mut args = args.into_iter();

    match args.next() {
        Some(word) if word.eq_ignore_ascii_case("DCC") => {}
        _ => return Err(ParseError::NotDcc),
    }
    let command = args.next().ok_or(ParseError::MissingArgument)?;
    let rest: Vec<String> = args.collect();

    match command.to_ascii_uppercase().as_str() {
        "CHAT" => parse_chat(&rest),
        "SEND" => parse_send(&rest),
        "RESUME" => {
            let (filename, port, offset, token) = parse_positioned(&rest)?;
            Ok(DccMessage::Resume { filename, port, offset, token })
        }
        "ACCEPT" => {
            let (filename, port, offset, token) = parse_positioned(&rest)?;
            Ok(DccMessage::Accept { filename, port, offset, token })
        }
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn parse_chat(args: &[String]) -> Result<DccMessage, ParseError> {
    let [label, addr, port] = args else {
        return Err(if args.len() < 3 {
            ParseError::MissingArgument
        } else {
            ParseError::UnexpectedArgument(args[3].clone())
        });
    };
    Ok(DccMessage::Chat {
        label: label.clone(),
        addr: long_to_address(number(addr)?),
        port: number(port)?,
    })
}

fn parse_send(args: &[String]) -> Result<DccMessage, ParseError> {
    if args.len() < 3 {
        return Err(ParseError::MissingArgument);
    }
    let filename = args[0].clone();
    let addr = long_to_address(number(&args[1])?);
    let port: u16 = number(&args[2])?;

    let mut size = None;
    let mut token = None;
    let mut turbo = false;
    for (index, arg) in args[3..].iter().enumerate() {
        if arg == "T" {
            turbo = true;
        } else if index == 0 && arg.bytes().all(|b| b.is_ascii_digit()) {
            size = Some(number(arg)?);
        } else if token.is_none() && !turbo {
            token = Some(arg.clone());
        } else {
            return Err(ParseError::UnexpectedArgument(arg.clone()));
        }
    }

    Ok(DccMessage::Send { filename, addr, port, size, token, turbo })
}

/// Shared shape of RESUME and ACCEPT: `<filename> <port> <offset> [<token>]`
fn parse_positioned(args: &[String]) -> Result<(String, u16, u64, Option<String>), ParseError> {
    if args.len() < 3 {
        return Err(ParseError::MissingArgument);
    }
    if args.len() > 4 {
        return Err(ParseError::UnexpectedArgument(args[4].clone()));
    }
    Ok((
        args[0].clone(),
        number(&args[1])?,
        number(&args[2])?,
        args.get(3).cloned(),
    ))
}

fn number<T: std::str::FromStr>(arg: &str) -> Result<T, ParseError> {
    arg.parse()
        .map_err(|_| ParseError::InvalidNumber(arg.to_string()))
}

/// Split a payload on whitespace, honoring double-quoted filenames
fn split_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    args.push(stripped[..end].to_string());
                    rest = stripped[end + 1..].trim_start();
                }
                None => {
                    // Unterminated quote: take the remainder verbatim
                    args.push(stripped.to_string());
                    rest = "";
                }
            }
        } else {
            match rest.find(char::is_whitespace) {
                Some(end) => {
                    args.push(rest[..end].to_string());
                    rest = rest[end..].trim_start();
                }
                None => {
                    args.push(rest.to_string());
                    rest = "";
                }
            }
        }
    }
    args
}

/// Quote a filename for the wire when it contains spaces
fn quoted(name: &str) -> Cow<'_, str> {
    if name.contains(' ') {
        Cow::Owned(format!("\"{name}\""))
    } else {
        Cow::Borrowed(name)
    }
}

impl fmt::Display for DccMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat { label, addr, port } => {
                write!(f, "DCC CHAT {} {} {}", quoted(label), address_to_long(*addr), port)
            }
            Self::Send { filename, addr, port, size, token, turbo } => {
                write!(f, "DCC SEND {} {} {}", quoted(filename), address_to_long(*addr), port)?;
                if let Some(size) = size {
                    write!(f, " {size}")?;
                }
                if let Some(token) = token {
                    write!(f, " {token}")?;
                }
                if *turbo {
                    write!(f, " T")?;
                }
                Ok(())
            }
            Self::Resume { filename, port, offset, token } => {
                write!(f, "DCC RESUME {} {} {}", quoted(filename), port, offset)?;
                if let Some(token) = token {
                    write!(f, " {token}")?;
                }
                Ok(())
            }
            Self::Accept { filename, port, offset, token } => {
                write!(f, "DCC ACCEPT {} {} {}", quoted(filename), port, offset)?;
                if let Some(token) = token {
                    write!(f, " {token}")?;
                }
                Ok(())
            }
        }
    }
}
