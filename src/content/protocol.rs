//! Transfer protocol: `GET <name>` answered by `OK <size>` and exactly
//! `size` raw bytes, or by an `ERROR` line.

use crate::directory::protocol::{ERROR, GET, OK, error_from_token};
use crate::error::{CdnError, Result};
use crate::transport::{parse_num, split_line};

pub fn parse_transfer_request(line: &str) -> Result<String> {
    let (verb, args) =
        split_line(line).ok_or_else(|| CdnError::InvalidFormat("empty line".into()))?;

    match (verb, args.as_slice()) {
        (GET, [name, ..]) => Ok(name.to_string()),
        (GET, []) => Err(CdnError::InvalidFormat("GET needs a file name".into())),
        (other, _) => Err(CdnError::UnknownCommand(other.to_string())),
    }
}

pub fn format_transfer_request(name: &str) -> String {
    format!("{} {}", GET, name)
}

pub fn format_transfer_header(size: u64) -> String {
    format!("{} {}", OK, size)
}

/// Parses the line preceding the payload and returns the byte count.
pub fn parse_transfer_header(line: &str, name: &str) -> Result<u64> {
    match split_line(line) {
        Some((OK, args)) => match args.as_slice() {
            [size, ..] => parse_num(size, "size"),
            [] => Err(CdnError::InvalidFormat("OK without size".into())),
        },
        Some((ERROR, args)) => Err(error_from_token(args.first().copied().unwrap_or(""), name)),
        _ => Err(CdnError::InvalidFormat(format!("unexpected header: {}", line))),
    }
}
