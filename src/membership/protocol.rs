//! Monitor wire protocol.
//!
//! Heartbeats arrive as single UDP datagrams; the control endpoint speaks the
//! same line format over TCP.

use std::fmt;

use super::types::{Heartbeat, NodeAddress, NodeId, NodeRecord, NodeState};
use crate::error::{CdnError, Result};
use crate::transport::{parse_num, split_line};

pub const HEARTBEAT: &str = "HEARTBEAT";
pub const LIST_SERVERS: &str = "LIST_SERVERS";
pub const REGISTER_INDEX: &str = "REGISTER_INDEX";
pub const PING: &str = "PING";
pub const SERVER: &str = "SERVER";

pub const PONG: &str = "PONG";
pub const OK_INDEX_REGISTERED: &str = "OK INDEX_REGISTERED";

/// Requests accepted on the monitor's TCP control endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    ListServers,
    RegisterIndex { host: String, port: u16 },
    Ping,
}

impl ControlRequest {
    pub fn parse(line: &str) -> Result<Self> {
        let (verb, args) =
            split_line(line).ok_or_else(|| CdnError::InvalidFormat("empty line".into()))?;

        match verb {
            LIST_SERVERS => Ok(ControlRequest::ListServers),
            PING => Ok(ControlRequest::Ping),
            REGISTER_INDEX => match args.as_slice() {
                [host, port, ..] => Ok(ControlRequest::RegisterIndex {
                    host: host.to_string(),
                    port: parse_num(port, "port")?,
                }),
                _ => Err(CdnError::InvalidFormat(
                    "REGISTER_INDEX needs host and port".into(),
                )),
            },
            other => Err(CdnError::UnknownCommand(other.to_string())),
        }
    }
}

pub fn parse_heartbeat(line: &str) -> Result<Heartbeat> {
    let (verb, args) =
        split_line(line).ok_or_else(|| CdnError::InvalidFormat("empty datagram".into()))?;
    if verb != HEARTBEAT {
        return Err(CdnError::UnknownCommand(verb.to_string()));
    }

    match args.as_slice() {
        [id, host, port, load, file_count, rest @ ..] => Ok(Heartbeat {
            id: NodeId::from(*id),
            address: NodeAddress::new(*host, parse_num(port, "tcp-port")?),
            load: parse_num(load, "load")?,
            file_count: parse_num(file_count, "file-count")?,
            sent_at: match rest.first() {
                Some(sent_at) => Some(parse_num(sent_at, "sent-at")?),
                None => None,
            },
        }),
        _ => Err(CdnError::InvalidFormat(format!(
            "HEARTBEAT needs 5 fields, got {}",
            args.len()
        ))),
    }
}

pub fn format_heartbeat(heartbeat: &Heartbeat) -> String {
    let mut line = format!(
        "{} {} {} {} {} {}",
        HEARTBEAT,
        heartbeat.id,
        heartbeat.address.host,
        heartbeat.address.port,
        heartbeat.load,
        heartbeat.file_count
    );
    if let Some(sent_at) = heartbeat.sent_at {
        line.push_str(&format!(" {}", sent_at));
    }
    line
}

/// One `SERVER id address port load state` row, shared by the monitor and
/// the index `LIST_SERVERS` responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRow {
    pub id: NodeId,
    pub address: NodeAddress,
    pub load: u64,
    pub state: NodeState,
}

impl ServerRow {
    pub fn parse(line: &str) -> Result<Self> {
        let (verb, args) =
            split_line(line).ok_or_else(|| CdnError::InvalidFormat("empty line".into()))?;
        if verb != SERVER {
            return Err(CdnError::UnknownCommand(verb.to_string()));
        }

        match args.as_slice() {
            [id, host, port, load, state, ..] => Ok(ServerRow {
                id: NodeId::from(*id),
                address: NodeAddress::new(*host, parse_num(port, "port")?),
                load: parse_num(load, "load")?,
                state: NodeState::from_wire(state)
                    .ok_or_else(|| CdnError::InvalidFormat(format!("unknown state {}", state)))?,
            }),
            _ => Err(CdnError::InvalidFormat(format!(
                "SERVER row needs 5 fields, got {}",
                args.len()
            ))),
        }
    }
}

impl From<&NodeRecord> for ServerRow {
    fn from(record: &NodeRecord) -> Self {
        Self {
            id: record.id.clone(),
            address: record.address.clone(),
            load: record.load,
            state: record.state,
        }
    }
}

impl fmt::Display for ServerRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            SERVER,
            self.id,
            self.address.host,
            self.address.port,
            self.load,
            self.state.as_wire()
        )
    }
}
