//! Index wire protocol: content-node registration, client lookups and
//! monitor notifications.

use super::types::{FileListing, RoutingDecision};
use crate::error::{CdnError, Result};
use crate::membership::protocol::{LIST_SERVERS, SERVER};
use crate::membership::types::{NodeAddress, NodeId};
use crate::transport::{parse_num, split_line};

pub const REGISTER: &str = "REGISTER";
pub const ADD_FILE: &str = "ADD_FILE";
pub const DONE_FILES: &str = "DONE_FILES";
pub const UPDATE_LOAD: &str = "UPDATE_LOAD";
pub const DEREGISTER: &str = "DEREGISTER";
pub const HELLO: &str = "HELLO";
pub const GET: &str = "GET";
pub const LIST_FILES: &str = "LIST_FILES";
pub const SERVER_DOWN: &str = "SERVER_DOWN";
pub const FILE: &str = "FILE";
pub const ERROR: &str = "ERROR";

pub const OK: &str = "OK";
pub const OK_REGISTERED: &str = "OK REGISTERED";
pub const OK_FILES_ADDED: &str = "OK FILES_ADDED";
pub const OK_DEREGISTERED: &str = "OK DEREGISTERED";
pub const WELCOME: &str = "WELCOME MICRO-CDN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRequest {
    Register {
        id: NodeId,
        tcp_port: u16,
        udp_port: u16,
    },
    /// `ADD_FILE [id] name size`; the id is optional and must match the
    /// node being registered when present.
    AddFile {
        node: Option<NodeId>,
        name: String,
        size: u64,
    },
    DoneFiles,
    UpdateLoad {
        id: NodeId,
        load: u64,
    },
    Deregister {
        id: NodeId,
    },
    Hello,
    Get {
        name: String,
    },
    ListFiles,
    ListServers,
    ServerDown {
        id: NodeId,
        timestamp: u64,
    },
}

impl IndexRequest {
    pub fn parse(line: &str) -> Result<Self> {
        let (verb, args) =
            split_line(line).ok_or_else(|| CdnError::InvalidFormat("empty line".into()))?;

        let request = match (verb, args.as_slice()) {
            (REGISTER, [id, tcp_port, udp_port, ..]) => IndexRequest::Register {
                id: NodeId::from(*id),
                tcp_port: parse_num(tcp_port, "tcp-port")?,
                udp_port: parse_num(udp_port, "udp-port")?,
            },
            (ADD_FILE, [name, size]) => IndexRequest::AddFile {
                node: None,
                name: name.to_string(),
                size: parse_num(size, "size")?,
            },
            (ADD_FILE, [id, name, size, ..]) => IndexRequest::AddFile {
                node: Some(NodeId::from(*id)),
                name: name.to_string(),
                size: parse_num(size, "size")?,
            },
            (DONE_FILES, _) => IndexRequest::DoneFiles,
            (UPDATE_LOAD, [id, load, ..]) => IndexRequest::UpdateLoad {
                id: NodeId::from(*id),
                load: parse_num(load, "load")?,
            },
            (DEREGISTER, [id, ..]) => IndexRequest::Deregister {
                id: NodeId::from(*id),
            },
            (HELLO, _) => IndexRequest::Hello,
            (GET, [name, ..]) => IndexRequest::Get {
                name: name.to_string(),
            },
            (LIST_FILES, _) => IndexRequest::ListFiles,
            (LIST_SERVERS, _) => IndexRequest::ListServers,
            (SERVER_DOWN, [id, rest @ ..]) => IndexRequest::ServerDown {
                id: NodeId::from(*id),
                timestamp: match rest.first() {
                    Some(ts) => parse_num(ts, "timestamp")?,
                    None => 0,
                },
            },
            (
                REGISTER | ADD_FILE | UPDATE_LOAD | DEREGISTER | GET | SERVER_DOWN,
                _,
            ) => {
                return Err(CdnError::InvalidFormat(format!(
                    "{} with {} arguments",
                    verb,
                    args.len()
                )));
            }
            (other, _) => return Err(CdnError::UnknownCommand(other.to_string())),
        };

        Ok(request)
    }
}

pub fn format_register(id: &NodeId, tcp_port: u16, udp_port: u16) -> String {
    format!("{} {} {} {}", REGISTER, id, tcp_port, udp_port)
}

pub fn format_add_file(id: &NodeId, name: &str, size: u64) -> String {
    format!("{} {} {} {}", ADD_FILE, id, name, size)
}

pub fn format_server_down(id: &NodeId, timestamp: u64) -> String {
    format!("{} {} {}", SERVER_DOWN, id, timestamp)
}

/// `SERVER address port id size`
pub fn format_routing(decision: &RoutingDecision) -> String {
    format!(
        "{} {} {} {} {}",
        SERVER, decision.address.host, decision.address.port, decision.node_id, decision.size
    )
}

/// Parses a `GET` answer: either a routing line or an `ERROR` line.
pub fn parse_routing(line: &str, file_name: &str) -> Result<RoutingDecision> {
    let (verb, args) =
        split_line(line).ok_or_else(|| CdnError::InvalidFormat("empty response".into()))?;

    match (verb, args.as_slice()) {
        (SERVER, [host, port, id, size, ..]) => Ok(RoutingDecision {
            file_name: file_name.to_string(),
            node_id: NodeId::from(*id),
            address: NodeAddress::new(*host, parse_num(port, "port")?),
            size: parse_num(size, "size")?,
        }),
        (ERROR, [token, ..]) => Err(error_from_token(token, file_name)),
        _ => Err(CdnError::InvalidFormat(format!("unexpected response: {}", line))),
    }
}

/// `FILE name size`
pub fn format_file_row(listing: &FileListing) -> String {
    format!("{} {} {}", FILE, listing.name, listing.size)
}

pub fn parse_file_row(line: &str) -> Result<FileListing> {
    match split_line(line) {
        Some((FILE, args)) => match args.as_slice() {
            [name, size, ..] => Ok(FileListing {
                name: name.to_string(),
                size: parse_num(size, "size")?,
            }),
            _ => Err(CdnError::InvalidFormat(format!("bad FILE row: {}", line))),
        },
        _ => Err(CdnError::InvalidFormat(format!("bad FILE row: {}", line))),
    }
}

/// Maps an `ERROR <TOKEN>` received from a peer back onto the taxonomy.
pub fn error_from_token(token: &str, subject: &str) -> CdnError {
    match token {
        "FILE_NOT_FOUND" => CdnError::NotFound(subject.to_string()),
        "NO_LIVE_SERVER" => CdnError::Unavailable(subject.to_string()),
        "BUSY" => CdnError::Busy,
        "NOT_REGISTERED" => CdnError::NotRegistered,
        "UNKNOWN_COMMAND" => CdnError::UnknownCommand(subject.to_string()),
        other => CdnError::InvalidFormat(format!("peer reported {}", other)),
    }
}
