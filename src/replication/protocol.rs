//! Replication Protocol
//!
//! Defines the wire protocol for communication between nodes. All three
//! planes are line-oriented: LF-terminated lines of space-separated
//! tokens, with values length-prefixed as `<len> <bytes>` so they may
//! contain spaces and embedded newlines.
//!
//! - Client plane (leader client port / follower read port):
//!   `SET`/`PUT`/`GET`/`DEL`/`GETFF`/`GETFB`/`OPTIMIZE`
//! - Replication plane (leader repl port):
//!   `HELLO`/`WRITE`/`DELETE`/`ACK`/`RESET_WAL`
//! - Control plane (per-node control port):
//!   `HB`/`VOTE_REQ`/`VOTE_RESP`/`CLUSTER_STATUS`

use tokio::io::BufReader;

use crate::error::{Error, Result};
use crate::network::{length_prefixed, read_length_prefixed};
use crate::wal::{Lsn, WalOp, WalRecord};

/// Usage string returned for unrecognized client commands
pub const CLIENT_USAGE: &str = "ERR usage: SET|PUT|GET|DEL|GETFF|GETFB|OPTIMIZE";

/// A command received on the leader's client port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Set { key: String, value: String },
    Delete { key: String },
    Get { key: String },
    RangeForward { start: String, limit: usize },
    RangeBackward { end: String, limit: usize },
    Optimize,
}

impl ClientCommand {
    /// Parse one client line. `SET`/`PUT` values are length-prefixed
    /// and may continue past the line; missing bytes come from `reader`.
    pub async fn parse<R>(line: &str, reader: &mut BufReader<R>) -> Result<Self>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        // Value-carrying commands keep the raw line tail so spaces
        // inside the value survive
        if line.starts_with("SET ") || line.starts_with("PUT ") {
            let mut parts = line.splitn(4, ' ');
            let _cmd = parts.next();
            let key = parts
                .next()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Protocol(format!("missing key: {}", line)))?;
            let len_token = parts
                .next()
                .ok_or_else(|| Error::Protocol(format!("missing value length: {}", line)))?;
            let value = read_length_prefixed(len_token, parts.next().unwrap_or(""), reader).await?;
            return Ok(ClientCommand::Set {
                key: key.to_string(),
                value,
            });
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["DEL", key] => Ok(ClientCommand::Delete {
                key: key.to_string(),
            }),
            ["GET", key] => Ok(ClientCommand::Get {
                key: key.to_string(),
            }),
            ["GETFF", start, limit] => Ok(ClientCommand::RangeForward {
                start: start.to_string(),
                limit: parse_limit(limit)?,
            }),
            ["GETFB", end, limit] => Ok(ClientCommand::RangeBackward {
                end: end.to_string(),
                limit: parse_limit(limit)?,
            }),
            ["OPTIMIZE"] => Ok(ClientCommand::Optimize),
            _ => Err(Error::Protocol(format!("unknown client command: {}", line))),
        }
    }

    /// Encode for sending to a leader (the form `DbClient` emits)
    pub fn encode(&self) -> String {
        match self {
            ClientCommand::Set { key, value } => {
                format!("SET {} {}\n", key, length_prefixed(value))
            }
            ClientCommand::Delete { key } => format!("DEL {}\n", key),
            ClientCommand::Get { key } => format!("GET {}\n", key),
            ClientCommand::RangeForward { start, limit } => {
                format!("GETFF {} {}\n", start, limit)
            }
            ClientCommand::RangeBackward { end, limit } => {
                format!("GETFB {} {}\n", end, limit)
            }
            ClientCommand::Optimize => "OPTIMIZE\n".to_string(),
        }
    }

}

fn parse_limit(token: &str) -> Result<usize> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid scan limit: {}", token)))
}

/// A frame on the replication plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    /// Follower announces its apply position; the leader streams
    /// everything newer
    Hello { lsn: Lsn },
    /// SET at this LSN
    Write { lsn: Lsn, key: String, value: String },
    /// DELETE at this LSN
    Delete { lsn: Lsn, key: String },
    /// Follower has durably applied everything up to this LSN
    Ack { lsn: Lsn },
    /// Follower must truncate its log and apply state and resync
    ResetWal,
}

impl ReplicationFrame {
    /// Frame carrying one WAL record
    pub fn from_record(record: &WalRecord) -> Self {
        match record.op {
            WalOp::Set => ReplicationFrame::Write {
                lsn: record.lsn,
                key: record.key.clone(),
                value: record.value.clone(),
            },
            WalOp::Delete => ReplicationFrame::Delete {
                lsn: record.lsn,
                key: record.key.clone(),
            },
        }
    }

    /// The WAL record carried by a `WRITE`/`DELETE` frame
    pub fn to_record(&self) -> Option<WalRecord> {
        match self {
            ReplicationFrame::Write { lsn, key, value } => {
                Some(WalRecord::set(*lsn, key.clone(), value.clone()))
            }
            ReplicationFrame::Delete { lsn, key } => Some(WalRecord::delete(*lsn, key.clone())),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ReplicationFrame::Hello { lsn } => format!("HELLO {}\n", lsn),
            ReplicationFrame::Write { lsn, key, value } => {
                format!("WRITE {} {} {}\n", lsn, key, length_prefixed(value))
            }
            ReplicationFrame::Delete { lsn, key } => format!("DELETE {} {}\n", lsn, key),
            ReplicationFrame::Ack { lsn } => format!("ACK {}\n", lsn),
            ReplicationFrame::ResetWal => "RESET_WAL\n".to_string(),
        }
    }

    /// Parse one replication line; `WRITE` values may continue past it
    pub async fn parse<R>(line: &str, reader: &mut BufReader<R>) -> Result<Self>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        if line.starts_with("WRITE ") {
            let mut parts = line.splitn(5, ' ');
            let _cmd = parts.next();
            let lsn = parts
                .next()
                .ok_or_else(|| Error::Protocol(format!("missing LSN: {}", line)))?;
            let key = parts
                .next()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Protocol(format!("missing key: {}", line)))?;
            let len_token = parts
                .next()
                .ok_or_else(|| Error::Protocol(format!("missing value length: {}", line)))?;
            let value = read_length_prefixed(len_token, parts.next().unwrap_or(""), reader).await?;
            return Ok(ReplicationFrame::Write {
                lsn: parse_lsn(lsn)?,
                key: key.to_string(),
                value,
            });
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["HELLO", lsn] => Ok(ReplicationFrame::Hello { lsn: parse_lsn(lsn)? }),
            ["DELETE", lsn, key] => Ok(ReplicationFrame::Delete {
                lsn: parse_lsn(lsn)?,
                key: key.to_string(),
            }),
            ["ACK", lsn] => Ok(ReplicationFrame::Ack { lsn: parse_lsn(lsn)? }),
            ["RESET_WAL"] => Ok(ReplicationFrame::ResetWal),
            _ => Err(Error::Protocol(format!(
                "unknown replication frame: {}",
                line
            ))),
        }
    }
}

/// A frame on the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Leader's periodic heartbeat
    Heartbeat { term: u64, leader_id: u32, last_seq: Lsn },
    /// Candidate soliciting a vote
    VoteRequest { term: u64, candidate_id: u32, last_seq: Lsn },
    /// Reply to a vote request, dialed back to the candidate
    VoteResponse { term: u64, granted: bool },
    /// Diagnostic status query
    ClusterStatus,
}

impl ControlFrame {
    pub fn encode(&self) -> String {
        match self {
            ControlFrame::Heartbeat {
                term,
                leader_id,
                last_seq,
            } => format!("HB {} {} {}\n", term, leader_id, last_seq),
            ControlFrame::VoteRequest {
                term,
                candidate_id,
                last_seq,
            } => format!("VOTE_REQ {} {} {}\n", term, candidate_id, last_seq),
            ControlFrame::VoteResponse { term, granted } => {
                format!("VOTE_RESP {} {}\n", term, if *granted { 1 } else { 0 })
            }
            ControlFrame::ClusterStatus => "CLUSTER_STATUS\n".to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["HB", term, leader_id, last_seq] => Ok(ControlFrame::Heartbeat {
                term: parse_u64(term)?,
                leader_id: parse_node_id(leader_id)?,
                last_seq: parse_lsn(last_seq)?,
            }),
            ["VOTE_REQ", term, candidate_id, last_seq] => Ok(ControlFrame::VoteRequest {
                term: parse_u64(term)?,
                candidate_id: parse_node_id(candidate_id)?,
                last_seq: parse_lsn(last_seq)?,
            }),
            ["VOTE_RESP", term, granted] => Ok(ControlFrame::VoteResponse {
                term: parse_u64(term)?,
                granted: *granted == "1",
            }),
            ["CLUSTER_STATUS"] => Ok(ControlFrame::ClusterStatus),
            _ => Err(Error::Protocol(format!("unknown control frame: {}", line))),
        }
    }
}

fn parse_lsn(token: &str) -> Result<Lsn> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid LSN: {}", token)))
}

fn parse_u64(token: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid number: {}", token)))
}

fn parse_node_id(token: &str) -> Result<u32> {
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid node id: {}", token)))
}
