//! Database Client
//!
//! Text-protocol client for the leader's client port and the
//! followers' read-only ports. One request per call; a `REDIRECT`
//! reply is followed exactly once.

use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;

use crate::error::{Error, Result};
use crate::network::{self, read_length_prefixed, read_line_timed};
use crate::replication::protocol::ClientCommand;
use crate::wal::Lsn;

/// A reply from a data-plane server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    /// Write accepted at this LSN
    Ok { lsn: Lsn },
    /// Point read hit
    Value(String),
    /// Point read miss
    NotFound,
    /// Range scan results
    Pairs(Vec<(String, String)>),
    /// Compaction finished
    Optimized,
    /// Any error line the server produced
    Error(String),
}

/// Outcome of a single exchange: a reply, or a redirect to follow
enum RawReply {
    Reply(ClientReply),
    Redirect { host: String, port: u16 },
}

/// Client for one server address
#[derive(Debug, Clone)]
pub struct DbClient {
    host: String,
    port: u16,
}

impl DbClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<ClientReply> {
        self.request(ClientCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<ClientReply> {
        self.request(ClientCommand::Delete {
            key: key.to_string(),
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<ClientReply> {
        self.request(ClientCommand::Get {
            key: key.to_string(),
        })
        .await
    }

    pub async fn scan(&self, key: &str, limit: usize, backward: bool) -> Result<ClientReply> {
        let command = if backward {
            ClientCommand::RangeBackward {
                end: key.to_string(),
                limit,
            }
        } else {
            ClientCommand::RangeForward {
                start: key.to_string(),
                limit,
            }
        };
        self.request(command).await
    }

    pub async fn optimize(&self) -> Result<ClientReply> {
        self.request(ClientCommand::Optimize).await
    }

    /// Issue one request, following at most one redirect
    pub async fn request(&self, command: ClientCommand) -> Result<ClientReply> {
        match self.exchange(&self.host, self.port, &command).await? {
            RawReply::Reply(reply) => Ok(reply),
            RawReply::Redirect { host, port } => {
                tracing::debug!("Following redirect to {}:{}", host, port);
                match self.exchange(&host, port, &command).await? {
                    RawReply::Reply(reply) => Ok(reply),
                    RawReply::Redirect { .. } => {
                        Err(Error::Replication("redirect loop".into()))
                    }
                }
            }
        }
    }

    async fn exchange(&self, host: &str, port: u16, command: &ClientCommand) -> Result<RawReply> {
        let stream = network::connect(host, port).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        network::write_all_timed(&mut write_half, command.encode().as_bytes()).await?;
        read_reply(&mut reader).await
    }
}

/// Parse the value out of a `VALUE <len> <bytes>` line
async fn read_value_line(
    line: &str,
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<String> {
    let mut parts = line.splitn(3, ' ');
    let _tag = parts.next();
    let len_token = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("bad VALUE reply: {}", line)))?;
    read_length_prefixed(len_token, parts.next().unwrap_or(""), reader).await
}

/// Parse one `KEY_VALUE <key> <len> <bytes>` line
async fn read_pair_line(
    line: &str,
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<(String, String)> {
    let mut parts = line.splitn(4, ' ');
    let _tag = parts.next();
    let key = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("bad KEY_VALUE reply: {}", line)))?;
    let len_token = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("bad KEY_VALUE reply: {}", line)))?;
    let value = read_length_prefixed(len_token, parts.next().unwrap_or(""), reader).await?;
    Ok((key.to_string(), value))
}

/// Parse one reply off the wire
async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> Result<RawReply> {
    let line = read_line_timed(reader)
        .await?
        .ok_or(Error::Network("no reply".into()))?;

    if line.starts_with("VALUE ") {
        let value = read_value_line(&line, reader).await?;
        return Ok(RawReply::Reply(ClientReply::Value(value)));
    }

    if line.starts_with("KEY_VALUE ") {
        let mut pairs = vec![read_pair_line(&line, reader).await?];
        loop {
            let line = read_line_timed(reader)
                .await?
                .ok_or(Error::Network("scan reply truncated".into()))?;
            if line == "END" {
                break;
            }
            if !line.starts_with("KEY_VALUE ") {
                return Err(Error::Protocol(format!(
                    "unexpected line in scan reply: {}",
                    line
                )));
            }
            pairs.push(read_pair_line(&line, reader).await?);
        }
        return Ok(RawReply::Reply(ClientReply::Pairs(pairs)));
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["OK", lsn] => {
            let lsn = lsn
                .parse()
                .map_err(|_| Error::Protocol(format!("bad LSN in reply: {}", line)))?;
            Ok(RawReply::Reply(ClientReply::Ok { lsn }))
        }
        ["NOT_FOUND"] => Ok(RawReply::Reply(ClientReply::NotFound)),
        ["OK_OPTIMIZED"] => Ok(RawReply::Reply(ClientReply::Optimized)),
        ["REDIRECT", host, port] => {
            let port = port
                .parse()
                .map_err(|_| Error::Protocol(format!("bad redirect port: {}", line)))?;
            Ok(RawReply::Redirect {
                host: host.to_string(),
                port,
            })
        }
        ["END"] => Ok(RawReply::Reply(ClientReply::Pairs(Vec::new()))),
        _ => Ok(RawReply::Reply(ClientReply::Error(line))),
    }
}

/// Query a node's control port for its cluster status lines
pub async fn query_cluster_status(host: &str, port: u16) -> Result<Vec<String>> {
    let stream = network::connect(host, port).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    network::write_all_timed(&mut write_half, b"CLUSTER_STATUS\n").await?;

    let mut lines = Vec::new();
    loop {
        match read_line_timed(&mut reader).await? {
            Some(line) if line == "END" => break,
            Some(line) if line.is_empty() => continue,
            Some(line) => lines.push(line),
            None => break,
        }
    }

    if lines.is_empty() {
        return Err(Error::Network("no status reply".into()));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, Store};
    use crate::replication::LeaderNode;
    use crate::state::{ClusterState, NodeRole};
    use std::sync::Arc;
    use tokio::sync::watch;
    use tempfile::tempdir;

    /// Leader + client round trip, including the length-prefixed reply
    /// forms the client must parse
    #[tokio::test]
    async fn test_client_against_leader() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> =
            Arc::new(KvStore::open(dir.path(), "node1", 5 * 1024 * 1024).unwrap());
        let state = Arc::new(ClusterState::new());
        state.set_role(NodeRole::Leader);

        let leader = LeaderNode::bind(store, state, 0, 0, 0, false).await.unwrap();
        let addr = leader.client_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&leader).run(shutdown_rx));

        let client = DbClient::new("127.0.0.1", addr.port());

        assert_eq!(
            client.set("greeting", "Hello World").await.unwrap(),
            ClientReply::Ok { lsn: 1 }
        );
        assert_eq!(
            client.get("greeting").await.unwrap(),
            ClientReply::Value("Hello World".to_string())
        );
        assert_eq!(client.get("nope").await.unwrap(), ClientReply::NotFound);

        client.set("a", "1").await.unwrap();
        client.set("b", "2").await.unwrap();
        match client.scan("a", 10, false).await.unwrap() {
            ClientReply::Pairs(pairs) => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["a", "b", "greeting"]);
            }
            other => panic!("expected pairs, got {:?}", other),
        }

        assert_eq!(
            client.delete("greeting").await.unwrap(),
            ClientReply::Ok { lsn: 4 }
        );
        assert_eq!(client.optimize().await.unwrap(), ClientReply::Optimized);

        let _ = shutdown_tx.send(true);
    }

    /// A read-only follower redirects mutations; the client follows once
    #[tokio::test]
    async fn test_client_follows_redirect() {
        use crate::replication::FollowerNode;

        let dir_leader = tempdir().unwrap();
        let leader_store: Arc<dyn Store> =
            Arc::new(KvStore::open(dir_leader.path(), "node1", 5 * 1024 * 1024).unwrap());
        let leader_state = Arc::new(ClusterState::new());
        leader_state.set_role(NodeRole::Leader);

        let leader = LeaderNode::bind(leader_store, leader_state, 0, 0, 0, false)
            .await
            .unwrap();
        let leader_port = leader.client_addr().unwrap().port();
        let (leader_shutdown, leader_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&leader).run(leader_rx));

        // Follower whose redirects point at the live leader. A dead
        // replication target is fine for this test.
        let dir_follower = tempdir().unwrap();
        let follower_store: Arc<dyn Store> =
            Arc::new(KvStore::open(dir_follower.path(), "node2", 5 * 1024 * 1024).unwrap());
        let follower = FollowerNode::bind(
            follower_store,
            Arc::new(ClusterState::new()),
            "127.0.0.1".to_string(),
            1, // nothing listens here; replication will just back off
            leader_port,
            0,
        )
        .await
        .unwrap();
        let read_port = follower.read_addr().unwrap().port();
        let (follower_shutdown, follower_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&follower).run(follower_rx));

        // A write against the read-only port lands on the leader
        let client = DbClient::new("127.0.0.1", read_port);
        assert_eq!(
            client.set("k", "v").await.unwrap(),
            ClientReply::Ok { lsn: 1 }
        );

        // Unknown commands on the read-only port surface as errors
        assert_eq!(
            client.optimize().await.unwrap(),
            ClientReply::Error("ERR_READ_ONLY".to_string())
        );

        let _ = leader_shutdown.send(true);
        let _ = follower_shutdown.send(true);
    }
}
