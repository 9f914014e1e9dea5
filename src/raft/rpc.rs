//! Consensus wire protocol: line-delimited JSON over TCP, one request and
//! one response per connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::LogEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "REQUEST_VOTE")]
    RequestVote(RequestVote),
    #[serde(rename = "VOTE_RESPONSE")]
    VoteResponse(VoteResponse),
    #[serde(rename = "APPEND_ENTRIES")]
    AppendEntries(AppendEntries),
    #[serde(rename = "APPEND_RESPONSE")]
    AppendResponse(AppendResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: i64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: u64,
    /// Client-facing address of the leader, so followers can answer redirects
    /// without a second lookup.
    pub leader_id: (String, u16),
    pub entries: Vec<LogEntry>,
    pub prev_log_index: i64,
    pub prev_log_term: u64,
    pub leader_commit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_index: Option<i64>,
}

/// Sends one RPC to a peer and waits for the single-line reply. Transport
/// failures of any kind (refused, timeout, malformed reply) collapse to
/// `None`; the caller decides whether to retry.
pub async fn call(peer: &str, msg: &Message, timeout: Duration) -> Option<Message> {
    match tokio::time::timeout(timeout, call_inner(peer, msg)).await {
        Ok(Ok(reply)) => Some(reply),
        Ok(Err(err)) => {
            debug!(peer, %err, "rpc failed");
            None
        }
        Err(_) => {
            debug!(peer, "rpc timed out");
            None
        }
    }
}

async fn call_inner(peer: &str, msg: &Message) -> crate::error::Result<Message> {
    let stream = TcpStream::connect(peer).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut payload = serde_json::to_vec(msg)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    write_half.flush().await?;

    let mut line = String::new();
    let mut reader = BufReader::new(read_half);
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(crate::error::Error::TruncatedFrame);
    }
    Ok(serde_json::from_str(line.trim())?)
}
