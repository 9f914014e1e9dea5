//! Consensus TCP listener: one line-delimited JSON request and one reply per
//! connection.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::rpc::Message;
use super::RaftNode;

pub(crate) async fn run(node: RaftNode, listener: TcpListener) {
    let mut shutdown = node.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let node = node.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(node, stream).await {
                            debug!(%addr, %err, "consensus connection dropped");
                        }
                    });
                }
                Err(err) => warn!(%err, "consensus accept failed"),
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn handle_connection(node: RaftNode, stream: TcpStream) -> crate::error::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    let reply = match serde_json::from_str(line.trim())? {
        Message::RequestVote(req) => Message::VoteResponse(node.handle_request_vote(req).await),
        Message::AppendEntries(req) => {
            Message::AppendResponse(node.handle_append_entries(req).await)
        }
        other => {
            // Responses never arrive unsolicited on this port.
            debug!(?other, "unexpected message on consensus port");
            return Ok(());
        }
    };

    let mut payload = serde_json::to_vec(&reply)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    Ok(())
}
