//! Client request front-end. Terminates the line-delimited JSON protocol on
//! the client port, answers reads from the worker directly, and funnels
//! writes through consensus, translating the outcome into OK / ERROR /
//! REDIRECT / FAIL.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::raft::{ClientAddr, RaftNode, SubmitOutcome};
use crate::worker::{Command, Worker};

/// Uploads and training payloads are modest; anything larger is a framing bug.
const MAX_HEADER_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct TrainRequest {
    inputs: Vec<Vec<f64>>,
    outputs: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    model_id: Uuid,
    input: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct PutRequest {
    filename: String,
    size: usize,
}

#[derive(Clone)]
pub struct FrontEnd {
    node: RaftNode,
    worker: Arc<Worker>,
}

impl FrontEnd {
    pub fn new(node: RaftNode, worker: Arc<Worker>) -> FrontEnd {
        FrontEnd { node, worker }
    }

    /// Accept loop; each connection carries exactly one request.
    pub async fn serve(&self, listener: TcpListener) {
        let mut shutdown = self.node.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let frontend = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = frontend.handle_connection(stream).await {
                                debug!(%addr, %err, "client connection dropped");
                            }
                        });
                    }
                    Err(err) => warn!(%err, "client accept failed"),
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (header, leftover) = read_header(&mut read_half).await?;

        let request_type = header
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(request_type, "client request");

        let response = match request_type.as_str() {
            "TRAIN" => self.handle_train(header).await,
            "PREDICT" => self.handle_predict(header).await,
            "LIST_MODELS" => ok(json!({"models": self.worker.list_models().await})),
            "PUT" => self.handle_put(header, leftover, &mut read_half).await?,
            other => error(format!("unknown request type {other:?}")),
        };

        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        write_half.write_all(&bytes).await?;
        Ok(())
    }

    async fn handle_train(&self, header: Value) -> Value {
        let req: TrainRequest = match serde_json::from_value(header) {
            Ok(req) => req,
            Err(err) => return error(format!("bad TRAIN request: {err}")),
        };
        // Reject non-leader writes before paying for training.
        if !self.node.is_leader().await {
            return self.not_leader(self.node.leader_hint().await);
        }

        let model = match self.worker.train(req.inputs, req.outputs).await {
            Ok(model) => model,
            Err(err) => return error(err.to_string()),
        };
        let model_id = model.id;
        let command = match (Command::ModelTrained { model }).into_value() {
            Ok(command) => command,
            Err(err) => return error(err.to_string()),
        };

        match self.node.submit(command).await {
            SubmitOutcome::Committed(_) => ok(json!({"model_id": model_id})),
            SubmitOutcome::NotCommitted => error("replication failed"),
            SubmitOutcome::NotLeader(hint) => self.not_leader(hint),
        }
    }

    async fn handle_predict(&self, header: Value) -> Value {
        let req: PredictRequest = match serde_json::from_value(header) {
            Ok(req) => req,
            Err(err) => return error(format!("bad PREDICT request: {err}")),
        };
        match self.worker.predict(req.model_id, &req.input).await {
            Ok(output) => ok(json!({"output": output})),
            Err(err) => error(err.to_string()),
        }
    }

    /// Legacy upload framing: the header object is followed by `size` raw
    /// bytes on the same connection.
    async fn handle_put(
        &self,
        header: Value,
        leftover: Vec<u8>,
        read_half: &mut OwnedReadHalf,
    ) -> Result<Value> {
        let req: PutRequest = match serde_json::from_value(header) {
            Ok(req) => req,
            Err(err) => return Ok(error(format!("bad PUT request: {err}"))),
        };
        if req.size > MAX_HEADER_BYTES {
            return Ok(error(format!("upload of {} bytes exceeds limit", req.size)));
        }

        let mut payload = leftover;
        if payload.len() < req.size {
            let missing = req.size - payload.len();
            let start = payload.len();
            payload.resize(req.size, 0);
            read_half.read_exact(&mut payload[start..][..missing]).await?;
        } else {
            payload.truncate(req.size);
        }

        if !self.node.is_leader().await {
            return Ok(self.not_leader(self.node.leader_hint().await));
        }

        let command = Command::Put {
            filename: req.filename,
            data_b64: BASE64.encode(&payload),
        };
        let command = match command.into_value() {
            Ok(command) => command,
            Err(err) => return Ok(error(err.to_string())),
        };

        Ok(match self.node.submit(command).await {
            SubmitOutcome::Committed(_) => ok(json!({})),
            // Legacy clients expect a bare FAIL when replication times out.
            SubmitOutcome::NotCommitted => json!({"status": "FAIL"}),
            SubmitOutcome::NotLeader(hint) => self.not_leader(hint),
        })
    }

    fn not_leader(&self, hint: Option<ClientAddr>) -> Value {
        match hint {
            Some(leader) => json!({"status": "REDIRECT", "leader": leader}),
            None => error("no leader known"),
        }
    }
}

fn ok(extra: Value) -> Value {
    let mut response = json!({"status": "OK"});
    if let (Some(map), Some(fields)) = (response.as_object_mut(), extra.as_object()) {
        for (key, value) in fields {
            map.insert(key.clone(), value.clone());
        }
    }
    response
}

fn error(message: impl std::fmt::Display) -> Value {
    json!({"status": "ERROR", "message": message.to_string()})
}

/// Reads the first complete JSON value off the stream. Whatever follows it
/// is returned as the start of a legacy upload payload. PUT headers are not
/// newline-terminated: the raw bytes begin immediately after the object, so
/// a leading newline there is payload. For every other request type the
/// newline is framing and gets stripped.
async fn read_header<R: AsyncRead + Unpin>(stream: &mut R) -> Result<(Value, Vec<u8>)> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    loop {
        if let Some((value, consumed)) = parse_prefix(&buf)? {
            let mut rest = buf.split_off(consumed);
            let legacy_put = value.get("type").and_then(Value::as_str) == Some("PUT");
            if !legacy_put {
                if rest.starts_with(b"\r\n") {
                    rest.drain(..2);
                } else if rest.starts_with(b"\n") {
                    rest.drain(..1);
                }
            }
            return Ok((value, rest));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::OversizedFrame(MAX_HEADER_BYTES));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::TruncatedFrame);
        }
    }
}

fn parse_prefix(buf: &[u8]) -> Result<Option<(Value, usize)>> {
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    match values.next() {
        Some(Ok(value)) => {
            let consumed = values.byte_offset();
            Ok(Some((value, consumed)))
        }
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(err.into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_newline_terminated_header() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(b"{\"type\":\"LIST_MODELS\"}\n")
            .await
            .unwrap();

        let (header, leftover) = read_header(&mut server).await.unwrap();
        assert_eq!(header["type"], "LIST_MODELS");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn splits_legacy_header_from_payload() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(b"{\"type\":\"PUT\",\"filename\":\"a.txt\",\"size\":5}hello")
            .await
            .unwrap();

        let (header, leftover) = read_header(&mut server).await.unwrap();
        assert_eq!(header["size"], 5);
        assert_eq!(leftover, b"hello");
    }

    #[tokio::test]
    async fn put_payload_starting_with_newline_is_preserved() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(b"{\"type\":\"PUT\",\"filename\":\"a.bin\",\"size\":3}\nhi")
            .await
            .unwrap();

        let (header, leftover) = read_header(&mut server).await.unwrap();
        assert_eq!(header["type"], "PUT");
        assert_eq!(leftover, b"\nhi");
    }

    #[tokio::test]
    async fn header_may_arrive_in_pieces() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let writer = tokio::spawn(async move {
            client.write_all(b"{\"type\":\"LIS").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            client.write_all(b"T_MODELS\"}\n").await.unwrap();
        });

        let (header, _) = read_header(&mut server).await.unwrap();
        assert_eq!(header["type"], "LIST_MODELS");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_before_header_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"{\"type\":").await.unwrap();
        drop(client);
        assert!(read_header(&mut server).await.is_err());
    }
}
