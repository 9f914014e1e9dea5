//! Client-side helpers for the worker protocol: typed requests that follow
//! REDIRECT responses to the current leader.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::raft::ClientAddr;

const MAX_ATTEMPTS: usize = 5;

pub struct Client {
    addr: ClientAddr,
    timeout: Duration,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16) -> Client {
        Client {
            addr: (host.into(), port),
            timeout: Duration::from_secs(30),
        }
    }

    /// Training can take a while; callers may widen the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Client {
        self.timeout = timeout;
        self
    }

    pub async fn train(&self, inputs: &[Vec<f64>], outputs: &[Vec<f64>]) -> Result<Uuid> {
        let response = self
            .request(
                json!({"type": "TRAIN", "inputs": inputs, "outputs": outputs}),
                None,
            )
            .await?;
        Ok(serde_json::from_value(response["model_id"].clone())?)
    }

    pub async fn predict(&self, model_id: Uuid, input: &[f64]) -> Result<Vec<f64>> {
        let response = self
            .request(
                json!({"type": "PREDICT", "model_id": model_id, "input": input}),
                None,
            )
            .await?;
        Ok(serde_json::from_value(response["output"].clone())?)
    }

    pub async fn list_models(&self) -> Result<Vec<Uuid>> {
        let response = self.request(json!({"type": "LIST_MODELS"}), None).await?;
        Ok(serde_json::from_value(response["models"].clone())?)
    }

    /// Uploads a file with the legacy framing: a JSON header object followed
    /// immediately by the raw bytes, no newline in between.
    pub async fn put_file(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        self.request(
            json!({"type": "PUT", "filename": filename, "size": bytes.len()}),
            Some(bytes),
        )
        .await?;
        Ok(())
    }

    async fn request(&self, header: Value, payload: Option<&[u8]>) -> Result<Value> {
        let mut addr = self.addr.clone();
        for _ in 0..MAX_ATTEMPTS {
            let response = tokio::time::timeout(
                self.timeout,
                one_request(&addr, &header, payload),
            )
            .await
            .map_err(|_| Error::Server(format!("request to {}:{} timed out", addr.0, addr.1)))??;

            match response["status"].as_str() {
                Some("OK") => return Ok(response),
                Some("REDIRECT") => {
                    let leader = parse_leader(&response)
                        .ok_or_else(|| Error::Server("redirect without leader".into()))?;
                    debug!(host = %leader.0, port = leader.1, "following redirect");
                    addr = leader;
                }
                Some("FAIL") => return Err(Error::Server("replication failed".into())),
                Some("ERROR") => {
                    let message = response["message"].as_str().unwrap_or("unknown error");
                    return Err(Error::Server(message.to_string()));
                }
                _ => return Err(Error::Server(format!("unrecognized response {response}"))),
            }
        }
        Err(Error::TooManyRedirects(MAX_ATTEMPTS))
    }
}

async fn one_request(addr: &ClientAddr, header: &Value, payload: Option<&[u8]>) -> Result<Value> {
    let stream = TcpStream::connect((addr.0.as_str(), addr.1)).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut bytes = serde_json::to_vec(header)?;
    match payload {
        // Legacy framing: raw bytes follow the header directly.
        Some(payload) => bytes.extend_from_slice(payload),
        None => bytes.push(b'\n'),
    }
    write_half.write_all(&bytes).await?;
    write_half.flush().await?;

    let mut line = String::new();
    let n = BufReader::new(read_half).read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::TruncatedFrame);
    }
    Ok(serde_json::from_str(line.trim())?)
}

fn parse_leader(response: &Value) -> Option<ClientAddr> {
    let leader = response.get("leader")?;
    let host = leader.get(0)?.as_str()?.to_string();
    let port = u16::try_from(leader.get(1)?.as_u64()?).ok()?;
    Some((host, port))
}
