use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{PoolError, PoolResult};
use crate::types::UpstreamTemplate;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC client for a bitcoind-compatible daemon.
pub struct DaemonClient {
    http: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl DaemonClient {
    pub fn new(url: impl Into<String>, user: Option<String>, password: Option<String>) -> PoolResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
            user,
            password,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> PoolResult<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "1.0", "id": id, "method": method, "params": params });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        // bitcoind answers RPC errors with HTTP 500 and a JSON body.
        if !status.is_success() && text.trim().is_empty() {
            return Err(PoolError::Rpc(format!("{} returned HTTP {}", method, status)));
        }
        decode_response(method, &text)
    }

    pub async fn get_block_template(&self) -> PoolResult<UpstreamTemplate> {
        self.call(
            "getblocktemplate",
            json!([{ "capabilities": ["coinbasetxn", "workid", "coinbase/append"], "rules": ["segwit"] }]),
        )
        .await
    }

    /// Returns `None` when the daemon accepted the block, otherwise its
    /// rejection reason.
    pub async fn submit_block(&self, block_hex: &str) -> PoolResult<Option<String>> {
        self.call("submitblock", json!([block_hex])).await
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, text: &str) -> PoolResult<T> {
    let response: RpcResponse<Value> = serde_json::from_str(text)?;
    if let Some(error) = response.error {
        return Err(PoolError::Rpc(format!(
            "{} failed with code {}: {}",
            method, error.code, error.message
        )));
    }
    Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn decodes_results_and_errors() {
        let ok: Option<String> = decode_response("submitblock", r#"{"result":null,"error":null,"id":1}"#).unwrap();
        assert!(ok.is_none());

        let rejected: Option<String> =
            decode_response("submitblock", r#"{"result":"high-hash","error":null,"id":1}"#).unwrap();
        assert_eq!(rejected.as_deref(), Some("high-hash"));

        let err = decode_response::<Value>(
            "getblocktemplate",
            r#"{"result":null,"error":{"code":-10,"message":"Bitcoin is downloading blocks..."},"id":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Rpc(msg) if msg.contains("-10")));
    }

    #[tokio::test]
    async fn fetches_template_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // read headers and the full body before answering
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            assert!(request.starts_with(b"POST"));
            let body = r#"{"result":{"version":536870912,"previousblockhash":"00","bits":"207fffff","curtime":1,"height":1,"coinbasevalue":5000000000},"error":null,"id":1}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let client = DaemonClient::new(format!("http://{}", addr), Some("u".into()), Some("p".into())).unwrap();
        let template = client.get_block_template().await.unwrap();
        assert_eq!(template.bits, "207fffff");
        assert_eq!(template.coinbase_value, 5_000_000_000);
    }
}
