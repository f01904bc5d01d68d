//! Ledger client behavior against a scripted local JSON-RPC endpoint.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use orvyn_custody::types::Secret;
use orvyn_custody::{Config, Error, Ledger, LedgerClient};

const HASH: &str = "0xabababababababababababababababababababababababababababababababab";

/// Scripted responses for the stub node. Queued entries are consumed in
/// order; an empty queue falls back to a benign default.
#[derive(Default)]
struct Script {
    nonces: VecDeque<&'static str>,
    submissions: VecDeque<Result<&'static str, &'static str>>,
    calls: Vec<String>,
}

impl Script {
    fn count(&self, method: &str) -> usize {
        self.calls.iter().filter(|m| *m == method).count()
    }

    fn respond(&mut self, method: &str) -> Value {
        self.calls.push(method.to_string());
        let result = match method {
            "eth_chainId" => json!("0x539"),
            "eth_getTransactionCount" => json!(self.nonces.pop_front().unwrap_or("0x0")),
            "eth_sendRawTransaction" => match self.submissions.pop_front() {
                Some(Ok(hash)) => json!(hash),
                Some(Err(message)) => {
                    return json!({
                        "jsonrpc": "2.0",
                        "id": 1,
                        "error": { "code": -32000, "message": message },
                    });
                }
                None => json!(HASH),
            },
            // Never confirms.
            "eth_getTransactionReceipt" => Value::Null,
            _ => Value::Null,
        };
        json!({ "jsonrpc": "2.0", "id": 1, "result": result })
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Minimal single-purpose HTTP/1.1 server answering JSON-RPC POSTs from the
/// script. One connection per request (`Connection: close`).
async fn spawn_stub(script: Arc<Mutex<Script>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let script = script.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];

                let (body_start, content_length) = loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = find_blank_line(&buf) {
                        let headers = String::from_utf8_lossy(&buf[..pos]);
                        let mut len = 0usize;
                        for line in headers.lines() {
                            if let Some((name, value)) = line.split_once(':') {
                                if name.eq_ignore_ascii_case("content-length") {
                                    len = value.trim().parse().unwrap_or(0);
                                }
                            }
                        }
                        break (pos + 4, len);
                    }
                };
                while buf.len() < body_start + content_length {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                }

                let request: Value =
                    serde_json::from_slice(&buf[body_start..body_start + content_length])
                        .unwrap_or(Value::Null);
                let method = request
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let payload = script.lock().unwrap().respond(&method).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

fn stub_config(rpc_url: String) -> Config {
    Config {
        rpc_url,
        chain_id: 1337,
        gas_price: 50_000_000_000,
        gas_limit_native_transfer: 21_000,
        gas_limit_token_transfer: 500_000,
        gas_limit_buy: 210_000,
        token_contract: "0x3535353535353535353535353535353535353535".parse().unwrap(),
        token_decimals: 18,
        token_symbol: "ORV".into(),
        treasury_address: "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23".parse().unwrap(),
        treasury_secret: Secret::new(format!("0x{}", "46".repeat(32))),
        native_grant: 1_000_000_000_000_000_000,
        token_grant: 1_000_000_000_000_000_000_000,
        data_dir: PathBuf::from("."),
        receipt_timeout: Duration::from_millis(200),
        receipt_poll_interval: Duration::from_millis(20),
    }
}

async fn connect(script: Arc<Mutex<Script>>) -> LedgerClient {
    let url = spawn_stub(script).await;
    LedgerClient::connect(&stub_config(url)).await.unwrap()
}

fn sender_secret() -> String {
    format!("0x{}", "46".repeat(32))
}

#[tokio::test]
async fn stale_nonce_is_retried_once_with_a_fresh_nonce() {
    let script = Arc::new(Mutex::new(Script {
        nonces: VecDeque::from(["0x5", "0x6"]),
        submissions: VecDeque::from([Err("nonce too low: next nonce is 6"), Ok(HASH)]),
        ..Default::default()
    }));
    let client = connect(script.clone()).await;

    let sender = orvyn_custody::eth::address_of(&sender_secret()).unwrap();
    let recipient = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
    let hash = client
        .send_native(&sender_secret(), sender, recipient, 1)
        .await
        .unwrap();
    assert_eq!(hash.to_string(), HASH);

    // The nonce was re-read for the retry, not reused.
    let script = script.lock().unwrap();
    assert_eq!(script.count("eth_getTransactionCount"), 2);
    assert_eq!(script.count("eth_sendRawTransaction"), 2);
}

#[tokio::test]
async fn second_nonce_conflict_surfaces_without_further_retries() {
    let script = Arc::new(Mutex::new(Script {
        nonces: VecDeque::from(["0x5", "0x6"]),
        submissions: VecDeque::from([Err("nonce too low"), Err("already known")]),
        ..Default::default()
    }));
    let client = connect(script.clone()).await;

    let sender = orvyn_custody::eth::address_of(&sender_secret()).unwrap();
    let recipient = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
    let err = client
        .send_native(&sender_secret(), sender, recipient, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NonceConflict));

    // Exactly one retry: two submissions total, then the error surfaces.
    assert_eq!(script.lock().unwrap().count("eth_sendRawTransaction"), 2);
}

#[tokio::test]
async fn rejected_submission_is_not_retried() {
    let script = Arc::new(Mutex::new(Script {
        submissions: VecDeque::from([Err("insufficient funds for gas * price + value")]),
        ..Default::default()
    }));
    let client = connect(script.clone()).await;

    let sender = orvyn_custody::eth::address_of(&sender_secret()).unwrap();
    let recipient = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
    let err = client
        .send_native(&sender_secret(), sender, recipient, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LedgerRejected(_)));
    assert_eq!(script.lock().unwrap().count("eth_sendRawTransaction"), 1);
}

#[tokio::test]
async fn unconfirmed_receipt_times_out_as_unknown_outcome() {
    let script = Arc::new(Mutex::new(Script::default()));
    let client = connect(script.clone()).await;

    let hash = HASH.parse().unwrap();
    let started = Instant::now();
    let err = client.await_receipt(hash).await.unwrap_err();
    let waited = started.elapsed();

    match err {
        Error::ReceiptTimeout(h) => assert_eq!(h, hash),
        other => panic!("expected ReceiptTimeout, got {other:?}"),
    }
    // Bounded by the configured timeout, with headroom for polling jitter.
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(5));
    assert!(script.lock().unwrap().count("eth_getTransactionReceipt") >= 2);
}

#[tokio::test]
async fn chain_id_mismatch_is_fatal_at_connect() {
    // The stub always reports 1337; configure something else.
    let script = Arc::new(Mutex::new(Script::default()));
    let url = spawn_stub(script).await;
    let mut config = stub_config(url);
    config.chain_id = 1;

    let err = LedgerClient::connect(&config).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
