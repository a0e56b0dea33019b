//! Ledger client over a Cosmos REST gateway, a Tendermint RPC WebSocket and
//! an external signing service.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{
    BroadcastResult, Coin, ContractJob, EventFilter, EventStream, Ledger, LedgerCall, LedgerEvent,
    Transfer, TxRecord,
};
use crate::config::LedgerConfig;
use crate::error::LedgerError;

const MSG_SEND_TYPE: &str = "/cosmos.bank.v1beta1.MsgSend";

/// Buffered events per subscription.
const EVENT_BUFFER: usize = 64;

/// Interval between WebSocket pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A silent connection is considered dead after this long.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Ledger client backed by HTTP and WebSocket endpoints.
pub struct RestLedger {
    client: reqwest::Client,
    rest_url: String,
    ws_url: String,
    signer_url: String,
    signer_token: Option<SecretString>,
    ping_interval: Duration,
    read_timeout: Duration,
}

impl RestLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            ws_url: config.ws_url.clone(),
            signer_url: config.signer_url.trim_end_matches('/').to_string(),
            signer_token: config.signer_token.clone(),
            ping_interval: PING_INTERVAL,
            read_timeout: READ_TIMEOUT,
        })
    }

    /// Override the subscription keepalive: ping every `ping_interval`, drop
    /// the connection after `read_timeout` without any incoming frame.
    pub fn with_keepalive(mut self, ping_interval: Duration, read_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.read_timeout = read_timeout;
        self
    }

    async fn get_json(&self, url: &str) -> Result<reqwest::Response, LedgerError> {
        debug!(url, "Ledger GET");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LedgerError::Request(format!("{url} returned {status}: {body}")))
    }
}

// ── Wire formats ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TxResponseEnvelope {
    #[serde(default)]
    tx: Option<TxEnvelope>,
    tx_response: TxResponse,
}

#[derive(Deserialize)]
struct TxEnvelope {
    body: TxBody,
}

#[derive(Deserialize)]
struct TxBody {
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Deserialize)]
struct TxResponse {
    txhash: String,
    #[serde(default)]
    code: u32,
    height: String,
    #[serde(default)]
    raw_log: String,
}

#[derive(Deserialize)]
struct MsgSend {
    from_address: String,
    to_address: String,
    amount: Vec<Coin>,
}

#[derive(Deserialize)]
struct LatestBlock {
    #[serde(default)]
    block: Option<BlockEnvelope>,
    #[serde(default)]
    sdk_block: Option<BlockEnvelope>,
}

#[derive(Deserialize)]
struct BlockEnvelope {
    header: BlockHeader,
}

#[derive(Deserialize)]
struct BlockHeader {
    height: String,
}

#[derive(Deserialize)]
struct SmartQueryResponse<T> {
    data: T,
}

fn parse_height(raw: &str) -> Result<u64, LedgerError> {
    raw.trim()
        .parse()
        .map_err(|_| LedgerError::InvalidResponse(format!("invalid block height '{raw}'")))
}

fn transfers_from(messages: &[Value]) -> Vec<Transfer> {
    messages
        .iter()
        .filter(|m| m.get("@type").and_then(Value::as_str) == Some(MSG_SEND_TYPE))
        .filter_map(|m| serde_json::from_value::<MsgSend>(m.clone()).ok())
        .map(|m| Transfer {
            from: m.from_address,
            to: m.to_address,
            amount: m.amount,
        })
        .collect()
}

/// Extract job IDs from a Tendermint subscription message.
///
/// Handles both the flattened `result.events` map and the nested
/// `TxResult` event list.
pub fn job_ids_from_message(message: &Value) -> Vec<u64> {
    let Some(result) = message.get("result") else {
        return Vec::new();
    };

    if let Some(ids) = result
        .get("events")
        .and_then(|e| e.get("wasm.job_id"))
        .and_then(Value::as_array)
    {
        return ids
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|s| s.parse().ok())
            .take(1)
            .collect();
    }

    result
        .pointer("/data/value/TxResult/result/events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .filter(|e| e.get("type").and_then(Value::as_str) == Some("wasm"))
                .filter_map(|e| {
                    e.get("attributes")?
                        .as_array()?
                        .iter()
                        .find(|a| a.get("key").and_then(Value::as_str) == Some("job_id"))?
                        .get("value")?
                        .as_str()?
                        .parse()
                        .ok()
                })
                .filter(|id| *id > 0)
                .collect()
        })
        .unwrap_or_default()
}

// ── Ledger impl ─────────────────────────────────────────────────────

#[async_trait]
impl Ledger for RestLedger {
    async fn query_tx(&self, hash: &str) -> Result<TxRecord, LedgerError> {
        let url = format!("{}/cosmos/tx/v1beta1/txs/{}", self.rest_url, hash);
        let response = self.get_json(&url).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::TxNotFound(hash.to_string()));
        }

        let envelope: TxResponseEnvelope = response.json().await?;
        let transfers = envelope
            .tx
            .map(|tx| transfers_from(&tx.body.messages))
            .unwrap_or_default();

        Ok(TxRecord {
            hash: envelope.tx_response.txhash,
            code: envelope.tx_response.code,
            height: parse_height(&envelope.tx_response.height)?,
            transfers,
            raw_log: envelope.tx_response.raw_log,
        })
    }

    async fn latest_height(&self) -> Result<u64, LedgerError> {
        let url = format!("{}/cosmos/base/tendermint/v1beta1/blocks/latest", self.rest_url);
        let response = self.get_json(&url).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::InvalidResponse("latest block unavailable".to_string()));
        }
        let latest: LatestBlock = response.json().await?;
        let header = latest
            .sdk_block
            .or(latest.block)
            .ok_or_else(|| LedgerError::InvalidResponse("missing block header".to_string()))?
            .header;
        parse_height(&header.height)
    }

    async fn execute(&self, call: LedgerCall) -> Result<BroadcastResult, LedgerError> {
        let url = format!("{}/execute", self.signer_url);
        let mut request = self.client.post(&url).json(&call);
        if let Some(token) = &self.signer_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Request(format!("signer returned {status}: {body}")));
        }

        let result: BroadcastResult = response.json().await?;
        if result.code != 0 {
            return Err(LedgerError::BroadcastRejected {
                code: result.code,
                log: result.raw_log,
            });
        }
        info!(action = call.describe(), tx_hash = %result.tx_hash, "Ledger call broadcast");
        Ok(result)
    }

    async fn contract_job(&self, contract: &str, job_id: u64) -> Result<ContractJob, LedgerError> {
        let query = serde_json::json!({"get_job": {"job_id": job_id}});
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(query.to_string());
        let url = format!(
            "{}/cosmwasm/wasm/v1/contract/{}/smart/{}",
            self.rest_url, contract, encoded
        );
        let response = self.get_json(&url).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::InvalidResponse(format!(
                "contract job {job_id} not found"
            )));
        }
        let wrapped: SmartQueryResponse<ContractJob> = response.json().await?;
        Ok(wrapped.data)
    }

    async fn subscribe(&self, filter: &EventFilter) -> Result<EventStream, LedgerError> {
        let (mut ws, _response) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| LedgerError::Subscription(format!("connect to {}: {e}", self.ws_url)))?;

        let query = filter.query();
        let subscribe = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "id": 1,
            "params": {"query": query},
        });
        ws.send(Message::Text(subscribe.to_string().into()))
            .await
            .map_err(|e| LedgerError::Subscription(format!("subscribe: {e}")))?;
        info!(url = %self.ws_url, %query, "Subscribed to ledger events");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (mut sink, mut stream) = ws.split();
        let ping_interval = self.ping_interval;
        let read_timeout = self.read_timeout;
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            ping.tick().await;
            // Only incoming frames (pongs included) push the deadline out.
            let silence = tokio::time::sleep(read_timeout);
            tokio::pin!(silence);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = &mut silence => {
                        warn!(
                            timeout_secs = read_timeout.as_secs(),
                            "Ledger subscription silent, dropping connection"
                        );
                        break;
                    }
                    _ = ping.tick() => {
                        if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                            warn!(error = %e, "Ledger ping failed");
                            break;
                        }
                    }
                    frame = stream.next() => {
                        let message = match frame {
                            None => break,
                            Some(Err(e)) => {
                                warn!(error = %e, "Ledger subscription error");
                                break;
                            }
                            Some(Ok(message)) => message,
                        };
                        silence.as_mut().reset(Instant::now() + read_timeout);
                        match message {
                            Message::Text(text) => {
                                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                    debug!("Ignoring non-JSON ledger frame");
                                    continue;
                                };
                                for job_id in job_ids_from_message(&value) {
                                    if tx.send(LedgerEvent { job_id }).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
            }
            debug!("Ledger subscription closed");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ContractMsg;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::net::TcpListener;
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ledger(rest: &str, ws: &str, signer: &str, token: Option<&str>) -> RestLedger {
        RestLedger::new(&LedgerConfig {
            rest_url: rest.to_string(),
            ws_url: ws.to_string(),
            signer_url: signer.to_string(),
            signer_token: token.map(|t| SecretString::from(t.to_string())),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn query_tx_parses_bank_transfers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cosmos/tx/v1beta1/txs/ABC123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tx": {"body": {"messages": [
                    {
                        "@type": "/cosmos.bank.v1beta1.MsgSend",
                        "from_address": "medas1client",
                        "to_address": "medas1service",
                        "amount": [{"denom": "umedas", "amount": "13000"}]
                    },
                    {"@type": "/cosmwasm.wasm.v1.MsgExecuteContract", "sender": "medas1client"}
                ]}},
                "tx_response": {"txhash": "ABC123", "height": "1042", "code": 0, "raw_log": ""}
            })))
            .mount(&server)
            .await;

        let tx = ledger(&server.uri(), "ws://unused", "http://unused", None)
            .query_tx("ABC123")
            .await
            .unwrap();
        assert_eq!(tx.height, 1042);
        assert!(tx.succeeded());
        assert_eq!(tx.transfers.len(), 1);
        assert_eq!(tx.transfers[0].to, "medas1service");
        assert_eq!(tx.transfers[0].amount_of("umedas"), 13_000);
    }

    #[tokio::test]
    async fn query_tx_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/cosmos/tx/v1beta1/txs/.*$"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = ledger(&server.uri(), "ws://unused", "http://unused", None)
            .query_tx("MISSING")
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::TxNotFound("MISSING".to_string()));
    }

    #[tokio::test]
    async fn latest_height_from_sdk_block() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cosmos/base/tendermint/v1beta1/blocks/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "block": {"header": {"height": "99"}},
                "sdk_block": {"header": {"height": "100"}}
            })))
            .mount(&server)
            .await;

        let height = ledger(&server.uri(), "ws://unused", "http://unused", None)
            .latest_height()
            .await
            .unwrap();
        assert_eq!(height, 100);
    }

    #[tokio::test]
    async fn server_errors_are_request_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = ledger(&server.uri(), "ws://unused", "http://unused", None)
            .latest_height()
            .await
            .unwrap_err();
        assert_matches!(err, LedgerError::Request(msg) if msg.contains("overloaded"));
    }

    #[tokio::test]
    async fn contract_job_uses_smart_query() {
        let server = MockServer::start().await;
        let encoded = base64::engine::general_purpose::URL_SAFE
            .encode(json!({"get_job": {"job_id": 5}}).to_string());
        Mock::given(method("GET"))
            .and(path(format!("/cosmwasm/wasm/v1/contract/medas1contract/smart/{encoded}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": 5,
                    "client": "medas1client",
                    "provider": "medas1provider",
                    "job_type": "pi_calculation",
                    "parameters": "{\"digits\":100}",
                    "payment_amount": "25000",
                    "status": "submitted"
                }
            })))
            .mount(&server)
            .await;

        let job = ledger(&server.uri(), "ws://unused", "http://unused", None)
            .contract_job("medas1contract", 5)
            .await
            .unwrap();
        assert_eq!(job.client, "medas1client");
        assert_eq!(job.parameters, "{\"digits\":100}");
    }

    #[tokio::test]
    async fn execute_posts_to_signer_with_token() {
        let signer = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tx_hash": "FEED", "code": 0, "height": 12
            })))
            .expect(1)
            .mount(&signer)
            .await;

        let result = ledger("http://unused", "ws://unused", &signer.uri(), Some("s3cret"))
            .execute(LedgerCall::Contract {
                contract: "medas1contract".to_string(),
                msg: ContractMsg::HeartBeat {},
            })
            .await
            .unwrap();
        assert_eq!(result.tx_hash, "FEED");
        assert_eq!(result.height, Some(12));
    }

    #[tokio::test]
    async fn execute_rejected_broadcast() {
        let signer = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/execute"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tx_hash": "BAD", "code": 5, "raw_log": "insufficient funds"
            })))
            .mount(&signer)
            .await;

        let err = ledger("http://unused", "ws://unused", &signer.uri(), None)
            .execute(LedgerCall::Send {
                to: "medas1pool".to_string(),
                amount: Coin::new("umedas", 10),
                memo: "fee".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::BroadcastRejected {
                code: 5,
                log: "insufficient funds".to_string()
            }
        );
    }

    #[test]
    fn job_ids_from_both_message_shapes() {
        let flat = json!({"result": {"events": {"wasm.job_id": ["17"], "wasm.action": ["submit_job"]}}});
        assert_eq!(job_ids_from_message(&flat), vec![17]);

        let nested = json!({"result": {"data": {"value": {"TxResult": {"result": {"events": [
            {"type": "message", "attributes": [{"key": "job_id", "value": "1"}]},
            {"type": "wasm", "attributes": [
                {"key": "action", "value": "submit_job"},
                {"key": "job_id", "value": "23"}
            ]}
        ]}}}}}});
        assert_eq!(job_ids_from_message(&nested), vec![23]);

        assert!(job_ids_from_message(&json!({"result": {}})).is_empty());
        assert!(job_ids_from_message(&json!({"jsonrpc": "2.0", "id": 1})).is_empty());
    }

    #[tokio::test]
    async fn subscribe_streams_job_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let request = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str::<Value>(&text).unwrap(),
                other => panic!("unexpected frame {other:?}"),
            };
            assert_eq!(request["method"], "subscribe");
            assert!(request["params"]["query"]
                .as_str()
                .unwrap()
                .contains("wasm.provider='medas1provider'"));

            // Subscription acknowledgement carries no events.
            ws.send(Message::Text(json!({"jsonrpc": "2.0", "id": 1, "result": {}}).to_string().into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                json!({"result": {"events": {"wasm.job_id": ["8"]}}}).to_string().into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let ledger = ledger("http://unused", &format!("ws://127.0.0.1:{port}"), "http://unused", None);
        let mut events = ledger
            .subscribe(&EventFilter::submitted_jobs("medas1contract", "medas1provider"))
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(LedgerEvent { job_id: 8 }));
        assert_eq!(events.recv().await, None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_subscription_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.next().await.unwrap().unwrap();
            // Keep the socket open but never read or answer again, so the
            // client's pings go unanswered.
            let _ = done_rx.await;
            drop(ws);
        });

        let ledger = ledger("http://unused", &format!("ws://127.0.0.1:{port}"), "http://unused", None)
            .with_keepalive(Duration::from_millis(20), Duration::from_millis(150));
        let mut events = ledger
            .subscribe(&EventFilter::submitted_jobs("medas1contract", "medas1provider"))
            .await
            .unwrap();

        // Several pings go out before the deadline; the feed still closes.
        let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("silent subscription was never dropped");
        assert_eq!(closed, None);

        let _ = done_tx.send(());
        server.await.unwrap();
    }
}
