/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities, fixtures, and mock helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for kis-adapter tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kis_adapter::{
    AccessToken, AppKey, ClientConfig, Domain, KisCredentials, RetryPolicy, TokenCache,
    TokenResponse,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const REAL_APPKEY: &str = "PSrealappkey0001";
pub const REAL_SECRET: &str = "real-secret-value-0001";
pub const VIRTUAL_APPKEY: &str = "PSvirtualappkey1";
pub const VIRTUAL_SECRET: &str = "virtual-secret-value-1";

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

pub fn real_key() -> AppKey {
    AppKey::new(REAL_APPKEY, REAL_SECRET)
}

pub fn real_credentials() -> KisCredentials {
    KisCredentials::real("hts01", "50000000-01", real_key()).unwrap()
}

pub fn virtual_credentials() -> KisCredentials {
    KisCredentials::virtual_account(
        "hts01",
        "50000000-01",
        AppKey::new(VIRTUAL_APPKEY, VIRTUAL_SECRET),
        None,
    )
    .unwrap()
}

/// Both REST domains on the mock server, short retry delays.
pub fn fast_config(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::default().with_base_urls(&server.uri(), &server.uri());
    config.retry = RetryPolicy::rest()
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(50))
        .with_jitter(0.0);
    config.throttle_delay = Duration::from_millis(10);
    config
}

pub fn temp_dir() -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("kis-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&path).unwrap();
    path
}

/// Write a token for `key` straight into the cache directory.
pub fn seed_token(dir: &Path, domain: Domain, key: &AppKey, token: &str, expires_in: i64) {
    let token = AccessToken::from_response(
        domain,
        TokenResponse {
            access_token: token.to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
            access_token_token_expired: None,
        },
    );
    TokenCache::new(dir).store(&token, key).unwrap();
}

/// Token endpoint handing out `token`, expected `times` times.
pub async fn mount_token(server: &MockServer, token: &str, times: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth2/tokenP"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": 86400,
            "access_token_token_expired": "2099-01-01 00:00:00",
        })))
        .expect(times)
        .mount(server)
        .await;
}

pub fn ok_body(output: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "rt_cd": "0",
        "msg_cd": "MCA00000",
        "msg1": "정상처리 되었습니다.",
        "output": output,
    })
}

pub fn error_body(msg_cd: &str, msg1: &str) -> serde_json::Value {
    serde_json::json!({"rt_cd": "1", "msg_cd": msg_cd, "msg1": msg1})
}

/// One accepted connection on the local WebSocket server.
pub struct WsPeer {
    /// Text frames the client sent.
    pub incoming: mpsc::UnboundedReceiver<String>,
    /// Frames to push to the client. Dropping it cuts the connection without a close frame.
    pub outgoing: mpsc::UnboundedSender<Message>,
}

impl WsPeer {
    pub async fn next_text(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), self.incoming.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn send_text(&self, text: &str) {
        self.outgoing.send(Message::Text(text.to_string().into())).unwrap();
    }
}

/// Local WebSocket server standing in for the streaming endpoint.
pub struct WsServer {
    pub url: String,
    peers: mpsc::UnboundedReceiver<WsPeer>,
}

impl WsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (peers_tx, peers) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let Ok(stream) = tokio_tungstenite::accept_async(socket).await else {
                    continue;
                };
                let (incoming_tx, incoming) = mpsc::unbounded_channel();
                let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
                if peers_tx.send(WsPeer { incoming, outgoing }).is_err() {
                    break;
                }

                tokio::spawn(async move {
                    let (mut write, mut read) = stream.split();
                    loop {
                        tokio::select! {
                            outbound = outgoing_rx.recv() => match outbound {
                                Some(message) => {
                                    if write.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                            inbound = read.next() => match inbound {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = incoming_tx.send(text.as_str().to_string());
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Self { url, peers }
    }

    pub async fn next_peer(&mut self) -> Option<WsPeer> {
        self.next_peer_within(Duration::from_secs(5)).await
    }

    pub async fn next_peer_within(&mut self, wait: Duration) -> Option<WsPeer> {
        tokio::time::timeout(wait, self.peers.recv()).await.ok().flatten()
    }
}
