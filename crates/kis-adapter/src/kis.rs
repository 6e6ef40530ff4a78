/*
[INPUT]:  Credentials, REST/stream configuration and record schemas
[OUTPUT]: One REST client plus lazily created streaming clients per domain
[POS]:    Crate root - entry point wiring the HTTP and WebSocket layers
[UPDATE]: When account modes or client ownership change
*/

use std::sync::{Arc, OnceLock};

use tracing::info;

use crate::auth::{ApprovalKeySource, KisCredentials};
use crate::http::{ClientConfig, KisClient, Result};
use crate::types::Domain;
use crate::ws::{KisWebSocket, SchemaRegistry, StreamConfig};

/// Account session: REST client and the streaming clients it needs.
///
/// In virtual mode orders and balances go to the virtual domain, but some
/// real-time feeds only exist on the real one; `primary_websocket` opens that
/// paired socket on first use.
#[derive(Debug)]
pub struct Kis {
    rest: Arc<KisClient>,
    schemas: Arc<SchemaRegistry>,
    stream_config: StreamConfig,
    websocket: OnceLock<KisWebSocket>,
    primary: OnceLock<KisWebSocket>,
}

impl Kis {
    pub fn new(
        credentials: KisCredentials,
        config: ClientConfig,
        stream_config: StreamConfig,
        schemas: Arc<SchemaRegistry>,
    ) -> Result<Self> {
        let rest = Arc::new(KisClient::with_config(credentials, config)?);
        info!(
            id = %rest.credentials().id,
            domain = %rest.credentials().trading_domain(),
            "kis session created"
        );
        Ok(Self {
            rest,
            schemas,
            stream_config,
            websocket: OnceLock::new(),
            primary: OnceLock::new(),
        })
    }

    pub fn rest(&self) -> &Arc<KisClient> {
        &self.rest
    }

    pub fn trading_domain(&self) -> Domain {
        self.rest.credentials().trading_domain()
    }

    /// Streaming client on the account's trading domain. Not started.
    pub fn websocket(&self) -> KisWebSocket {
        self.websocket
            .get_or_init(|| self.build_websocket(self.trading_domain()))
            .clone()
    }

    /// Streaming client on the real domain. Same instance as `websocket` for
    /// real accounts; needs real app keys for virtual ones.
    pub fn primary_websocket(&self) -> Result<KisWebSocket> {
        if self.trading_domain() == Domain::Real {
            return Ok(self.websocket());
        }
        self.rest.credentials().key_for(Domain::Real)?;
        Ok(self
            .primary
            .get_or_init(|| self.build_websocket(Domain::Real))
            .clone())
    }

    /// Stop every streaming client created so far.
    pub async fn shutdown(&self) {
        if let Some(websocket) = self.websocket.get() {
            websocket.stop().await;
        }
        if let Some(primary) = self.primary.get() {
            primary.stop().await;
        }
    }

    fn build_websocket(&self, domain: Domain) -> KisWebSocket {
        let approval: Arc<dyn ApprovalKeySource> = self.rest.clone();
        KisWebSocket::new(
            domain,
            self.rest.endpoints().ws(domain),
            approval,
            self.schemas.clone(),
            self.stream_config.clone(),
        )
    }
}
