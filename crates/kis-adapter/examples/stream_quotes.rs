/*
[INPUT]:  KIS_* environment variables with real-domain app keys
[OUTPUT]: Real-time trade prints for one stock on stdout
[POS]:    Examples - WebSocket stream handling
[UPDATE]: When WebSocket API changes
*/

use std::sync::Arc;

use kis_adapter::*;
use tokio::time::{Duration, timeout};
use tracing_subscriber::EnvFilter;

/// Example: domestic stock trade stream (H0STCNT0)
///
/// Required env: KIS_HTS_ID, KIS_ACCOUNT, KIS_APPKEY, KIS_SECRETKEY.
/// Optional: KIS_STOCK (default 005930).
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let credentials = KisCredentials::real(
        std::env::var("KIS_HTS_ID")?,
        &std::env::var("KIS_ACCOUNT")?,
        AppKey::new(std::env::var("KIS_APPKEY")?, std::env::var("KIS_SECRETKEY")?),
    )?;
    let stock = std::env::var("KIS_STOCK").unwrap_or_else(|_| "005930".to_string());

    let schemas = SchemaRegistry::new().with(
        RecordSchema::new(
            "H0STCNT0",
            vec![
                FieldSpec::text("MKSC_SHRN_ISCD"),
                FieldSpec::text("STCK_CNTG_HOUR"),
                FieldSpec::integer("STCK_PRPR"),
                FieldSpec::text("PRDY_VRSS_SIGN"),
                FieldSpec::integer("PRDY_VRSS"),
                FieldSpec::decimal("PRDY_CTRT"),
            ],
        )
        .with_key_field("MKSC_SHRN_ISCD"),
    );

    let config = ClientConfig::default().with_token_cache(ClientConfig::default_token_cache_dir());
    let kis = Kis::new(credentials, config, StreamConfig::default(), Arc::new(schemas))?;

    let websocket = kis.websocket();
    let mut ticket = websocket.subscribe("H0STCNT0", &stock)?;
    websocket.start();

    println!("Streaming {stock} for 60 seconds...");
    let _ = timeout(Duration::from_secs(60), async {
        while let Some(event) = ticket.recv().await {
            let record = &event.record;
            println!(
                "{} {} price={} change={}%",
                event.tr,
                record.get("STCK_CNTG_HOUR").map(ToString::to_string).unwrap_or_default(),
                record.get("STCK_PRPR").map(ToString::to_string).unwrap_or_default(),
                record.get("PRDY_CTRT").map(ToString::to_string).unwrap_or_default(),
            );
        }
    })
    .await;

    ticket.release();
    kis.shutdown().await;
    Ok(())
}
