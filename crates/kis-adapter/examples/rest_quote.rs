/*
[INPUT]:  KIS_* environment variables, optional KIS_VIRTUAL=1
[OUTPUT]: Current price of one stock via REST
[POS]:    Examples - authenticated REST request
[UPDATE]: When the request engine API changes
*/

use kis_adapter::*;
use tracing_subscriber::EnvFilter;

/// Example: inquire-price through the throttled, retrying request engine
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let id = std::env::var("KIS_HTS_ID")?;
    let account = std::env::var("KIS_ACCOUNT")?;
    let key = AppKey::new(std::env::var("KIS_APPKEY")?, std::env::var("KIS_SECRETKEY")?);
    let credentials = if std::env::var("KIS_VIRTUAL").is_ok_and(|value| value == "1") {
        KisCredentials::virtual_account(id, &account, key, None)?
    } else {
        KisCredentials::real(id, &account, key)?
    };

    let config = ClientConfig::default().with_token_cache(ClientConfig::default_token_cache_dir());
    let client = KisClient::with_config(credentials, config)?;

    let request = KisRequest::get(
        "/uapi/domestic-stock/v1/quotations/inquire-price",
        "FHKST01010100",
    )
    .param("FID_COND_MRKT_DIV_CODE", "J")
    .param("FID_INPUT_ISCD", "005930");

    match client.request(&request).await {
        Ok(response) => {
            let output: serde_json::Value = response.output()?;
            println!("005930 price: {}", output["stck_prpr"]);
        }
        Err(err) => {
            eprintln!("request failed: {err} (code {:?})", err.msg_cd());
        }
    }

    Ok(())
}
