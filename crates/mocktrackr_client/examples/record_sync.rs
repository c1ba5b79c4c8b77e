// examples/record_sync.rs
//
// Fires a burst of concurrent record lookups through one gated client to show
// the admission limit, pacing and retry behavior in action.
//
// Configuration comes from MOCKTRACKR_* environment variables (a `.env` file
// is honored). Point MOCKTRACKR_API_BASE_URL at a running backend, then watch
// the logs: with the default limit of 5, a burst of 12 lookups is admitted in
// waves, paced 150 ms apart, and any 429/503/504 responses are retried with
// doubling backoff.

use futures::future::join_all;
use mocktrackr_client::{RecordsClient, RecordsClientConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), request_gate::Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,request_gate=debug")),
        )
        .init();

    let config = RecordsClientConfig::from_env()?;
    let client = RecordsClient::new(config)?;
    let user_id =
        std::env::var("MOCKTRACKR_USER_ID").unwrap_or_else(|_| "demo-user".to_string());

    info!(user_id = %user_id, "Starting burst of concurrent lookups");

    let lookups = (0..12).map(|batch| {
        let mut client = client.clone();
        let user_id = user_id.clone();
        async move { (batch, client.list_records(&user_id).await) }
    });

    for (batch, outcome) in join_all(lookups).await {
        match outcome {
            Ok(records) => info!(batch, count = records.len(), "Fetched records"),
            Err(err) => error!(batch, error = %err, "Lookup failed"),
        }
    }

    Ok(())
}
