//! Readiness checks for a freshly spawned llama-server.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use super::error::LlamaServerError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Single-shot check of the `/health` endpoint.
pub async fn check_http_health(client: &reqwest::Client, base_url: &str) -> bool {
    match client.get(format!("{base_url}/health")).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(error = %e, "Health check failed");
            false
        }
    }
}

/// Poll `/health` until it returns 200 OK or `timeout` elapses.
///
/// llama-server answers 503 while the model is still loading.
pub async fn wait_for_http_health(
    client: &reqwest::Client,
    base_url: &str,
    port: u16,
    timeout: Duration,
) -> Result<(), LlamaServerError> {
    info!(%base_url, "Waiting for llama-server to be ready");
    let deadline = Instant::now() + timeout;

    loop {
        if check_http_health(client, base_url).await {
            info!(port, "llama-server is ready");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(LlamaServerError::StartupTimeout {
                port,
                waited_secs: timeout.as_secs(),
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_port_times_out() {
        let client = reqwest::Client::new();
        let port = super::super::process::free_port().unwrap();
        let base_url = format!("http://127.0.0.1:{port}");

        let err = wait_for_http_health(&client, &base_url, port, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, LlamaServerError::StartupTimeout { .. }));
    }
}
