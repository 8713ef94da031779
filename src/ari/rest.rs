//! ARI REST client.
//!
//! Drives the PBX over its REST interface with basic auth: answer a channel,
//! request an external-media leg, hang up. Every call carries a 10 s timeout
//! and is retried once after 100 ms before the error surfaces.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{AriConfig, ExternalMediaConfig};
use crate::error::{BridgeError, BridgeResult};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct AriRestClient {
    http: reqwest::Client,
    config: AriConfig,
}

impl AriRestClient {
    pub fn new(config: AriConfig) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.rest_timeout_s))
            .build()
            .map_err(|e| BridgeError::Internal(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Answer an inbound call.
    pub async fn answer(&self, channel_id: &str) -> BridgeResult<()> {
        let url = format!("{}/channels/{}/answer", self.config.base_url, channel_id);
        self.post_with_retry(&url, None).await?;
        info!(%channel_id, "answered call");
        Ok(())
    }

    /// Ask the PBX to open a media leg to our external-media server.
    pub async fn start_external_media(
        &self,
        channel_id: &str,
        media: &ExternalMediaConfig,
    ) -> BridgeResult<()> {
        let external_host = format!(
            "ws://{}:{}/external_media/{}",
            media.host, media.port, channel_id
        );
        let url = format!(
            "{}/channels/{}/externalMedia",
            self.config.base_url, channel_id
        );
        let body = json!({
            "app": self.config.stasis_app,
            "external_host": external_host,
            "format": "slin16",
            "direction": "both",
        });
        self.post_with_retry(&url, Some(body)).await?;
        info!(%channel_id, "external media requested");
        Ok(())
    }

    /// Hang up a channel. A channel that is already gone counts as success.
    pub async fn hangup(&self, channel_id: &str) -> BridgeResult<()> {
        let url = format!("{}/channels/{}", self.config.base_url, channel_id);
        let send = || {
            self.http
                .delete(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .send()
        };
        let response = match send().await {
            Ok(response) => response,
            Err(first) => {
                warn!(%channel_id, "hangup failed, retrying: {first}");
                tokio::time::sleep(RETRY_BACKOFF).await;
                send()
                    .await
                    .map_err(|e| BridgeError::NetworkUnavailable(format!("DELETE {url}: {e}")))?
            }
        };
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(&url, response)?;
        info!(%channel_id, "hung up channel");
        Ok(())
    }

    async fn post_with_retry(
        &self,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> BridgeResult<()> {
        let send = || {
            let mut request = self
                .http
                .post(url)
                .basic_auth(&self.config.username, Some(&self.config.password));
            if let Some(body) = &body {
                request = request.json(body);
            }
            request.send()
        };

        let first_err = match send().await {
            Ok(response) => match Self::check_status(url, response) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            },
            Err(e) => BridgeError::NetworkUnavailable(format!("POST {url}: {e}")),
        };

        warn!("ARI call failed, retrying once: {first_err}");
        tokio::time::sleep(RETRY_BACKOFF).await;
        let response = send()
            .await
            .map_err(|e| BridgeError::NetworkUnavailable(format!("POST {url}: {e}")))?;
        Self::check_status(url, response)
    }

    fn check_status(url: &str, response: reqwest::Response) -> BridgeResult<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BridgeError::NetworkUnavailable(format!(
                "{url} returned {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::{delete, post};
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct MockAri {
        answers: AtomicU32,
        media_requests: AtomicU32,
        hangups: AtomicU32,
        fail_first_answer: AtomicU32,
    }

    async fn start_mock(state: Arc<MockAri>) -> String {
        let app = Router::new()
            .route(
                "/ari/channels/{id}/answer",
                post(|State(s): State<Arc<MockAri>>| async move {
                    if s.fail_first_answer.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                        v.checked_sub(1)
                    })
                    .is_ok()
                    {
                        return StatusCode::INTERNAL_SERVER_ERROR;
                    }
                    s.answers.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }),
            )
            .route(
                "/ari/channels/{id}/externalMedia",
                post(|State(s): State<Arc<MockAri>>| async move {
                    s.media_requests.fetch_add(1, Ordering::SeqCst);
                    StatusCode::OK
                }),
            )
            .route(
                "/ari/channels/{id}",
                delete(|State(s): State<Arc<MockAri>>| async move {
                    s.hangups.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NO_CONTENT
                }),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/ari")
    }

    fn client(base_url: String) -> AriRestClient {
        AriRestClient::new(AriConfig {
            base_url,
            username: "user".into(),
            password: "pass".into(),
            stasis_app: "voice-bridge".into(),
            rest_timeout_s: 2,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_answer_and_media_and_hangup() {
        let state = Arc::new(MockAri {
            answers: AtomicU32::new(0),
            media_requests: AtomicU32::new(0),
            hangups: AtomicU32::new(0),
            fail_first_answer: AtomicU32::new(0),
        });
        let client = client(start_mock(state.clone()).await);

        client.answer("ch-1").await.unwrap();
        client
            .start_external_media(
                "ch-1",
                &ExternalMediaConfig {
                    host: "127.0.0.1".into(),
                    port: 8090,
                },
            )
            .await
            .unwrap();
        client.hangup("ch-1").await.unwrap();

        assert_eq!(state.answers.load(Ordering::SeqCst), 1);
        assert_eq!(state.media_requests.load(Ordering::SeqCst), 1);
        assert_eq!(state.hangups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_answer_retries_once_on_failure() {
        let state = Arc::new(MockAri {
            answers: AtomicU32::new(0),
            media_requests: AtomicU32::new(0),
            hangups: AtomicU32::new(0),
            fail_first_answer: AtomicU32::new(1),
        });
        let client = client(start_mock(state.clone()).await);

        client.answer("ch-1").await.unwrap();
        assert_eq!(state.answers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_pbx_surfaces_network_error() {
        let client = client("http://127.0.0.1:1/ari".to_string());
        let err = client.answer("ch-1").await.unwrap_err();
        assert!(matches!(err, BridgeError::NetworkUnavailable(_)));
    }
}
