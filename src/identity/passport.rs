//! Human Passport HTTP client.

use super::{Address, PassportReport, ReputationSource, ScoreError, ScoreResult};
use crate::config::PassportConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

/// Client for the Human Passport v2 API.
#[derive(Clone)]
pub struct PassportClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    scorer_id: String,
}

impl PassportClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        scorer_id: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            scorer_id: scorer_id.into(),
        }
    }

    /// Build from configuration. Fails when credentials are missing.
    pub fn from_config(config: &PassportConfig) -> ScoreResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ScoreError::NotConfigured("passport.api_key is not set".into()))?;
        let scorer_id = config
            .scorer_id
            .clone()
            .ok_or_else(|| ScoreError::NotConfigured("passport.scorer_id is not set".into()))?;

        Ok(Self::new(config.base_url.clone(), api_key, scorer_id))
    }

    async fn get(&self, path: &str) -> ScoreResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "reputation request");

        let response = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ScoreError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(ScoreError::UpstreamUnavailable(format!("{}: {}", status, message)))
        } else {
            Err(ScoreError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl ReputationSource for PassportClient {
    async fn fetch_report(&self, address: &Address) -> ScoreResult<PassportReport> {
        let path = format!(
            "/v2/stamps/{}/score/{}",
            urlencoding::encode(&self.scorer_id),
            urlencoding::encode(address.as_str())
        );
        self.get(&path)
            .await?
            .json::<PassportReport>()
            .await
            .map_err(|e| ScoreError::Decode(e.to_string()))
    }

    async fn list_providers(&self) -> ScoreResult<Vec<serde_json::Value>> {
        self.get("/v2/providers")
            .await?
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| ScoreError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_report_sends_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stamps/77/score/0xalice"))
            .and(header("X-API-KEY", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "address": "0xalice",
                "score": "18.0",
                "passing_score": false,
                "threshold": "20",
                "stamp_scores": {"Github": "10.0", "Twitter": "8.0"}
            })))
            .mount(&server)
            .await;

        let client = PassportClient::new(server.uri(), "secret", "77");
        let report = client.fetch_report(&Address::new("0xAlice")).await.unwrap();

        assert_eq!(report.score, 18.0);
        assert_eq!(report.passing_score, Some(false));
        assert_eq!(report.stamp_scores.len(), 2);
    }

    #[tokio::test]
    async fn test_address_stays_inside_its_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/stamps/77/score/0xa%2F..%2F..%2Fadmin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "address": "0xa/../../admin",
                "score": "1.0",
                "stamp_scores": {}
            })))
            .mount(&server)
            .await;

        let client = PassportClient::new(server.uri(), "secret", "77");
        let report = client
            .fetch_report(&Address::new("0xa/../../admin"))
            .await
            .unwrap();
        assert_eq!(report.score, 1.0);
    }

    #[tokio::test]
    async fn test_server_error_is_upstream_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = PassportClient::new(server.uri(), "secret", "77");
        let err = client
            .fetch_report(&Address::new("0xalice"))
            .await
            .unwrap_err();

        assert!(matches!(err, ScoreError::UpstreamUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_key_is_rejected_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let client = PassportClient::new(server.uri(), "wrong", "77");
        let err = client
            .fetch_report(&Address::new("0xalice"))
            .await
            .unwrap_err();

        match err {
            ScoreError::Rejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid api key");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_list_providers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/providers"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"name": "Github"}, {"name": "Google"}])),
            )
            .mount(&server)
            .await;

        let client = PassportClient::new(format!("{}/", server.uri()), "secret", "77");
        let providers = client.list_providers().await.unwrap();
        assert_eq!(providers.len(), 2);
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = PassportConfig::default();
        assert!(matches!(
            PassportClient::from_config(&config),
            Err(ScoreError::NotConfigured(_))
        ));
    }
}
