//! Landing predictions from a Tawhiri-compatible HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use sondenotify_core::{LandingPrediction, PredictionConfig, PredictionError, PredictionQuery};

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Prediction request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Prediction API returned HTTP {0}")]
    HttpStatus(u16),

    #[error(transparent)]
    Response(#[from] PredictionError),

    #[error("Invalid prediction API URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Something that can predict where a sonde will land.
#[async_trait]
pub trait LandingPredictor: Send + Sync {
    async fn predict(&self, query: &PredictionQuery) -> Result<LandingPrediction, PredictError>;
}

pub struct TawhiriClient {
    client: reqwest::Client,
    url: reqwest::Url,
    timeout: Duration,
}

impl TawhiriClient {
    pub fn new(config: &PredictionConfig, client: reqwest::Client) -> Result<Self, PredictError> {
        Ok(Self {
            client,
            url: parse_api_url(&config.api_url)?,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl LandingPredictor for TawhiriClient {
    async fn predict(&self, query: &PredictionQuery) -> Result<LandingPrediction, PredictError> {
        tracing::debug!(
            latitude = query.latitude,
            longitude = query.longitude,
            altitude = query.altitude,
            descending = query.descending,
            "Requesting landing prediction"
        );

        let response = self
            .client
            .get(self.url.clone())
            .query(&query.params())
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PredictError::HttpStatus(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        Ok(LandingPrediction::from_response(&body)?)
    }
}

/// Accept only absolute http(s) URLs.
pub fn parse_api_url(raw: &str) -> Result<reqwest::Url, PredictError> {
    let invalid = |reason: String| PredictError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = reqwest::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_api_url_is_accepted() {
        let client = TawhiriClient::new(&PredictionConfig::default(), reqwest::Client::new())
            .expect("valid");
        assert_eq!(client.url.host_str(), Some("api.v2.sondehub.org"));
        assert_eq!(client.timeout, Duration::from_secs(3));
    }

    #[test]
    fn non_http_url_is_rejected() {
        assert_matches!(
            parse_api_url("ftp://example.com/tawhiri"),
            Err(PredictError::InvalidUrl { .. })
        );
        assert_matches!(parse_api_url("not a url"), Err(PredictError::InvalidUrl { .. }));
    }
}
