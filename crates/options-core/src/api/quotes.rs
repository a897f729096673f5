//! Fallback last-traded-price lookups.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// Batched LTP lookup, used when neither the shared cache nor the feed has a
/// fresh price. Callers route it through a circuit breaker.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Prices for `instrument_ids` in `segment`. Instruments the provider has
    /// no quote for are absent from the result.
    async fn ltp_batch(
        &self,
        segment: &str,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, Decimal>>;
}

#[derive(Debug, Deserialize)]
struct LtpResponse {
    prices: HashMap<String, Decimal>,
}

/// REST quote client: `GET {base}/ltp?segment=..&instruments=a,b`.
pub struct HttpQuoteProvider {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpQuoteProvider {
    pub fn new(base_url: impl Into<String>, timeout: StdDuration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn ltp_url(&self) -> String {
        format!("{}/ltp", self.base_url)
    }
}

#[async_trait]
impl QuoteProvider for HttpQuoteProvider {
    async fn ltp_batch(
        &self,
        segment: &str,
        instrument_ids: &[String],
    ) -> Result<HashMap<String, Decimal>> {
        if instrument_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let instruments = instrument_ids.join(",");
        let response = self
            .http_client
            .get(self.ltp_url())
            .query(&[("segment", segment), ("instruments", instruments.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transient(
                format!("quotes:{segment}"),
                format!("LTP request failed: {status}"),
            ));
        }

        let body: LtpResponse = response.json().await?;
        debug!(
            segment = segment,
            requested = instrument_ids.len(),
            returned = body.prices.len(),
            "Fetched fallback quotes"
        );
        Ok(body.prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ltp_response_parsing() {
        let json = r#"{"prices":{"43512":101.25,"43513":"88.5"}}"#;
        let body: LtpResponse = serde_json::from_str(json).unwrap();
        assert_eq!(body.prices["43512"], Decimal::new(10125, 2));
        assert_eq!(body.prices["43513"], Decimal::new(885, 1));
    }

    #[test]
    fn test_base_url_normalized() {
        let provider =
            HttpQuoteProvider::new("http://quotes.local/", StdDuration::from_secs(1)).unwrap();
        assert_eq!(provider.ltp_url(), "http://quotes.local/ltp");
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let provider =
            HttpQuoteProvider::new("http://127.0.0.1:1", StdDuration::from_millis(50)).unwrap();
        let prices = provider.ltp_batch("NFO", &[]).await.unwrap();
        assert!(prices.is_empty());
    }
}
