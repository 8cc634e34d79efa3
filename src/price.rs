//! SOL/USD conversion
//!
//! Thresholds are expressed in USD while the feed speaks SOL. The oracle holds
//! one shared rate, seeded from config and optionally refreshed over HTTP.

use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct SolPriceOracle {
    usd_per_sol: Arc<RwLock<f64>>,
}

#[derive(Debug, Deserialize)]
struct SimplePriceResponse {
    solana: SimplePrice,
}

#[derive(Debug, Deserialize)]
struct SimplePrice {
    usd: f64,
}

impl SolPriceOracle {
    pub fn new(usd_per_sol: f64) -> Self {
        Self {
            usd_per_sol: Arc::new(RwLock::new(usd_per_sol)),
        }
    }

    pub fn usd_per_sol(&self) -> f64 {
        match self.usd_per_sol.read() {
            Ok(v) => *v,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn sol_to_usd(&self, sol: f64) -> f64 {
        sol * self.usd_per_sol()
    }

    pub fn set_usd_per_sol(&self, price: f64) {
        if !(price.is_finite() && price > 0.0) {
            warn!("Ignoring invalid SOL/USD price {}", price);
            return;
        }
        if let Ok(mut guard) = self.usd_per_sol.write() {
            *guard = price;
        }
    }

    /// Fetch the current rate once
    pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<f64> {
        let response = client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("SOL price request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "SOL price endpoint returned {}",
                response.status()
            )));
        }

        let body: SimplePriceResponse = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("SOL price response: {}", e)))?;
        Ok(body.solana.usd)
    }

    /// Refresh the rate every `interval` until cancelled
    pub fn spawn_refresh(
        &self,
        url: String,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let oracle = self.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match Self::fetch(&client, &url).await {
                            Ok(price) => {
                                debug!("SOL/USD refreshed: {:.2}", price);
                                oracle.set_usd_per_sol(price);
                            }
                            Err(e) => warn!(
                                "SOL/USD refresh failed, keeping {:.2}: {}",
                                oracle.usd_per_sol(),
                                e
                            ),
                        }
                    }
                }
            }
            info!("SOL price refresh stopped");
        })
    }
}
