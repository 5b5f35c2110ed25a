use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::GasPriceConfig;
use crate::errors::EngineResult;
use crate::ethclient::EthClient;
use crate::types::{GasPricing, U256};

/// How long a node gas price estimate is reused before re-querying.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Gas price source for orchestrators: a fixed configured price, or the
/// node estimate with a short-lived cache shared across transactions.
pub struct GasPriceClient {
    config: GasPriceConfig,
    cached: Mutex<Option<(Instant, U256)>>,
}

impl GasPriceClient {
    pub fn new(config: GasPriceConfig) -> Self {
        Self {
            config,
            cached: Mutex::new(None),
        }
    }

    pub async fn current_pricing(&self, eth: &dyn EthClient) -> EngineResult<GasPricing> {
        if let Some(fixed) = self.config.fixed {
            return Ok(GasPricing::fixed(fixed));
        }
        if !self.config.use_node_estimate {
            return Ok(GasPricing::default());
        }
        if let Some((at, price)) = *self.cached.lock() {
            if at.elapsed() < PRICE_CACHE_TTL {
                return Ok(GasPricing::fixed(price));
            }
        }
        let price = eth.gas_price().await?;
        trace!(%price, "refreshed node gas price");
        *self.cached.lock() = Some((Instant::now(), price));
        Ok(GasPricing::fixed(price))
    }

    /// Bumps a price for resubmission by the configured percentage, capped
    /// at `increase_max` when set. Returns `None` once the cap prevents any
    /// further increase.
    pub fn bump(&self, current: &GasPricing) -> Option<GasPricing> {
        let price = current.gas_price?;
        let bumped = price + price * U256::from(self.config.increase_percentage) / U256::from(100);
        let bumped = match self.config.increase_max {
            Some(max) if bumped > max => max,
            _ => bumped,
        };
        if bumped <= price {
            return None;
        }
        Some(GasPricing::fixed(bumped))
    }
}
