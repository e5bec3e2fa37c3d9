//! Currency conversion: cached rate lookup with stale-rate fallback.
//!
//! Lookup order: cache -> provider -> stale-cache-if-provider-down -> error.
//! Rates carry six fractional digits; conversion rounds half-up at scale 2
//! with integer arithmetic only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use acquira_core::constants::{FX_CACHE_TTL_SECS, FX_RATE_SCALE};
use acquira_core::error::GatewayError;
use acquira_core::money::{Amount, Currency};
use acquira_core::records::ExchangeRate;
use acquira_core::types::now_ts;
use acquira_degrade::{DegradationController, Dependency};

// ── Provider seam ────────────────────────────────────────────────────────────

#[async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_rate(&self, from: Currency, to: Currency) -> Result<ExchangeRate, GatewayError>;
}

/// Static rate table; the default provider for sandbox deployments.
pub struct FixedRateProvider {
    rates: HashMap<String, u64>,
}

impl FixedRateProvider {
    pub fn new(rates: HashMap<String, u64>) -> Self {
        Self { rates }
    }

    /// A small table of plausible majors.
    pub fn with_defaults() -> Self {
        let mut rates = HashMap::new();
        rates.insert("USD_EUR".to_string(), 925_000);
        rates.insert("EUR_USD".to_string(), 1_081_000);
        rates.insert("USD_GBP".to_string(), 790_000);
        rates.insert("GBP_USD".to_string(), 1_266_000);
        Self { rates }
    }
}

#[async_trait]
impl RateProvider for FixedRateProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn fetch_rate(&self, from: Currency, to: Currency) -> Result<ExchangeRate, GatewayError> {
        let key = pair_key(from, to);
        let micros = self.rates.get(&key).copied().ok_or(GatewayError::RateUnavailable {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })?;
        Ok(ExchangeRate { from, to, rate_micros: micros, provider: self.name().to_string(), fetched_at: now_ts() })
    }
}

/// Always-down provider. Test helper for the stale-fallback path.
pub struct UnreachableRateProvider;

#[async_trait]
impl RateProvider for UnreachableRateProvider {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn fetch_rate(&self, _from: Currency, _to: Currency) -> Result<ExchangeRate, GatewayError> {
        Err(GatewayError::Transport("rate provider unreachable".into()))
    }
}

// ── Converter ────────────────────────────────────────────────────────────────

pub struct CurrencyConverter {
    provider: Arc<dyn RateProvider>,
    cache: Mutex<HashMap<String, ExchangeRate>>,
    degrade: Arc<DegradationController>,
}

impl CurrencyConverter {
    pub fn new(provider: Arc<dyn RateProvider>, degrade: Arc<DegradationController>) -> Self {
        Self { provider, cache: Mutex::new(HashMap::new()), degrade }
    }

    /// Convert `amount` from `from` to `to`. Returns the converted amount and
    /// the rate that produced it.
    pub async fn convert(
        &self,
        amount: Amount,
        from: Currency,
        to: Currency,
    ) -> Result<(Amount, ExchangeRate), GatewayError> {
        let rate = self.rate(from, to).await?;
        Ok((rate.convert(amount), rate))
    }

    async fn rate(&self, from: Currency, to: Currency) -> Result<ExchangeRate, GatewayError> {
        // Same-currency short-circuit: rate 1, no provider call.
        if from == to {
            return Ok(ExchangeRate {
                from,
                to,
                rate_micros: FX_RATE_SCALE,
                provider: "identity".to_string(),
                fetched_at: now_ts(),
            });
        }

        let key = pair_key(from, to);
        let now = now_ts();

        let cached = self.cache.lock().expect("fx cache lock").get(&key).cloned();
        if let Some(rate) = &cached {
            if now - rate.fetched_at < FX_CACHE_TTL_SECS {
                return Ok(rate.clone());
            }
        }

        match self.provider.fetch_rate(from, to).await {
            Ok(rate) => {
                self.degrade.mark_healthy(Dependency::FxProvider);
                self.cache.lock().expect("fx cache lock").insert(key, rate.clone());
                debug!(pair = %pair_key(from, to), rate = rate.rate_micros, "rate refreshed");
                Ok(rate)
            }
            Err(e) => {
                self.degrade.mark_degraded(Dependency::FxProvider, &e.to_string());
                if let Some(stale) = cached {
                    warn!(
                        pair = %key,
                        age_secs = now - stale.fetched_at,
                        "rate provider down; serving stale rate"
                    );
                    return Ok(stale);
                }
                Err(GatewayError::RateUnavailable {
                    from: from.as_str().to_string(),
                    to: to.as_str().to_string(),
                })
            }
        }
    }
}

fn pair_key(from: Currency, to: Currency) -> String {
    format!("{}_{}", from.as_str(), to.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter(provider: Arc<dyn RateProvider>) -> CurrencyConverter {
        CurrencyConverter::new(provider, Arc::new(DegradationController::new()))
    }

    #[tokio::test]
    async fn same_currency_skips_the_provider() {
        let conv = converter(Arc::new(UnreachableRateProvider));
        let (amount, rate) = conv
            .convert(Amount::parse("55.40").unwrap(), Currency::USD, Currency::USD)
            .await
            .unwrap();
        assert_eq!(amount.to_string(), "55.40");
        assert_eq!(rate.provider, "identity");
        assert_eq!(rate.rate_micros, FX_RATE_SCALE);
    }

    #[tokio::test]
    async fn conversion_uses_provider_rate() {
        let conv = converter(Arc::new(FixedRateProvider::with_defaults()));
        let (amount, rate) = conv
            .convert(Amount::parse("100.00").unwrap(), Currency::USD, Currency::EUR)
            .await
            .unwrap();
        assert_eq!(rate.rate_micros, 925_000);
        assert_eq!(amount.to_string(), "92.50");
    }

    #[tokio::test]
    async fn stale_rate_serves_when_provider_is_down() {
        let degrade = Arc::new(DegradationController::new());
        let healthy = CurrencyConverter::new(
            Arc::new(FixedRateProvider::with_defaults()),
            Arc::clone(&degrade),
        );
        // Warm the cache, then swap in a dead provider behind the same cache.
        let (_, warm) = healthy
            .convert(Amount::parse("10.00").unwrap(), Currency::USD, Currency::EUR)
            .await
            .unwrap();

        let down = CurrencyConverter {
            provider: Arc::new(UnreachableRateProvider),
            cache: Mutex::new({
                let mut m = HashMap::new();
                let mut stale = warm.clone();
                stale.fetched_at -= 2 * FX_CACHE_TTL_SECS; // expired
                m.insert("USD_EUR".to_string(), stale);
                m
            }),
            degrade: Arc::clone(&degrade),
        };
        let (amount, rate) = down
            .convert(Amount::parse("10.00").unwrap(), Currency::USD, Currency::EUR)
            .await
            .unwrap();
        assert_eq!(rate.rate_micros, 925_000);
        assert_eq!(amount.to_string(), "9.25");
        assert!(degrade.is_degraded(Dependency::FxProvider));
    }

    #[tokio::test]
    async fn no_cache_and_no_provider_is_an_error() {
        let conv = converter(Arc::new(UnreachableRateProvider));
        let err = conv
            .convert(Amount::parse("10.00").unwrap(), Currency::USD, Currency::EUR)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateUnavailable { .. }));
    }

    #[tokio::test]
    async fn unknown_pair_from_fixed_provider() {
        let conv = converter(Arc::new(FixedRateProvider::with_defaults()));
        let err = conv
            .convert(
                Amount::parse("10.00").unwrap(),
                Currency::parse("JPY").unwrap(),
                Currency::EUR,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateUnavailable { .. }));
    }
}
