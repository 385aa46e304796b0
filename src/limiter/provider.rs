//! Per-provider rate limiting.
//!
//! Each payment gateway gets its own leaky bucket behind the
//! [`ProviderLimiter`] trait, and the registry resolves lookups
//! case-insensitively so callers can pass names as they appear in
//! request paths.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use crate::config::ProviderConfig;
use crate::error::{GateError, Result};
use crate::store::keys::provider_bucket;
use crate::store::{AtomicStore, ConsumeOutcome};

pub trait ProviderLimiter: Send + Sync {
    fn name(&self) -> &str;

    /// Admit one request toward this provider.
    fn try_consume(&self, now_ms: u64) -> bool;

    /// Reserve up to `n` tokens, returning the granted count.
    fn try_consume_n(&self, n: u64, now_ms: u64) -> u64;

    fn refund_n(&self, n: u64, now_ms: u64);

    fn rate_limit(&self) -> u32;

    fn available_tokens(&self, now_ms: u64) -> u64;
}

/// Leaky-bucket limiter for one provider. Follows the same store error
/// policy as the global limiter: consumes fail closed, reads fail open.
pub struct LeakyProviderLimiter {
    store: Arc<dyn AtomicStore>,
    name: String,
    bucket: String,
    rate: f64,
    capacity: f64,
}

impl LeakyProviderLimiter {
    pub fn new(store: Arc<dyn AtomicStore>, config: &ProviderConfig) -> Self {
        let name = config.name.to_uppercase();
        let bucket = provider_bucket(&name);
        Self {
            store,
            name,
            bucket,
            rate: f64::from(config.rate),
            capacity: f64::from(config.capacity),
        }
    }
}

impl ProviderLimiter for LeakyProviderLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_consume(&self, now_ms: u64) -> bool {
        match self
            .store
            .bucket_consume_one(&self.bucket, now_ms, self.rate, self.capacity, None)
        {
            Ok(outcome) => outcome == ConsumeOutcome::Allowed,
            Err(e) => {
                error!(provider = %self.name, error = %e, "provider consume failed, denying");
                false
            }
        }
    }

    fn try_consume_n(&self, n: u64, now_ms: u64) -> u64 {
        match self
            .store
            .bucket_consume_n(&self.bucket, now_ms, self.rate, self.capacity, n)
        {
            Ok(granted) => granted,
            Err(e) => {
                error!(
                    provider = %self.name,
                    error = %e,
                    requested = n,
                    "provider reserve failed, granting none"
                );
                0
            }
        }
    }

    fn refund_n(&self, n: u64, now_ms: u64) {
        if n == 0 {
            return;
        }
        if let Err(e) = self.store.bucket_refund(&self.bucket, now_ms, self.rate, n) {
            warn!(provider = %self.name, error = %e, refund = n, "provider refund failed");
        }
    }

    fn rate_limit(&self) -> u32 {
        self.rate as u32
    }

    fn available_tokens(&self, now_ms: u64) -> u64 {
        let level = match self.store.bucket_level(&self.bucket, now_ms, self.rate) {
            Ok(level) => level,
            Err(e) => {
                warn!(provider = %self.name, error = %e, "provider level read failed, assuming empty");
                0.0
            }
        };
        (self.capacity - level.round().min(self.capacity)) as u64
    }
}

/// Registry of configured providers, keyed by uppercased name.
pub struct ProviderRegistry {
    ordered: Vec<Arc<dyn ProviderLimiter>>,
    by_name: HashMap<String, Arc<dyn ProviderLimiter>>,
}

impl ProviderRegistry {
    /// The sole provider assumed when none are configured.
    const DEFAULT: ProviderConfig = ProviderConfig {
        name: String::new(),
        rate: 10,
        capacity: 10,
    };

    pub fn from_config(store: Arc<dyn AtomicStore>, providers: &[ProviderConfig]) -> Self {
        let mut configs: Vec<ProviderConfig> = providers.to_vec();
        if configs.is_empty() {
            configs.push(ProviderConfig {
                name: "TOSS".to_string(),
                ..Self::DEFAULT
            });
        }
        let mut ordered: Vec<Arc<dyn ProviderLimiter>> = Vec::with_capacity(configs.len());
        let mut by_name: HashMap<String, Arc<dyn ProviderLimiter>> = HashMap::new();
        for config in &configs {
            let limiter: Arc<dyn ProviderLimiter> =
                Arc::new(LeakyProviderLimiter::new(store.clone(), config));
            by_name.insert(limiter.name().to_string(), limiter.clone());
            ordered.push(limiter);
        }
        Self { ordered, by_name }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderLimiter>> {
        self.by_name
            .get(&name.to_uppercase())
            .cloned()
            .ok_or_else(|| GateError::UnknownProvider(name.to_string()))
    }

    /// First provider, in configuration order, with tokens to spare.
    pub fn find_available(&self, now_ms: u64) -> Option<Arc<dyn ProviderLimiter>> {
        self.ordered
            .iter()
            .find(|p| p.available_tokens(now_ms) > 0)
            .cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.ordered.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry_of(providers: &[ProviderConfig]) -> ProviderRegistry {
        ProviderRegistry::from_config(Arc::new(MemoryStore::new()), providers)
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = registry_of(&[]);
        assert_eq!(registry.get("toss").unwrap().name(), "TOSS");
        assert_eq!(registry.get("Toss").unwrap().name(), "TOSS");
        assert!(matches!(
            registry.get("stripe"),
            Err(GateError::UnknownProvider(_))
        ));
    }

    #[test]
    fn default_registry_carries_one_provider() {
        let registry = registry_of(&[]);
        assert_eq!(registry.names(), vec!["TOSS"]);
        let toss = registry.get("TOSS").unwrap();
        assert_eq!(toss.rate_limit(), 10);
        assert_eq!(toss.available_tokens(0), 10);
    }

    #[test]
    fn provider_buckets_are_independent() {
        let registry = registry_of(&[
            ProviderConfig {
                name: "toss".to_string(),
                rate: 2,
                capacity: 2,
            },
            ProviderConfig {
                name: "nice".to_string(),
                rate: 5,
                capacity: 5,
            },
        ]);
        let toss = registry.get("TOSS").unwrap();
        let nice = registry.get("NICE").unwrap();

        assert_eq!(toss.try_consume_n(10, 0), 2);
        assert!(!toss.try_consume(0));
        // Draining toss leaves nice untouched
        assert_eq!(nice.available_tokens(0), 5);
        assert!(nice.try_consume(0));
    }

    #[test]
    fn find_available_skips_drained_providers() {
        let registry = registry_of(&[
            ProviderConfig {
                name: "toss".to_string(),
                rate: 1,
                capacity: 1,
            },
            ProviderConfig {
                name: "nice".to_string(),
                rate: 5,
                capacity: 5,
            },
        ]);
        assert_eq!(registry.find_available(0).unwrap().name(), "TOSS");
        registry.get("TOSS").unwrap().try_consume(0);
        assert_eq!(registry.find_available(0).unwrap().name(), "NICE");
        registry.get("NICE").unwrap().try_consume_n(5, 0);
        assert!(registry.find_available(0).is_none());
        // Refund restores availability
        registry.get("NICE").unwrap().refund_n(1, 0);
        assert_eq!(registry.find_available(0).unwrap().name(), "NICE");
    }
}
