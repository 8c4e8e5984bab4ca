//! Runtime configuration for scan and correlation jobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable parameters for a scan run.
///
/// The batch-shrink behavior on provider pushback is deliberately
/// configurable: the backend decides the actual curve, these values are
/// forwarded as hints with the `start_scan` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScanConfig {
    /// Entities submitted per classification request.
    pub batch_size: usize,
    /// Lower bound the backend may shrink a batch to before giving up.
    pub min_batch_size: usize,
    /// Cost per token charged by the configured provider.
    pub cost_per_token: f64,
    /// Language hint forwarded with outbound requests.
    pub language: String,
    /// A job with no inbound event for this long is considered stalled.
    #[serde(with = "duration_secs")]
    pub watchdog_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            min_batch_size: 2,
            cost_per_token: 0.0,
            language: "en".to_string(),
            watchdog_timeout: Duration::from_secs(120),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
