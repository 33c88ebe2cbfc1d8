//! On-chain consensus settings.
//!
//! Consensus tunables live on the chain itself so every validator applies
//! the same values at the same block boundary. The ledger exposes them as
//! raw bytes; this module parses them into the string map the state machine
//! consumes via `Event::SettingsUpdated`, and wraps the fetch in a retry
//! loop since the ledger connection can lag behind node startup.

use crate::backoff::retry_until_ok;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Settings keys outside this namespace are ignored.
pub const SETTINGS_NAMESPACE: &str = "pbft.";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings payload is not a JSON object of strings: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("settings unavailable: {0}")]
    Unavailable(String),
}

/// Where settings come from. Implemented over the ledger connection in the
/// node binary; implemented over a fixture map in tests.
pub trait SettingsSource {
    fn load(&self) -> Result<Vec<u8>, SettingsError>;
}

/// Parse a raw settings payload, keeping only consensus-namespaced keys.
pub fn parse_settings(bytes: &[u8]) -> Result<HashMap<String, String>, SettingsError> {
    let raw: HashMap<String, String> = serde_json::from_slice(bytes)?;
    let settings: HashMap<String, String> = raw
        .into_iter()
        .filter(|(key, _)| key.starts_with(SETTINGS_NAMESPACE))
        .collect();
    debug!(count = settings.len(), "parsed consensus settings");
    Ok(settings)
}

/// Fetch and parse settings, retrying with exponential backoff until the
/// source responds with a well-formed payload.
pub async fn fetch_settings<S: SettingsSource>(
    source: &S,
    retry_base: Duration,
    retry_max: Duration,
) -> HashMap<String, String> {
    retry_until_ok(retry_base, retry_max, || async {
        parse_settings(&source.load()?)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_namespaced_keys_only() {
        let payload = br#"{"pbft.idle_timeout": "30000", "other.thing": "x"}"#;
        let settings = parse_settings(payload).unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings["pbft.idle_timeout"], "30000");
    }

    #[test]
    fn test_parse_rejects_non_object_payload() {
        assert!(parse_settings(b"[1, 2, 3]").is_err());
    }

    #[tokio::test]
    async fn test_fetch_retries_flaky_source() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct Flaky(AtomicU32);
        impl SettingsSource for Flaky {
            fn load(&self) -> Result<Vec<u8>, SettingsError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SettingsError::Unavailable("ledger starting".into()))
                } else {
                    Ok(br#"{"pbft.commit_timeout": "10000"}"#.to_vec())
                }
            }
        }

        let source = Flaky(AtomicU32::new(0));
        let settings =
            fetch_settings(&source, Duration::from_millis(1), Duration::from_millis(1)).await;
        assert_eq!(settings["pbft.commit_timeout"], "10000");
    }
}
