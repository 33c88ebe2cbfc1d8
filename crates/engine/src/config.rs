//! Engine configuration.
//!
//! Two layers of configuration meet here. Operational settings (storage
//! backend, retry cadence) are local to the node and set at startup.
//! Protocol settings (members, timeouts) are network-wide, sourced from the
//! on-chain settings registry, and must be identical across honest nodes;
//! they arrive as a raw key/value map and are applied at block boundaries
//! via [`PbftConfig::merge_settings`].

use pbft_types::{Membership, MembershipError, PeerId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Settings-registry key for the member list.
pub const SETTING_MEMBERS: &str = "pbft.members";
/// Settings-registry key for the block publishing delay, in milliseconds.
pub const SETTING_BLOCK_PUBLISHING_DELAY: &str = "pbft.block_publishing_delay";
/// Settings-registry key for the idle timeout, in milliseconds.
pub const SETTING_IDLE_TIMEOUT: &str = "pbft.idle_timeout";
/// Settings-registry key for the commit timeout, in milliseconds.
pub const SETTING_COMMIT_TIMEOUT: &str = "pbft.commit_timeout";
/// Settings-registry key for the view change duration, in milliseconds.
pub const SETTING_VIEW_CHANGE_DURATION: &str = "pbft.view_change_duration";
/// Settings-registry key for the forced view change period, in blocks.
pub const SETTING_FORCED_VIEW_CHANGE_PERIOD: &str = "pbft.forced_view_change_period";

/// Error produced when configuration input is invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A settings value failed to parse.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    /// The member list is unusable.
    #[error(transparent)]
    Membership(#[from] MembershipError),
    /// Timing values contradict each other.
    #[error("block_publishing_delay ({delay:?}) must be shorter than idle_timeout ({idle:?})")]
    PublishingDelayTooLong { delay: Duration, idle: Duration },
    /// A storage backend string was not recognized.
    #[error("unknown storage backend {0:?}, expected \"memory\" or \"disk+<path>\"")]
    UnknownStorageBackend(String),
}

/// Where the consensus message log is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Keep the log in memory only; a restart loses in-flight state.
    Memory,
    /// Persist the log as JSON lines at the given path.
    Disk(PathBuf),
}

impl StorageBackend {
    /// Parse the operational setting string: `"memory"` or `"disk+<path>"`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        if s == "memory" {
            return Ok(StorageBackend::Memory);
        }
        if let Some(path) = s.strip_prefix("disk+") {
            if !path.is_empty() {
                return Ok(StorageBackend::Disk(PathBuf::from(path)));
            }
        }
        Err(ConfigError::UnknownStorageBackend(s.to_string()))
    }
}

/// Full configuration for a consensus node.
#[derive(Debug, Clone)]
pub struct PbftConfig {
    /// Ordered validator list. Network-wide; must be identical across honest
    /// nodes.
    pub members: Vec<PeerId>,

    /// How long the primary waits before asking the ledger for a candidate,
    /// batching transactions into fewer blocks.
    pub block_publishing_delay: Duration,

    /// Base delay for exponential retry against the ledger connection.
    pub exponential_retry_base: Duration,

    /// Cap for exponential retry against the ledger connection.
    pub exponential_retry_max: Duration,

    /// Fires when no block is finalized for this long; the primary is
    /// presumed faulty. Must exceed typical block production latency.
    pub idle_timeout: Duration,

    /// Fires when an accepted proposal fails to finalize in time.
    pub commit_timeout: Duration,

    /// How long to wait for a NewView before escalating to the next view.
    pub view_change_duration: Duration,

    /// Rotate the primary every this many committed blocks even without
    /// faults, bounding primary tenure. Zero disables forced rotation.
    pub forced_view_change_period: u64,

    /// Maximum number of accepted messages retained in the log; also bounds
    /// how far ahead of the last finalized sequence a message may be.
    pub max_log_size: u64,

    /// Message log persistence backend. Operational, per-node.
    pub storage: StorageBackend,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            block_publishing_delay: Duration::from_millis(200),
            exponential_retry_base: Duration::from_millis(100),
            exponential_retry_max: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(30),
            view_change_duration: Duration::from_secs(5),
            forced_view_change_period: 30,
            max_log_size: 1000,
            storage: StorageBackend::Memory,
        }
    }
}

impl PbftConfig {
    pub fn new(members: Vec<PeerId>) -> Self {
        Self {
            members,
            ..Self::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    pub fn with_view_change_duration(mut self, duration: Duration) -> Self {
        self.view_change_duration = duration;
        self
    }

    pub fn with_block_publishing_delay(mut self, delay: Duration) -> Self {
        self.block_publishing_delay = delay;
        self
    }

    pub fn with_forced_view_change_period(mut self, period: u64) -> Self {
        self.forced_view_change_period = period;
        self
    }

    pub fn with_max_log_size(mut self, size: u64) -> Self {
        self.max_log_size = size;
        self
    }

    pub fn with_storage(mut self, storage: StorageBackend) -> Self {
        self.storage = storage;
        self
    }

    /// Build the membership from the configured member list.
    pub fn membership(&self) -> Result<Membership, ConfigError> {
        Ok(Membership::new(self.members.clone())?)
    }

    /// Check cross-field validity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.membership()?;
        if self.block_publishing_delay >= self.idle_timeout {
            return Err(ConfigError::PublishingDelayTooLong {
                delay: self.block_publishing_delay,
                idle: self.idle_timeout,
            });
        }
        Ok(())
    }

    /// Apply on-chain settings on top of the current configuration.
    ///
    /// Unknown keys are ignored so settings registries can carry entries for
    /// other subsystems. Any recognized key with an unparseable value is an
    /// error and the whole update is rejected; partial application would let
    /// honest nodes diverge.
    pub fn merge_settings(&mut self, settings: &HashMap<String, String>) -> Result<(), ConfigError> {
        let mut merged = self.clone();

        if let Some(raw) = settings.get(SETTING_MEMBERS) {
            merged.members = parse_members(raw)?;
        }
        if let Some(raw) = settings.get(SETTING_BLOCK_PUBLISHING_DELAY) {
            merged.block_publishing_delay = parse_millis(SETTING_BLOCK_PUBLISHING_DELAY, raw)?;
        }
        if let Some(raw) = settings.get(SETTING_IDLE_TIMEOUT) {
            merged.idle_timeout = parse_millis(SETTING_IDLE_TIMEOUT, raw)?;
        }
        if let Some(raw) = settings.get(SETTING_COMMIT_TIMEOUT) {
            merged.commit_timeout = parse_millis(SETTING_COMMIT_TIMEOUT, raw)?;
        }
        if let Some(raw) = settings.get(SETTING_VIEW_CHANGE_DURATION) {
            merged.view_change_duration = parse_millis(SETTING_VIEW_CHANGE_DURATION, raw)?;
        }
        if let Some(raw) = settings.get(SETTING_FORCED_VIEW_CHANGE_PERIOD) {
            merged.forced_view_change_period = parse_u64(SETTING_FORCED_VIEW_CHANGE_PERIOD, raw)?;
        }

        merged.validate()?;
        debug!("applied on-chain settings update");
        *self = merged;
        Ok(())
    }
}

/// Parse the member list: a JSON array of hex-encoded public keys.
fn parse_members(raw: &str) -> Result<Vec<PeerId>, ConfigError> {
    let entries: Vec<String> =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            key: SETTING_MEMBERS.to_string(),
            reason: format!("expected a JSON array of hex public keys: {e}"),
        })?;

    entries
        .iter()
        .map(|entry| {
            let bytes = hex::decode(entry).map_err(|e| ConfigError::InvalidValue {
                key: SETTING_MEMBERS.to_string(),
                reason: format!("invalid hex {entry:?}: {e}"),
            })?;
            let bytes: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::InvalidValue {
                key: SETTING_MEMBERS.to_string(),
                reason: format!("member key {entry:?} is not 32 bytes"),
            })?;
            Ok(PeerId::from_bytes(bytes))
        })
        .collect()
}

fn parse_millis(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    parse_u64(key, raw).map(Duration::from_millis)
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("expected an unsigned integer, got {raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: u8) -> Vec<PeerId> {
        (0..n).map(|i| PeerId::from_bytes([i; 32])).collect()
    }

    #[test]
    fn test_defaults_match_expected_timings() {
        let config = PbftConfig::default();
        assert_eq!(config.block_publishing_delay, Duration::from_millis(200));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.commit_timeout, Duration::from_secs(30));
        assert_eq!(config.view_change_duration, Duration::from_secs(5));
        assert_eq!(config.forced_view_change_period, 30);
        assert_eq!(config.max_log_size, 1000);
        assert_eq!(config.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_validate_rejects_publishing_delay_over_idle_timeout() {
        let config = PbftConfig::new(members(4))
            .with_block_publishing_delay(Duration::from_secs(30))
            .with_idle_timeout(Duration::from_secs(10));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PublishingDelayTooLong { .. })
        ));
    }

    #[test]
    fn test_merge_settings_applies_recognized_keys() {
        let mut config = PbftConfig::new(members(4));
        let settings = HashMap::from([
            (SETTING_IDLE_TIMEOUT.to_string(), "5000".to_string()),
            (
                SETTING_FORCED_VIEW_CHANGE_PERIOD.to_string(),
                "10".to_string(),
            ),
            ("other.subsystem.key".to_string(), "ignored".to_string()),
        ]);

        config.merge_settings(&settings).unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.forced_view_change_period, 10);
    }

    #[test]
    fn test_merge_settings_rejects_bad_value_without_partial_apply() {
        let mut config = PbftConfig::new(members(4));
        let settings = HashMap::from([
            (SETTING_IDLE_TIMEOUT.to_string(), "5000".to_string()),
            (SETTING_COMMIT_TIMEOUT.to_string(), "not-a-number".to_string()),
        ]);

        let err = config.merge_settings(&settings).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        // Nothing applied, including the valid key.
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_merge_settings_parses_member_list() {
        let mut config = PbftConfig::new(members(4));
        let list: Vec<String> = (10u8..14)
            .map(|i| hex::encode([i; 32]))
            .collect();
        let settings = HashMap::from([(
            SETTING_MEMBERS.to_string(),
            serde_json::to_string(&list).unwrap(),
        )]);

        config.merge_settings(&settings).unwrap();
        assert_eq!(config.members, members_from(10..14));

        fn members_from(range: std::ops::Range<u8>) -> Vec<PeerId> {
            range.map(|i| PeerId::from_bytes([i; 32])).collect()
        }
    }

    #[test]
    fn test_merge_settings_rejects_too_small_member_list() {
        let mut config = PbftConfig::new(members(4));
        let list: Vec<String> = (0u8..3).map(|i| hex::encode([i; 32])).collect();
        let settings = HashMap::from([(
            SETTING_MEMBERS.to_string(),
            serde_json::to_string(&list).unwrap(),
        )]);

        assert!(matches!(
            config.merge_settings(&settings),
            Err(ConfigError::Membership(MembershipError::TooFewMembers(3)))
        ));
        assert_eq!(config.members.len(), 4);
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(StorageBackend::parse("memory"), Ok(StorageBackend::Memory));
        assert_eq!(
            StorageBackend::parse("disk+/var/lib/pbft/log"),
            Ok(StorageBackend::Disk(PathBuf::from("/var/lib/pbft/log")))
        );
        assert!(StorageBackend::parse("disk+").is_err());
        assert!(StorageBackend::parse("rocksdb").is_err());
    }
}
