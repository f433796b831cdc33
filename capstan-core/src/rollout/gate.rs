//! Admission decisions. Pure functions of the configuration and the
//! repository identity, so two calls under the same configuration always
//! agree — in this process or any other.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use capstan_model::{RepositoryCategory, RolloutConfig, RolloutStrategy};

/// Deterministic bucket in `[0, 100)` for `(feature, repository)`.
///
/// SHA-256 over the UTF-8 bytes of `"{feature}:{repository_id}"`
/// (hyphenated lowercase uuid), first 8 bytes as a big-endian u64,
/// reduced modulo 100. Reproducible from any language for audits.
pub fn stable_percentage_hash(feature: &str, repository_id: Uuid) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(feature.as_bytes());
    hasher.update(b":");
    hasher.update(repository_id.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % 100) as u8
}

/// The rollout gate. `category` is consulted only by the
/// `repository_size` strategy.
pub fn admits(
    config: &RolloutConfig,
    repository_id: Uuid,
    category: Option<RepositoryCategory>,
) -> bool {
    if !config.is_active || config.emergency_stop {
        return false;
    }
    match config.strategy {
        RolloutStrategy::Percentage => {
            stable_percentage_hash(&config.feature, repository_id) < config.percentage
        }
        RolloutStrategy::Whitelist => config.whitelist.contains(&repository_id),
        RolloutStrategy::RepositorySize => {
            category.is_some_and(|c| c.is_open_at(config.percentage))
        }
    }
}
