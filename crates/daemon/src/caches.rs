//! The three cache namespaces the daemon keeps, and their pruning.

use crate::cache::MemoizingCache;
use crate::item::{ResourceStats, TranscodeStats, VideoCodec};
use hevc_sweep_config::CacheConfig;
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

pub const CAPABILITY_NAMESPACE: &str = "video_codec";
pub const OUTCOME_NAMESPACE: &str = "transcode_stats";
pub const RESOURCE_STATS_NAMESPACE: &str = "resource_stats";

/// Per-item artifacts that outlive a single scheduler run.
#[derive(Debug)]
pub struct Caches {
    /// Codec of each inspected item.
    pub capability: MemoizingCache<String, VideoCodec>,
    /// Result of each finished transcode.
    pub outcome: MemoizingCache<String, TranscodeStats>,
    pub resource_stats: MemoizingCache<String, ResourceStats>,
}

/// Key sets describing the collection as it currently is.
#[derive(Debug, Default, Clone)]
pub struct PruneScope {
    /// Every key in the collection.
    pub all_keys: HashSet<String>,
    /// Keys of items that are videos.
    pub video_keys: HashSet<String>,
    /// Keys whose transcoded output is still on disk.
    pub keys_with_output: HashSet<String>,
    pub min_savings_ratio: f32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub resource_stats_removed: usize,
    pub capability_removed: usize,
    pub outcome_removed: usize,
}

impl Caches {
    /// Open all namespaces under `config.dir`. Must be called within a
    /// tokio runtime.
    pub fn open(config: &CacheConfig) -> Self {
        let flush = Duration::from_millis(config.flush_interval_ms);
        Self {
            capability: MemoizingCache::open(
                &config.dir,
                CAPABILITY_NAMESPACE,
                config.capability_version,
                flush,
            ),
            outcome: MemoizingCache::open(&config.dir, OUTCOME_NAMESPACE, config.outcome_version, flush),
            resource_stats: MemoizingCache::open(
                &config.dir,
                RESOURCE_STATS_NAMESPACE,
                config.resource_stats_version,
                flush,
            ),
        }
    }

    /// Drop entries for items that no longer exist.
    ///
    /// An outcome survives only while its output is on disk, or when the
    /// outcome itself says the output was not worth keeping (so the item is
    /// not transcoded again).
    pub async fn prune(&self, scope: &PruneScope) -> PruneReport {
        let resource_stats_removed = self.resource_stats.filter_to_keys(&scope.all_keys).await;
        let capability_removed = self.capability.filter_to_keys(&scope.video_keys).await;
        let outcome_removed = self
            .outcome
            .retain(|key, stats| {
                scope.video_keys.contains(key)
                    && (scope.keys_with_output.contains(key) || !stats.should_apply(scope.min_savings_ratio))
            })
            .await;

        let report = PruneReport {
            resource_stats_removed,
            capability_removed,
            outcome_removed,
        };
        info!(
            resource_stats = report.resource_stats_removed,
            capability = report.capability_removed,
            outcome = report.outcome_removed,
            "pruned caches"
        );
        report
    }

    pub async fn flush(&self) {
        self.capability.flush().await;
        self.outcome.flush().await;
        self.resource_stats.flush().await;
    }
}
