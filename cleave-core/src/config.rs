//! Engine configuration and per-container normalization rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine tunables, passed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Below this queue depth a non-discontinuous channel reports drying,
    /// which keeps the producer reading
    pub min_packets_in_queue: usize,
    /// Soft queue cap; at or above this the producer throttles as long as
    /// no channel is drying
    pub max_packets_in_queue: usize,
    /// Producer sleep slice while backpressure holds or the engine is
    /// paused. Control commands are re-checked every slice.
    pub throttle: Duration,
    /// Consumer bounded wait while its queue is empty
    pub consumer_wait: Duration,
    /// Consecutive corrupt packets tolerated before escalating to a fatal
    /// parse error
    pub corrupt_packet_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_packets_in_queue: 10,
            max_packets_in_queue: 100,
            throttle: Duration::from_millis(1),
            consumer_wait: Duration::from_millis(10),
            corrupt_packet_limit: 32,
        }
    }
}

/// Per-container-kind timestamp correction rules.
///
/// Some containers are known to emit unreliable timestamps in narrow,
/// empirically-established ways. Rather than hard-coding those predicates,
/// each source reports a profile and the engine applies whichever rules are
/// switched on. Defaults are all-off.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContainerProfile {
    /// Container emits a literal zero instead of "unknown" for PTS/DTS;
    /// zero is remapped to `INVALID_TIME`
    pub treat_zero_as_unknown: bool,
    /// Container only produces reliable decode time for video; PTS is
    /// discarded and DTS used instead
    pub prefer_dts_for_video: bool,
    /// Streaming container without a known duration
    pub unbounded_duration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert!(cfg.min_packets_in_queue < cfg.max_packets_in_queue);
        assert_eq!(cfg.corrupt_packet_limit, 32);

        let profile = ContainerProfile::default();
        assert!(!profile.treat_zero_as_unknown);
        assert!(!profile.prefer_dts_for_video);
    }

    #[test]
    fn test_config_round_trip() {
        let cfg = EngineConfig {
            min_packets_in_queue: 4,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min_packets_in_queue, 4);
        assert_eq!(back.max_packets_in_queue, cfg.max_packets_in_queue);
    }
}
