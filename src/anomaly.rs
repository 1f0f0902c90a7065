//! Deterministic per-packet anomaly decisions
//!
//! The engine is stateless: a decision is a pure function of
//! `(global_seed, session_id, packet_seq, direction, profile)`. Independent
//! decision classes within one packet perturb the sequence as
//! `packet_seq * 7 + k`, k = 1..7, so the drop roll never influences the
//! corrupt offset and so on.

use crate::rng;
use crate::types::{AnomalyProfile, Direction};

/// What to do with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyAction {
    /// Send immediately
    Forward,
    /// Discard the packet
    Drop,
    /// Queue with a release delay
    Delay,
    /// Pace at a bandwidth cap
    Throttle,
    /// Flip one byte, then continue down the pipeline
    Corrupt,
    /// Stop reading this direction
    Stall,
    /// Close the opposite write side
    HalfClose,
}

/// Decision for a single packet
///
/// `Corrupt` composes with delay/throttle: the action may stay `Corrupt`
/// while `delay_ms` or `throttle_bytes_per_sec` is also set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDecision {
    pub action: AnomalyAction,
    pub delay_ms: u32,
    pub throttle_bytes_per_sec: u32,
    pub corrupt_offset: usize,
    pub corrupt_mask: u8,
}

impl Default for AnomalyDecision {
    fn default() -> Self {
        Self {
            action: AnomalyAction::Forward,
            delay_ms: 0,
            throttle_bytes_per_sec: 0,
            corrupt_offset: 0,
            corrupt_mask: 0,
        }
    }
}

// Decision classes inside one packet (packet_seq * 7 + k)
const SUB_DROP: u64 = 1;
const SUB_HALF_CLOSE: u64 = 2;
const SUB_STALL: u64 = 3;
const SUB_CORRUPT_ROLL: u64 = 4;
const SUB_CORRUPT_OFFSET: u64 = 5;
const SUB_CORRUPT_MASK: u64 = 6;
const SUB_JITTER: u64 = 7;

/// Stateless anomaly decision engine
#[derive(Debug, Clone, Copy)]
pub struct AnomalyEngine {
    global_seed: u64,
}

impl AnomalyEngine {
    pub fn new(global_seed: u64) -> Self {
        Self { global_seed }
    }

    pub fn global_seed(&self) -> u64 {
        self.global_seed
    }

    /// Decide the fate of one packet
    ///
    /// Evaluation order is drop, half-close, stall (terminal), then corrupt
    /// (composing), then delay/jitter, then throttle.
    pub fn decide(
        &self,
        data: &[u8],
        direction: Direction,
        session_id: u64,
        packet_seq: u64,
        profile: &AnomalyProfile,
    ) -> AnomalyDecision {
        let p = profile.direction(direction);
        let dir = direction.as_u8();
        let mut decision = AnomalyDecision::default();

        let roll = |k: u64| rng::uniform(self.global_seed, session_id, packet_seq * 7 + k, dir);
        let roll_int =
            |k: u64, max: u32| rng::uniform_int(self.global_seed, session_id, packet_seq * 7 + k, dir, max);

        if p.drop_rate > 0.0 && roll(SUB_DROP) < p.drop_rate {
            decision.action = AnomalyAction::Drop;
            return decision;
        }

        if p.half_close_rate > 0.0 && roll(SUB_HALF_CLOSE) < p.half_close_rate {
            decision.action = AnomalyAction::HalfClose;
            return decision;
        }

        if p.stall_probability > 0.0 && roll(SUB_STALL) < p.stall_probability {
            decision.action = AnomalyAction::Stall;
            return decision;
        }

        if p.corrupt_rate > 0.0 && !data.is_empty() && roll(SUB_CORRUPT_ROLL) < p.corrupt_rate {
            decision.action = AnomalyAction::Corrupt;
            decision.corrupt_offset = roll_int(SUB_CORRUPT_OFFSET, data.len() as u32) as usize;
            decision.corrupt_mask = roll_int(SUB_CORRUPT_MASK, 256) as u8;
            // falls through: delay and throttle still apply
        }

        if p.latency_ms > 0 || p.jitter_ms > 0 {
            let mut effective = i64::from(p.latency_ms);
            if p.jitter_ms > 0 {
                let jitter = i64::from(roll_int(SUB_JITTER, p.jitter_ms * 2 + 1)) - i64::from(p.jitter_ms);
                effective = (effective + jitter).max(0);
            }
            if effective > 0 {
                if decision.action == AnomalyAction::Forward {
                    decision.action = AnomalyAction::Delay;
                }
                decision.delay_ms = effective as u32;
            }
        }

        if p.throttle_kbps > 0 {
            if decision.action == AnomalyAction::Forward {
                decision.action = AnomalyAction::Throttle;
            }
            decision.throttle_bytes_per_sec = p.throttle_kbps * 1024 / 8;
        }

        decision
    }
}

/// XOR one byte in place; out-of-range offsets are a no-op
///
/// Self-inverse: applying the same (offset, mask) twice restores the data.
pub fn apply_corruption(data: &mut [u8], offset: usize, mask: u8) {
    if offset < data.len() {
        data[offset] ^= mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DirectionalProfile;

    fn profile_with(c2s: DirectionalProfile) -> AnomalyProfile {
        AnomalyProfile {
            client_to_server: c2s,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_profile_forwards() {
        let engine = AnomalyEngine::new(42);
        let profile = AnomalyProfile::default();
        for seq in 1..100u64 {
            let d = engine.decide(b"data", Direction::ClientToServer, 1, seq, &profile);
            assert_eq!(d.action, AnomalyAction::Forward);
            assert_eq!(d.delay_ms, 0);
        }
    }

    #[test]
    fn test_full_drop_rate_always_drops() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            drop_rate: 1.0,
            ..Default::default()
        });
        for seq in 1..100u64 {
            let d = engine.decide(b"x", Direction::ClientToServer, 1, seq, &profile);
            assert_eq!(d.action, AnomalyAction::Drop);
        }
    }

    #[test]
    fn test_drop_takes_priority_over_half_close() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            drop_rate: 1.0,
            half_close_rate: 1.0,
            stall_probability: 1.0,
            ..Default::default()
        });
        let d = engine.decide(b"x", Direction::ClientToServer, 1, 1, &profile);
        assert_eq!(d.action, AnomalyAction::Drop);
    }

    #[test]
    fn test_decisions_are_reproducible() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            corrupt_rate: 1.0,
            latency_ms: 50,
            jitter_ms: 20,
            ..Default::default()
        });
        let a = engine.decide(b"ABCD", Direction::ClientToServer, 1, 3, &profile);
        let b = engine.decide(b"ABCD", Direction::ClientToServer, 1, 3, &profile);
        assert_eq!(a, b);
    }

    #[test]
    fn test_corrupt_fields_are_bounded() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            corrupt_rate: 1.0,
            ..Default::default()
        });
        for seq in 1..200u64 {
            let d = engine.decide(b"ABCDEFGH", Direction::ClientToServer, 1, seq, &profile);
            assert_eq!(d.action, AnomalyAction::Corrupt);
            assert!(d.corrupt_offset < 8);
        }
    }

    #[test]
    fn test_corrupt_skips_empty_packets() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            corrupt_rate: 1.0,
            ..Default::default()
        });
        let d = engine.decide(b"", Direction::ClientToServer, 1, 1, &profile);
        assert_eq!(d.action, AnomalyAction::Forward);
    }

    #[test]
    fn test_fixed_latency_without_jitter() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            latency_ms: 200,
            ..Default::default()
        });
        for seq in 1..50u64 {
            let d = engine.decide(b"x", Direction::ClientToServer, 1, seq, &profile);
            assert_eq!(d.action, AnomalyAction::Delay);
            assert_eq!(d.delay_ms, 200);
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            latency_ms: 0,
            jitter_ms: 30,
            ..Default::default()
        });
        for seq in 1..500u64 {
            let d = engine.decide(b"x", Direction::ClientToServer, 1, seq, &profile);
            // delays lie in [0, 2J]; zero collapses back to Forward
            assert!(d.delay_ms <= 60);
            if d.delay_ms > 0 {
                assert_eq!(d.action, AnomalyAction::Delay);
            }
        }
    }

    #[test]
    fn test_throttle_promotion_and_rate() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            throttle_kbps: 64,
            ..Default::default()
        });
        let d = engine.decide(b"x", Direction::ClientToServer, 1, 1, &profile);
        assert_eq!(d.action, AnomalyAction::Throttle);
        assert_eq!(d.throttle_bytes_per_sec, 64 * 1024 / 8);
    }

    #[test]
    fn test_corrupt_composes_with_delay() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            corrupt_rate: 1.0,
            latency_ms: 100,
            ..Default::default()
        });
        let d = engine.decide(b"ABCD", Direction::ClientToServer, 1, 1, &profile);
        assert_eq!(d.action, AnomalyAction::Corrupt);
        assert_eq!(d.delay_ms, 100);
    }

    #[test]
    fn test_directions_are_independent() {
        let engine = AnomalyEngine::new(42);
        let profile = profile_with(DirectionalProfile {
            drop_rate: 1.0,
            ..Default::default()
        });
        let c2s = engine.decide(b"x", Direction::ClientToServer, 1, 1, &profile);
        let s2c = engine.decide(b"x", Direction::ServerToClient, 1, 1, &profile);
        assert_eq!(c2s.action, AnomalyAction::Drop);
        // the s2c profile is all zeros
        assert_eq!(s2c.action, AnomalyAction::Forward);
    }

    #[test]
    fn test_corruption_is_self_inverse() {
        let mut data = vec![0x41, 0x42, 0x43, 0x44];
        apply_corruption(&mut data, 2, 0x5a);
        assert_ne!(data, vec![0x41, 0x42, 0x43, 0x44]);
        apply_corruption(&mut data, 2, 0x5a);
        assert_eq!(data, vec![0x41, 0x42, 0x43, 0x44]);
    }

    #[test]
    fn test_corruption_out_of_range_is_noop() {
        let mut data = vec![1, 2, 3];
        apply_corruption(&mut data, 3, 0xff);
        assert_eq!(data, vec![1, 2, 3]);
    }
}
