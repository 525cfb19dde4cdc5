//! Randomized pacing for human-emulation loops.
//!
//! Every control in the session rate-limit table lives here, sampled from
//! closed intervals. Each primitive call builds its own OS-seeded RNG so no
//! two sessions share a sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::model::{Phase, Platform};

/// Per-session engagement ceilings. Sampled once per session; the feed loop
/// stops engaging once a cap is hit.
#[derive(Debug, Clone, Copy)]
pub struct SessionCaps {
    pub likes: u32,
    pub follows: u32,
}

impl SessionCaps {
    /// Sample caps for a platform and phase. Phase 4 ceilings are relaxed,
    /// not removed.
    pub fn sample(rng: &mut StdRng, platform: Platform, phase: Phase) -> SessionCaps {
        let likes = match phase {
            Phase::Active => rng.gen_range(8..=15),
            _ => rng.gen_range(5..=10),
        };
        let follows = match (platform, phase) {
            (Platform::Instagram, Phase::Active) => rng.gen_range(5..=8),
            (Platform::Instagram, _) => rng.gen_range(3..=5),
            (_, Phase::Active) => rng.gen_range(5..=10),
            _ => rng.gen_range(3..=7),
        };
        SessionCaps { likes, follows }
    }

    /// Platform-agnostic ceilings for warmers not yet wired to an operated
    /// platform.
    pub fn sample_generic(rng: &mut StdRng, phase: Phase) -> SessionCaps {
        let likes = match phase {
            Phase::Active => rng.gen_range(8..=15),
            _ => rng.gen_range(5..=10),
        };
        let follows = match phase {
            Phase::Active => rng.gen_range(5..=10),
            _ => rng.gen_range(3..=7),
        };
        SessionCaps { likes, follows }
    }
}

/// Per-session pacing state: probabilities drawn once, intervals drawn per
/// use.
pub struct Pacing {
    rng: StdRng,
    like_probability: f64,
    follow_probability: f64,
    zone_out_probability: f64,
}

impl Pacing {
    /// Independent seed per call site, never a shared sequence.
    pub fn new() -> Pacing {
        Self::from_rng(StdRng::from_entropy())
    }

    pub fn from_rng(mut rng: StdRng) -> Pacing {
        let like_probability = rng.gen_range(0.12..=0.15);
        let follow_probability = rng.gen_range(0.05..=0.07);
        let zone_out_probability = rng.gen_range(0.05..=0.15);
        Pacing {
            rng,
            like_probability,
            follow_probability,
            zone_out_probability,
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Watch time for one video: 5-25 s, with a 30% chance of a longer
    /// 20-60 s hold.
    pub fn watch_duration(&mut self) -> Duration {
        if self.rng.gen_bool(0.30) {
            Duration::from_secs_f64(self.rng.gen_range(20.0..=60.0))
        } else {
            Duration::from_secs_f64(self.rng.gen_range(5.0..=25.0))
        }
    }

    /// Finger travel time for the advance swipe: 0.3-0.8 s.
    pub fn swipe_duration(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen_range(0.3..=0.8))
    }

    /// Settle delay after a swipe: 0.5-1.5 s.
    pub fn settle_delay(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen_range(0.5..=1.5))
    }

    /// A "zoned out" stare: 5-15% of videos, 5-30 s.
    pub fn maybe_zone_out(&mut self) -> Option<Duration> {
        if self.rng.gen_bool(self.zone_out_probability) {
            Some(Duration::from_secs_f64(self.rng.gen_range(5.0..=30.0)))
        } else {
            None
        }
    }

    /// Videos between alert probes: every 5-8 consumed videos.
    pub fn alert_check_interval(&mut self) -> u32 {
        self.rng.gen_range(5..=8)
    }

    /// 12-15% per video, drawn against the session's fixed probability.
    pub fn should_like(&mut self) -> bool {
        let p = self.like_probability;
        self.rng.gen_bool(p)
    }

    /// Roughly 6% per video.
    pub fn should_follow(&mut self) -> bool {
        let p = self.follow_probability;
        self.rng.gen_bool(p)
    }

    /// Idle gap after a like: 30-90 s.
    pub fn like_gap(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen_range(30.0..=90.0))
    }

    /// Idle gap after a follow: 30-60 s.
    pub fn follow_gap(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen_range(30.0..=60.0))
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> Pacing {
        Pacing::from_rng(StdRng::seed_from_u64(7))
    }

    #[test]
    fn watch_duration_stays_in_union_of_ranges() {
        let mut pacing = fixed();
        for _ in 0..2000 {
            let d = pacing.watch_duration().as_secs_f64();
            assert!((5.0..=60.0).contains(&d), "watch {}s out of range", d);
        }
    }

    #[test]
    fn gesture_intervals_in_range() {
        let mut pacing = fixed();
        for _ in 0..500 {
            let swipe = pacing.swipe_duration().as_secs_f64();
            assert!((0.3..=0.8).contains(&swipe));
            let settle = pacing.settle_delay().as_secs_f64();
            assert!((0.5..=1.5).contains(&settle));
            let interval = pacing.alert_check_interval();
            assert!((5..=8).contains(&interval));
        }
    }

    #[test]
    fn zone_out_duration_and_frequency() {
        let mut pacing = fixed();
        let mut hits = 0u32;
        for _ in 0..5000 {
            if let Some(d) = pacing.maybe_zone_out() {
                hits += 1;
                assert!((5.0..=30.0).contains(&d.as_secs_f64()));
            }
        }
        let rate = hits as f64 / 5000.0;
        assert!((0.02..=0.20).contains(&rate), "zone-out rate {}", rate);
    }

    #[test]
    fn engagement_gaps_in_range() {
        let mut pacing = fixed();
        for _ in 0..500 {
            assert!((30.0..=90.0).contains(&pacing.like_gap().as_secs_f64()));
            assert!((30.0..=60.0).contains(&pacing.follow_gap().as_secs_f64()));
        }
    }

    #[test]
    fn caps_respect_platform_and_phase() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let caps = SessionCaps::sample(&mut rng, Platform::Tiktok, Phase::Light);
            assert!((5..=10).contains(&caps.likes));
            assert!((3..=7).contains(&caps.follows));

            let ig = SessionCaps::sample(&mut rng, Platform::Instagram, Phase::Moderate);
            assert!((3..=5).contains(&ig.follows));

            let relaxed = SessionCaps::sample(&mut rng, Platform::Tiktok, Phase::Active);
            assert!((8..=15).contains(&relaxed.likes));
            assert!((5..=10).contains(&relaxed.follows));
        }
    }

    #[test]
    fn like_rate_tracks_session_probability() {
        let mut pacing = fixed();
        let mut likes = 0u32;
        for _ in 0..10_000 {
            if pacing.should_like() {
                likes += 1;
            }
        }
        let rate = likes as f64 / 10_000.0;
        assert!((0.09..=0.18).contains(&rate), "like rate {}", rate);
    }
}
