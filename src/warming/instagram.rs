//! Instagram warmer: a 40/60 mix of the classic feed and Reels, with the
//! follow action driven through its text-labeled control.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use super::pacing::SessionCaps;
use super::{run_feed, swipe_up, FeedRun, FeedSurface, Warmer, WarmingOutcome, WarmingReport};
use crate::agent::{AgentError, AgentSession, Strategy};
use crate::model::{Phase, Platform};

const SURFACE_UNKNOWN: u8 = 0;
const SURFACE_FEED: u8 = 1;
const SURFACE_REELS: u8 = 2;

/// Share of consumption spent on Reels rather than the classic feed.
const REELS_SHARE: f64 = 0.60;

pub struct InstagramWarmer {
    surface: AtomicU8,
}

impl InstagramWarmer {
    pub fn new() -> Self {
        Self {
            surface: AtomicU8::new(SURFACE_UNKNOWN),
        }
    }
}

impl Default for InstagramWarmer {
    fn default() -> Self {
        Self::new()
    }
}

impl InstagramWarmer {
    async fn switch_to(&self, session: &AgentSession, target: u8) -> Result<(), AgentError> {
        if self.surface.load(Ordering::Relaxed) == target {
            return Ok(());
        }
        let candidates: &[(Strategy, &str)] = if target == SURFACE_REELS {
            &[
                (Strategy::AccessibilityId, "reels-tab"),
                (Strategy::PredicateString, "name == 'Reels' AND type == 'XCUIElementTypeButton'"),
            ]
        } else {
            &[
                (Strategy::AccessibilityId, "mainfeed-tab"),
                (Strategy::PredicateString, "name == 'Home' AND type == 'XCUIElementTypeButton'"),
            ]
        };
        let tab = session.find_first(candidates).await?;
        session.click(&tab).await?;
        self.surface.store(target, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl FeedSurface for InstagramWarmer {
    async fn enter_feed(
        &self,
        session: &AgentSession,
        _rng: &mut StdRng,
    ) -> Result<(), AgentError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.surface.store(SURFACE_UNKNOWN, Ordering::Relaxed);
        self.switch_to(session, SURFACE_FEED).await
    }

    async fn advance(
        &self,
        session: &AgentSession,
        rng: &mut StdRng,
        swipe: Duration,
        report: &mut WarmingReport,
    ) -> Result<(), AgentError> {
        if rng.gen_bool(REELS_SHARE) {
            self.switch_to(session, SURFACE_REELS).await?;
            swipe_up(session, swipe).await?;
            report.reels_watched += 1;
        } else {
            self.switch_to(session, SURFACE_FEED).await?;
            // Feed posts scroll by roughly half a screen.
            let w = session.screen.width;
            let h = session.screen.height;
            session
                .swipe((w * 0.5, h * 0.72), (w * 0.5, h * 0.35), swipe)
                .await?;
        }
        Ok(())
    }

    async fn like_current(&self, session: &AgentSession) -> Result<(), AgentError> {
        let w = session.screen.width;
        let h = session.screen.height;
        session.double_tap(w * 0.5, h * 0.45).await
    }

    async fn follow_current(&self, session: &AgentSession) -> Result<(), AgentError> {
        // Instagram's follow affordance is the literal "Follow" label.
        let follow = session
            .find_first(&[
                (Strategy::PredicateString, "label == 'Follow' AND visible == 1"),
                (Strategy::ClassChain, "**/XCUIElementTypeButton[`label == 'Follow'`]"),
            ])
            .await?;
        session.click(&follow).await
    }
}

#[async_trait]
impl Warmer for InstagramWarmer {
    fn platform_name(&self) -> &'static str {
        "instagram"
    }

    async fn passive_consumption(
        &self,
        session: &AgentSession,
        budget: Duration,
        stop: watch::Receiver<bool>,
    ) -> WarmingOutcome {
        run_feed(
            self,
            session,
            FeedRun {
                caps: SessionCaps {
                    likes: 0,
                    follows: 0,
                },
                engage: false,
            },
            budget,
            stop,
        )
        .await
    }

    async fn light_engagement(
        &self,
        session: &AgentSession,
        phase: Phase,
        budget: Duration,
        stop: watch::Receiver<bool>,
    ) -> WarmingOutcome {
        let mut rng = StdRng::from_entropy();
        let caps = SessionCaps::sample(&mut rng, Platform::Instagram, phase);
        run_feed(self, session, FeedRun { caps, engage: true }, budget, stop).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_tracking_starts_unknown() {
        let warmer = InstagramWarmer::new();
        assert_eq!(warmer.surface.load(Ordering::Relaxed), SURFACE_UNKNOWN);
    }

    #[test]
    fn reels_share_matches_spec_mix() {
        // 40% classic feed / 60% Reels.
        assert!((REELS_SHARE - 0.60).abs() < f64::EPSILON);
    }
}
