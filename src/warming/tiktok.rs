//! TikTok warmer: swipe-up feed consumption with an optional hashtag-search
//! subroutine that trains the recommendation engine toward the niche.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::watch;

use super::pacing::SessionCaps;
use super::{run_feed, swipe_up, FeedRun, FeedSurface, Warmer, WarmingOutcome};
use crate::agent::{AgentError, AgentSession, Strategy};
use crate::model::{Phase, Platform};

pub struct TiktokWarmer {
    niche_tag: Option<String>,
}

impl TiktokWarmer {
    pub fn new(niche_tag: Option<String>) -> Self {
        Self { niche_tag }
    }
}

struct TiktokFeed {
    niche_tag: Option<String>,
}

impl TiktokFeed {
    /// Search the niche hashtag and skim a few results. Seeds the For You
    /// feed; failures here are not worth aborting the session over.
    async fn hashtag_search(
        &self,
        session: &AgentSession,
        tag: &str,
        rng: &mut StdRng,
    ) -> Result<(), AgentError> {
        let search = session
            .find_first(&[
                (Strategy::AccessibilityId, "Search"),
                (Strategy::PredicateString, "name == 'Search' AND type == 'XCUIElementTypeButton'"),
            ])
            .await?;
        session.click(&search).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let field = session
            .find_first(&[
                (Strategy::ClassChain, "**/XCUIElementTypeSearchField"),
                (Strategy::ClassChain, "**/XCUIElementTypeTextField"),
            ])
            .await?;
        session.click(&field).await?;
        session.set_value(&field, &format!("#{}", tag)).await?;

        if let Ok(go) = session
            .find_first(&[(Strategy::AccessibilityId, "Search")])
            .await
        {
            session.click(&go).await?;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Open the top result and skim a handful of videos.
        let w = session.screen.width;
        let h = session.screen.height;
        session.tap(w * 0.25, h * 0.35).await?;
        for _ in 0..rng.gen_range(2..=4) {
            tokio::time::sleep(Duration::from_secs(rng.gen_range(4..=9))).await;
            swipe_up(session, Duration::from_millis(500)).await?;
        }

        // Back to the main feed.
        session
            .activate_app(Platform::Tiktok.bundle_id())
            .await?;
        if let Ok(home) = session
            .find_first(&[(Strategy::AccessibilityId, "Home")])
            .await
        {
            session.click(&home).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FeedSurface for TiktokFeed {
    async fn enter_feed(
        &self,
        session: &AgentSession,
        rng: &mut StdRng,
    ) -> Result<(), AgentError> {
        // Give the feed a moment to hydrate after launch.
        tokio::time::sleep(Duration::from_secs(2)).await;

        if let Some(tag) = &self.niche_tag {
            if rng.gen_bool(0.30) {
                if let Err(e) = self.hashtag_search(session, tag, rng).await {
                    tracing::debug!(error = %e, "hashtag search skipped");
                }
            }
        }
        Ok(())
    }

    async fn advance(
        &self,
        session: &AgentSession,
        _rng: &mut StdRng,
        swipe: Duration,
        _report: &mut super::WarmingReport,
    ) -> Result<(), AgentError> {
        swipe_up(session, swipe).await
    }

    async fn like_current(&self, session: &AgentSession) -> Result<(), AgentError> {
        // Double-tap hearts without leaving the video.
        let w = session.screen.width;
        let h = session.screen.height;
        session.double_tap(w * 0.5, h * 0.45).await
    }

    async fn follow_current(&self, session: &AgentSession) -> Result<(), AgentError> {
        let follow = session
            .find_first(&[
                (Strategy::AccessibilityId, "Follow"),
                (Strategy::PredicateString, "label == 'Follow' AND visible == 1"),
            ])
            .await?;
        session.click(&follow).await
    }
}

#[async_trait]
impl Warmer for TiktokWarmer {
    fn platform_name(&self) -> &'static str {
        "tiktok"
    }

    async fn passive_consumption(
        &self,
        session: &AgentSession,
        budget: Duration,
        stop: watch::Receiver<bool>,
    ) -> WarmingOutcome {
        let surface = TiktokFeed {
            // Phase 1 stays un-navigated: no searches, no taps beyond swipes.
            niche_tag: None,
        };
        run_feed(
            &surface,
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
        let caps = SessionCaps::sample(&mut rng, Platform::Tiktok, phase);
        let surface = TiktokFeed {
            niche_tag: self.niche_tag.clone(),
        };
        run_feed(
            &surface,
            session,
            FeedRun { caps, engage: true },
            budget,
            stop,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_runs_without_hashtag_seeding() {
        let warmer = TiktokWarmer::new(Some("fitness".into()));
        // Phase 1 never navigates; the tag only seeds engagement runs.
        assert!(warmer.niche_tag.is_some());
        assert_eq!(warmer.platform_name(), "tiktok");
    }
}
