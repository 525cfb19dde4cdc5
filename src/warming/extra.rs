//! Warmers for platforms the scheduler does not operate yet. Defined so the
//! engine surface is complete when those distribution targets activate.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::sync::watch;

use super::pacing::SessionCaps;
use super::{run_feed, swipe_up, FeedRun, FeedSurface, Warmer, WarmingOutcome, WarmingReport};
use crate::agent::{AgentError, AgentSession, Strategy};
use crate::model::Phase;

/// Generic vertical-feed surface: swipe to advance, double-tap to like,
/// follow via a labeled control.
struct SwipeFeed {
    follow_label: &'static str,
}

#[async_trait]
impl FeedSurface for SwipeFeed {
    async fn enter_feed(
        &self,
        _session: &AgentSession,
        _rng: &mut StdRng,
    ) -> Result<(), AgentError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    async fn advance(
        &self,
        session: &AgentSession,
        _rng: &mut StdRng,
        swipe: Duration,
        _report: &mut WarmingReport,
    ) -> Result<(), AgentError> {
        swipe_up(session, swipe).await
    }

    async fn like_current(&self, session: &AgentSession) -> Result<(), AgentError> {
        let w = session.screen.width;
        let h = session.screen.height;
        session.double_tap(w * 0.5, h * 0.45).await
    }

    async fn follow_current(&self, session: &AgentSession) -> Result<(), AgentError> {
        let label = format!("label == '{}' AND visible == 1", self.follow_label);
        let follow = session
            .find_first(&[(Strategy::PredicateString, &label)])
            .await?;
        session.click(&follow).await
    }
}

macro_rules! swipe_feed_warmer {
    ($name:ident, $platform:literal, $follow:literal) => {
        pub struct $name;

        #[async_trait]
        impl Warmer for $name {
            fn platform_name(&self) -> &'static str {
                $platform
            }

            async fn passive_consumption(
                &self,
                session: &AgentSession,
                budget: Duration,
                stop: watch::Receiver<bool>,
            ) -> WarmingOutcome {
                let surface = SwipeFeed {
                    follow_label: $follow,
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
                let caps = SessionCaps::sample_generic(&mut rng, phase);
                let surface = SwipeFeed {
                    follow_label: $follow,
                };
                run_feed(&surface, session, FeedRun { caps, engage: true }, budget, stop).await
            }
        }
    };
}

swipe_feed_warmer!(YoutubeWarmer, "youtube", "Subscribe");
swipe_feed_warmer!(RedditWarmer, "reddit", "Join");
swipe_feed_warmer!(XWarmer, "x", "Follow");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_platforms_are_named() {
        assert_eq!(YoutubeWarmer.platform_name(), "youtube");
        assert_eq!(RedditWarmer.platform_name(), "reddit");
        assert_eq!(XWarmer.platform_name(), "x");
    }
}
