//! Warming behavior engine.
//!
//! A family of per-platform warmers exposing two primitives: pure
//! consumption for phase 1, rate-limited light engagement for phases 2-4.
//! Warmers never touch the store; they hand a [`WarmingReport`] back to the
//! session runner. Every sleep races the stop signal so shutdown preempts a
//! session mid-video, and heavy UI-tree reads are banned inside the loop:
//! the only allowed probe is the agent's one-shot alert text.

mod extra;
mod instagram;
pub mod pacing;
mod tiktok;

pub use extra::{RedditWarmer, XWarmer, YoutubeWarmer};
pub use instagram::InstagramWarmer;
pub use tiktok::TiktokWarmer;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::agent::{AgentError, AgentSession};
use crate::model::{Phase, Platform};
use pacing::{Pacing, SessionCaps};

/// Counters handed back to the session runner and persisted as the
/// `session_data` payload of the warming record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmingReport {
    pub videos_watched: u32,
    pub likes: u32,
    pub follows: u32,
    pub zone_outs: u32,
    pub alerts_dismissed: u32,
    pub hashtag_searches: u32,
    pub reels_watched: u32,
}

/// What a warming primitive came back with. Partial progress is always
/// reported, even when an agent error or the stop signal cut the loop short.
#[derive(Debug)]
pub struct WarmingOutcome {
    pub report: WarmingReport,
    pub error: Option<AgentError>,
    pub interrupted: bool,
}

impl WarmingOutcome {
    fn completed(report: WarmingReport) -> Self {
        Self {
            report,
            error: None,
            interrupted: false,
        }
    }
}

/// One platform's warming behaviors.
#[async_trait]
pub trait Warmer: Send + Sync {
    fn platform_name(&self) -> &'static str;

    /// Browse without interacting.
    async fn passive_consumption(
        &self,
        session: &AgentSession,
        budget: Duration,
        stop: watch::Receiver<bool>,
    ) -> WarmingOutcome;

    /// Consumption mixed with rate-limited likes and follows.
    async fn light_engagement(
        &self,
        session: &AgentSession,
        phase: Phase,
        budget: Duration,
        stop: watch::Receiver<bool>,
    ) -> WarmingOutcome;
}

/// The warmer the scheduler runs for an operated platform. The niche tag
/// feeds TikTok's recommendation-training search; None skips it.
pub fn warmer_for(platform: Platform, niche_tag: Option<String>) -> Box<dyn Warmer> {
    match platform {
        Platform::Tiktok => Box::new(TiktokWarmer::new(niche_tag)),
        Platform::Instagram => Box::new(InstagramWarmer::new()),
    }
}

/// Sleep that races the stop signal. Returns true when the stop signal fired
/// (possibly before any sleep at all).
pub(crate) async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = stop.changed() => changed.map(|_| *stop.borrow()).unwrap_or(true),
    }
}

/// Platform-specific hooks the shared feed loop drives.
#[async_trait]
pub(crate) trait FeedSurface: Send + Sync {
    /// Bring the app to the consumable surface (open feed, dismiss launch
    /// interstitials). Runs once before the loop.
    async fn enter_feed(&self, session: &AgentSession, rng: &mut StdRng)
        -> Result<(), AgentError>;

    /// Advance to the next video. May switch sub-surfaces (e.g. feed vs
    /// Reels) and should bump the report's surface counters.
    async fn advance(
        &self,
        session: &AgentSession,
        rng: &mut StdRng,
        swipe: Duration,
        report: &mut WarmingReport,
    ) -> Result<(), AgentError>;

    /// Like whatever is on screen.
    async fn like_current(&self, session: &AgentSession) -> Result<(), AgentError>;

    /// Follow the current author.
    async fn follow_current(&self, session: &AgentSession) -> Result<(), AgentError>;
}

/// Configuration for one run of the shared loop.
pub(crate) struct FeedRun {
    pub caps: SessionCaps,
    pub engage: bool,
}

/// The consumption loop shared by every warmer: watch, maybe zone out,
/// maybe engage, swipe on. Elapsed wall-clock, the stop signal, and the
/// session caps are all re-checked every iteration.
pub(crate) async fn run_feed(
    surface: &dyn FeedSurface,
    session: &AgentSession,
    run: FeedRun,
    budget: Duration,
    mut stop: watch::Receiver<bool>,
) -> WarmingOutcome {
    let started = Instant::now();
    let mut pacing = Pacing::new();
    let caps = run.caps;
    let mut report = WarmingReport::default();
    let mut next_alert_check = pacing.alert_check_interval();

    macro_rules! step {
        ($call:expr) => {
            match $call {
                Ok(value) => value,
                Err(e) => {
                    return WarmingOutcome {
                        report,
                        error: Some(e),
                        interrupted: false,
                    }
                }
            }
        };
    }

    step!(surface.enter_feed(session, pacing.rng()).await);

    loop {
        if started.elapsed() >= budget {
            break;
        }

        // Watch the current video; the remaining budget always wins.
        let watch = pacing.watch_duration().min(budget - started.elapsed());
        if sleep_or_stop(watch, &mut stop).await {
            return WarmingOutcome {
                report,
                error: None,
                interrupted: true,
            };
        }
        report.videos_watched += 1;

        if let Some(stare) = pacing.maybe_zone_out() {
            report.zone_outs += 1;
            if sleep_or_stop(stare, &mut stop).await {
                return WarmingOutcome {
                    report,
                    error: None,
                    interrupted: true,
                };
            }
        }

        // Periodic lightweight alert probe; anything modal gets dismissed.
        if report.videos_watched >= next_alert_check {
            next_alert_check = report.videos_watched + pacing.alert_check_interval();
            if let Some(_text) = step!(session.alert_text().await) {
                step!(session.dismiss_alert().await);
                report.alerts_dismissed += 1;
            }
        }

        if run.engage {
            if report.likes < caps.likes && pacing.should_like() {
                step!(surface.like_current(session).await);
                report.likes += 1;
                if sleep_or_stop(pacing.like_gap(), &mut stop).await {
                    return WarmingOutcome {
                        report,
                        error: None,
                        interrupted: true,
                    };
                }
            }
            if report.follows < caps.follows && pacing.should_follow() {
                step!(surface.follow_current(session).await);
                report.follows += 1;
                if sleep_or_stop(pacing.follow_gap(), &mut stop).await {
                    return WarmingOutcome {
                        report,
                        error: None,
                        interrupted: true,
                    };
                }
            }
        }

        if started.elapsed() >= budget {
            break;
        }

        let swipe = pacing.swipe_duration();
        step!(surface.advance(session, pacing.rng(), swipe, &mut report).await);
        if sleep_or_stop(pacing.settle_delay(), &mut stop).await {
            return WarmingOutcome {
                report,
                error: None,
                interrupted: true,
            };
        }
    }

    WarmingOutcome::completed(report)
}

/// Standard feed-advance swipe: bottom-to-top through the middle of the
/// screen.
pub(crate) async fn swipe_up(
    session: &AgentSession,
    duration: Duration,
) -> Result<(), AgentError> {
    let w = session.screen.width;
    let h = session.screen.height;
    session
        .swipe((w * 0.5, h * 0.78), (w * 0.5, h * 0.22), duration)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_or_stop_preempts_immediately_when_already_stopped() {
        let (tx, mut rx) = watch::channel(true);
        let started = Instant::now();
        assert!(sleep_or_stop(Duration::from_secs(60), &mut rx).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(tx);
    }

    #[tokio::test]
    async fn sleep_or_stop_wakes_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            sleep_or_stop(Duration::from_secs(60), &mut rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn sleep_or_stop_completes_short_sleeps() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!sleep_or_stop(Duration::from_millis(5), &mut rx).await);
    }

    #[test]
    fn warmer_factory_covers_operated_platforms() {
        for platform in Platform::OPERATED {
            let warmer = warmer_for(platform, Some("personal_finance".into()));
            assert!(!warmer.platform_name().is_empty());
        }
    }

    #[test]
    fn report_serializes_for_session_data() {
        let report = WarmingReport {
            videos_watched: 40,
            likes: 3,
            follows: 1,
            ..WarmingReport::default()
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["videos_watched"], 40);
        assert_eq!(value["likes"], 3);
    }
}
