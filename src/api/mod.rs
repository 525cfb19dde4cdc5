//! Dashboard HTTP surface.
//!
//! ## Endpoints
//!
//! - `GET /api/overview` - Fleet counts and recent events
//! - `GET /api/accounts` - Accounts filtered by platform/state/niche
//! - `GET /api/devices` - Device fleet
//! - `GET /api/events` - Cursored, filtered event log
//! - `GET /api/events/unresolved` - Open events
//! - `POST /api/events/{id}/resolve` - Mark an event handled
//! - `GET /api/logs/stream` - Live event tail via SSE
//! - `POST /api/scheduler/start` / `POST /api/scheduler/stop` /
//!   `GET /api/scheduler/status`

mod routes;

pub use routes::{router, serve, AppState};
