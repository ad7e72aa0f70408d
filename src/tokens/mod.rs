//! Token lifecycle: serve a valid access token per provider, refreshing it
//! through the provider's issuer at most once per stale period.

mod clock;
mod manager;
pub mod refresh;
mod seed;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{
    AccessToken, TokenManager, DEFAULT_EXPIRES_IN_SECS, DEFAULT_SKEW_SECS, MAX_EXPIRES_IN_SECS,
};
pub use refresh::refresh_daemon;
pub use seed::{SeedExpiry, SeedRequest};
