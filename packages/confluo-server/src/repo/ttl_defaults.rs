//! Per-method default TTLs, applied via `CachedWrapper::set_method_config`
//! at repository construction. Guidance, not law: any repository may
//! override them for a particular deployment.

use std::time::Duration;

// Hot data (processor, route, project) uses `Config::base_ttl` directly at
// the call site -- it carries no offset of its own, so there is no
// constant for it here.

/// Very stable data (user profile, provider classes): 10-15 minutes.
pub const VERY_STABLE: Duration = Duration::from_secs(12 * 60);

/// Structural data (column definitions, state config): 5-10 minutes.
pub const STRUCTURAL: Duration = Duration::from_secs(7 * 60);

/// `FindAllByUserID` favors list stability: `base + 2 minutes`.
#[must_use]
pub fn list_ttl(base_ttl: Duration) -> Duration {
    base_ttl + Duration::from_secs(120)
}
