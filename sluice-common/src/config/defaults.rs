use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::Secret;

pub(crate) const fn _default_true() -> bool {
    true
}

pub(crate) const fn _default_false() -> bool {
    false
}

#[inline]
pub(crate) fn _default_database_url() -> Secret<String> {
    Secret::new("sqlite:data/db".to_owned())
}

#[inline]
pub(crate) fn _default_http_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8788))
}

/// Long enough to outlive a compile or analysis run with margin.
#[inline]
pub(crate) fn _default_lease_ttl() -> Duration {
    Duration::from_secs(60 * 5)
}

#[inline]
pub(crate) fn _default_stale_after() -> Duration {
    Duration::from_secs(60 * 30)
}

#[inline]
pub(crate) fn _default_reaper_interval() -> Duration {
    Duration::from_secs(60 * 5)
}

#[inline]
pub(crate) fn _default_rate_limit_window() -> Duration {
    Duration::from_secs(60 * 60)
}

pub(crate) const fn _default_subject_cap() -> i64 {
    1_000_000
}

pub(crate) const fn _default_scope_cap() -> i64 {
    200_000
}
