use std::sync::OnceLock;

/// Shared PTS origin for both media branches.
///
/// The first capture timestamp offered by either producer becomes the origin;
/// every later PTS is relative to it. Set exactly once, readable from any
/// thread without locking.
#[derive(Debug, Default)]
pub struct TimeBase {
    origin_ns: OnceLock<i64>,
}

impl TimeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call established the origin.
    pub fn try_set_origin(&self, capture_ns: i64) -> bool {
        self.origin_ns.set(capture_ns).is_ok()
    }

    pub fn origin(&self) -> Option<i64> {
        self.origin_ns.get().copied()
    }

    /// `capture_ns - origin`, or `None` before any origin exists.
    /// May be negative for a timestamp that predates the origin.
    pub fn pts_for(&self, capture_ns: i64) -> Option<i64> {
        self.origin().map(|origin| capture_ns.saturating_sub(origin))
    }
}
