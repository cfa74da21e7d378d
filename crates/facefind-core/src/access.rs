use subtle::ConstantTimeEq;

/// Decides whether an access code opens a scope's photos and cached matches.
pub trait AccessControl: Send + Sync {
    fn check(&self, event_id: &str, code: &str) -> bool;
}

/// Compare two secrets without an early exit on the first differing byte.
///
/// Only the lengths are observable through timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
