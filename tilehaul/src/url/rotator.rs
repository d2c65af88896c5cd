//! Round-robin subdomain rotation.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates through a subdomain list so consecutive tile URLs spread across
/// hosts. The index advances monotonically across all materializations of
/// one run.
#[derive(Debug)]
pub struct SubdomainRotator {
    subdomains: Vec<String>,
    next: AtomicUsize,
}

impl SubdomainRotator {
    pub fn new(subdomains: Vec<String>) -> Self {
        Self {
            subdomains,
            next: AtomicUsize::new(0),
        }
    }

    /// A rotator that never populates the `{s}` slot.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Next subdomain in rotation, or `None` when the list is empty.
    pub fn next(&self) -> Option<&str> {
        if self.subdomains.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subdomains.len();
        Some(&self.subdomains[idx])
    }
}
