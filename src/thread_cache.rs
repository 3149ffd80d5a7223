//! Per-thread hazard registration cache.
//!
//! Registering with a [`HazardDomain`] on every operation would be far too
//! expensive, so this helper memoises one [`HazardThread`] per domain per
//! OS thread in thread-local storage. The registration is dropped (and the
//! thread unregistered) by the thread-local destructor when the thread
//! exits.

use std::cell::RefCell;
use std::sync::Arc;

use crate::hp::{HazardDomain, HazardThread};

thread_local! {
    static REGISTRATIONS: RefCell<Vec<Registration>> = RefCell::new(Vec::new());
}

struct Registration {
    domain: *const HazardDomain,
    thread: HazardThread,
}

/// Hands out the calling thread's registration for one domain.
pub struct ThreadCache {
    domain: Arc<HazardDomain>,
}

impl ThreadCache {
    /// Create a cache registering threads with `domain`.
    pub fn new(domain: Arc<HazardDomain>) -> Self {
        Self { domain }
    }

    /// The domain this cache registers threads with.
    #[inline]
    pub fn domain(&self) -> &Arc<HazardDomain> {
        &self.domain
    }

    /// Run `f` with the calling thread's registration, registering on
    /// first use.
    ///
    /// `f` must not call back into a `ThreadCache` on the same thread; the
    /// thread-local registration table is borrowed for its duration.
    pub fn with<R>(&self, f: impl FnOnce(&HazardThread) -> R) -> R {
        REGISTRATIONS.with(|registrations| {
            let mut registrations = registrations.borrow_mut();
            let key = Arc::as_ptr(&self.domain);
            let index = match registrations.iter().position(|r| r.domain == key) {
                Some(index) => index,
                None => {
                    registrations.push(Registration {
                        domain: key,
                        thread: self.domain.register(),
                    });
                    registrations.len() - 1
                }
            };
            f(&registrations[index].thread)
        })
    }
}
