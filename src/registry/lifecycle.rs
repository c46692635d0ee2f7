//! Request lifecycle hooks.

use std::ops::Deref;

use tracing::debug;

use super::ScopedSingletons;

/// Hooks the host calls around every request it serves.
pub trait RequestLifecycle {
    /// Called before the request's handler runs.
    fn on_request_start(&self);

    /// Called after the handler finished, including on the error path.
    fn on_request_end(&self);
}

impl RequestLifecycle for ScopedSingletons {
    fn on_request_start(&self) {
        // Leftovers from a previous request on this thread must not leak in.
        self.clear_globals();
    }

    fn on_request_end(&self) {
        self.clear_globals();
    }
}

/// Guard spanning one request.
///
/// Calls `on_request_start` when created and `on_request_end` when dropped,
/// so early returns and panics still end the request.
pub struct RequestScope<'a, L: RequestLifecycle + ?Sized> {
    lifecycle: &'a L,
}

impl<'a, L: RequestLifecycle + ?Sized> RequestScope<'a, L> {
    pub fn new(lifecycle: &'a L) -> Self {
        debug!("Request started");
        lifecycle.on_request_start();
        Self { lifecycle }
    }
}

impl<L: RequestLifecycle + ?Sized> Deref for RequestScope<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        self.lifecycle
    }
}

impl<L: RequestLifecycle + ?Sized> Drop for RequestScope<'_, L> {
    fn drop(&mut self) {
        self.lifecycle.on_request_end();
        debug!("Request ended");
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::error::RegistryError;
    use crate::registry::{ScopedSingleton, SingletonRegistry};

    struct RequestState;

    impl ScopedSingleton for RequestState {
        fn init() -> Self {
            RequestState
        }
    }

    fn singletons() -> ScopedSingletons {
        ScopedSingletons::new(
            SingletonRegistry::builder()
                .register_default::<RequestState>()
                .unwrap()
                .build(),
        )
    }

    #[test]
    fn test_sequential_requests_never_share_state() {
        let singletons = singletons();

        let first = {
            let request = singletons.begin_request();
            request.instance::<RequestState>().unwrap()
        };
        assert!(!singletons.is_active::<RequestState>());

        let second = {
            let request = singletons.begin_request();
            request.instance::<RequestState>().unwrap()
        };

        assert!(!Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_start_clears_leftovers() {
        let singletons = singletons();
        let leaked = singletons.instance::<RequestState>().unwrap();

        let request = singletons.begin_request();
        let fresh = request.instance::<RequestState>().unwrap();
        assert!(!Rc::ptr_eq(&leaked, &fresh));
    }

    #[test]
    fn test_error_path_clears() {
        fn failing_handler(singletons: &ScopedSingletons) -> Result<(), RegistryError> {
            let _request = singletons.begin_request();
            singletons.instance::<RequestState>()?;
            Err(RegistryError::Unregistered("handler failed"))
        }

        let singletons = singletons();
        assert!(failing_handler(&singletons).is_err());
        assert_eq!(singletons.active_count(), 0);
    }
}
