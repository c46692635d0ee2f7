//! Scoped singleton registry.
//!
//! Request-lifetime singletons are split in two halves:
//! - `SingletonRegistry` - the static table of factories, built once at
//!   startup and shared by every worker thread
//! - `ScopedSingletons` - the slot set of a single request, holding at most
//!   one live instance per registered type
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = SingletonRegistry::builder()
//!     .register_default::<Connection>()?
//!     .build();
//!
//! let singletons = ScopedSingletons::new(registry);
//! let _request = singletons.begin_request();
//! let conn = singletons.instance::<Connection>()?;
//! ```

mod lifecycle;
mod scoped;

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::RegistryError;

pub use lifecycle::{RequestLifecycle, RequestScope};
pub use scoped::ScopedSingletons;

/// A type that can be constructed without arguments as a scoped singleton.
pub trait ScopedSingleton: Any {
    /// Called once when the instance is first created for a request.
    fn init() -> Self;
}

type Factory = Box<dyn Fn(&ScopedSingletons) -> Result<Rc<dyn Any>, RegistryError> + Send + Sync>;

/// Type-erased registration entry.
struct Registration {
    factory: Factory,
    type_name: &'static str,
}

/// Static table of every type that may live in a request's slot set.
///
/// Registration happens through [`RegistryBuilder`] only, so the set of
/// types is fixed before the first request is served.
pub struct SingletonRegistry {
    entries: HashMap<TypeId, Registration>,
}

impl SingletonRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entries: HashMap::new(),
        }
    }

    /// Check if a type has been registered.
    pub fn contains<T: Any>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Get the number of registered types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the names of all registered types.
    pub fn type_names(&self) -> Vec<&'static str> {
        self.entries.values().map(|r| r.type_name).collect()
    }

    fn registration(&self, type_id: &TypeId) -> Option<&Registration> {
        self.entries.get(type_id)
    }

    fn type_ids(&self) -> impl Iterator<Item = &TypeId> {
        self.entries.keys()
    }
}

impl std::fmt::Debug for SingletonRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingletonRegistry")
            .field("type_count", &self.entries.len())
            .field("type_names", &self.type_names())
            .finish()
    }
}

/// Builder collecting registrations before the registry is frozen.
pub struct RegistryBuilder {
    entries: HashMap<TypeId, Registration>,
}

impl RegistryBuilder {
    /// Register a type with a factory.
    ///
    /// The factory receives the requesting slot set so it can resolve other
    /// singletons it depends on.
    pub fn register<T, F>(mut self, factory: F) -> Result<Self, RegistryError>
    where
        T: Any,
        F: Fn(&ScopedSingletons) -> Result<Rc<T>, RegistryError> + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        if self.entries.contains_key(&type_id) {
            return Err(RegistryError::AlreadyRegistered(type_name::<T>()));
        }

        debug!("Registering scoped singleton: {}", type_name::<T>());

        self.entries.insert(
            type_id,
            Registration {
                factory: Box::new(move |scope| factory(scope).map(|rc| rc as Rc<dyn Any>)),
                type_name: type_name::<T>(),
            },
        );

        Ok(self)
    }

    /// Register a type constructed through [`ScopedSingleton::init`].
    pub fn register_default<T: ScopedSingleton>(self) -> Result<Self, RegistryError> {
        self.register::<T, _>(|_| Ok(Rc::new(T::init())))
    }

    /// Freeze the registry.
    pub fn build(self) -> Arc<SingletonRegistry> {
        info!("Singleton registry built with {} types", self.entries.len());
        Arc::new(SingletonRegistry {
            entries: self.entries,
        })
    }
}
