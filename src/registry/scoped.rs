//! Per-request slot set.

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use super::lifecycle::RequestScope;
use super::SingletonRegistry;
use crate::error::RegistryError;

/// The live singleton instances of one request.
///
/// Slots hold `Rc` values and the set is not `Send`: it belongs to the
/// thread serving the request, so no locking is needed.
pub struct ScopedSingletons {
    registry: Arc<SingletonRegistry>,
    slots: RefCell<HashMap<TypeId, Rc<dyn Any>>>,
    constructing: RefCell<Vec<TypeId>>,
}

impl ScopedSingletons {
    /// Create an empty slot set backed by a registry.
    pub fn new(registry: Arc<SingletonRegistry>) -> Self {
        Self {
            registry,
            slots: RefCell::new(HashMap::new()),
            constructing: RefCell::new(Vec::new()),
        }
    }

    /// Get the registry backing this slot set.
    pub fn registry(&self) -> &Arc<SingletonRegistry> {
        &self.registry
    }

    /// Get the current instance of `T`, constructing it if the slot is empty.
    pub fn instance<T: Any>(&self) -> Result<Rc<T>, RegistryError> {
        let type_id = TypeId::of::<T>();
        let registration = self
            .registry
            .registration(&type_id)
            .ok_or(RegistryError::Unregistered(type_name::<T>()))?;

        let existing = self.slots.borrow().get(&type_id).cloned();
        if let Some(existing) = existing {
            return downcast::<T>(existing);
        }

        if self.constructing.borrow().contains(&type_id) {
            return Err(RegistryError::Cycle(type_name::<T>()));
        }

        self.constructing.borrow_mut().push(type_id);
        let built = (registration.factory)(self);
        self.constructing.borrow_mut().retain(|id| *id != type_id);
        let built = built?;

        debug!("Constructed scoped singleton: {}", registration.type_name);

        self.slots.borrow_mut().insert(type_id, Rc::clone(&built));
        downcast::<T>(built)
    }

    /// Make `obj` the current instance of its type.
    pub fn activate<T: Any>(&self, obj: Rc<T>) -> Result<(), RegistryError> {
        let type_id = TypeId::of::<T>();
        if self.registry.registration(&type_id).is_none() {
            return Err(RegistryError::Unregistered(type_name::<T>()));
        }

        let previous = self.slots.borrow_mut().insert(type_id, obj as Rc<dyn Any>);
        drop(previous);
        Ok(())
    }

    /// Empty the slot of `T`.
    pub fn deactivate<T: Any>(&self) {
        let previous = self.slots.borrow_mut().remove(&TypeId::of::<T>());
        drop(previous);
    }

    /// Check if `T` currently has a live instance.
    pub fn is_active<T: Any>(&self) -> bool {
        self.slots.borrow().contains_key(&TypeId::of::<T>())
    }

    /// Get the number of live instances.
    pub fn active_count(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Deactivate every registered type.
    ///
    /// The next `instance()` call for any type constructs fresh state.
    pub fn clear_globals(&self) {
        let drained: Vec<Rc<dyn Any>> = {
            let mut slots = self.slots.borrow_mut();
            self.registry
                .type_ids()
                .filter_map(|id| slots.remove(id))
                .collect()
        };

        if !drained.is_empty() {
            debug!("Cleared {} scoped singletons", drained.len());
        }
        // Instances are dropped here, outside the slot borrow.
        drop(drained);
    }

    /// Mark the start of a request; the returned guard ends it on drop.
    pub fn begin_request(&self) -> RequestScope<'_, Self> {
        RequestScope::new(self)
    }
}

impl std::fmt::Debug for ScopedSingletons {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedSingletons")
            .field("registered", &self.registry.len())
            .field("active", &self.active_count())
            .finish()
    }
}

fn downcast<T: Any>(value: Rc<dyn Any>) -> Result<Rc<T>, RegistryError> {
    value
        .downcast::<T>()
        .map_err(|_| RegistryError::TypeMismatch(type_name::<T>()))
}
