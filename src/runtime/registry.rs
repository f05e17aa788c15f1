//! The binding registry.
//!
//! A [`CallRegistry`] maps intercepted targets to the router that decides their calls. It is an
//! explicit context object: create one per test, bind and release routers while the test runs,
//! and call [`CallRegistry::teardown`] at the end. Leftover bindings are reported, never
//! cleaned up silently.
//!
//! The registry is single-threaded: it uses `RefCell` and is neither `Send` nor `Sync`.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use crate::{
    runtime::{
        call::{Call, CallRouter, Target},
        value::{ObjectId, RuntimeMethod, RuntimeType, Value},
    },
    Error, Result,
};

/// Target to router bindings of one test context.
#[derive(Default)]
pub struct CallRegistry {
    bindings: RefCell<HashMap<Target, Rc<dyn CallRouter>>>,
}

impl CallRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `router` to `target`.
    ///
    /// The returned handle releases exactly this binding.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateBinding`] if `target` is already bound.
    pub fn bind(&self, target: Target, router: Rc<dyn CallRouter>) -> Result<BindingHandle<'_>> {
        let mut bindings = self.bindings.borrow_mut();
        if bindings.contains_key(&target) {
            return Err(Error::DuplicateBinding(target.to_string()));
        }

        log::debug!("Bound router to {target}");
        bindings.insert(target.clone(), Rc::clone(&router));
        Ok(BindingHandle {
            registry: self,
            target,
            router,
            released: Cell::new(false),
        })
    }

    /// Removes the binding of `target`, which must hold `expected`.
    ///
    /// # Errors
    /// Returns [`Error::UnbalancedDispose`] if `target` is not bound, or
    /// [`Error::RegistryCorrupted`] if it is bound to a different router. A corrupted entry is
    /// left in place.
    pub fn release(&self, target: &Target, expected: &Rc<dyn CallRouter>) -> Result<()> {
        let mut bindings = self.bindings.borrow_mut();
        let Some(stored) = bindings.get(target) else {
            return Err(Error::UnbalancedDispose(target.to_string()));
        };
        if !Rc::ptr_eq(stored, expected) {
            return Err(Error::RegistryCorrupted(target.to_string()));
        }

        bindings.remove(target);
        log::debug!("Released router of {target}");
        Ok(())
    }

    /// Entry point of the `TryMock` bridge.
    ///
    /// Looks up the binding of the instance when `instance` carries its runtime type and id,
    /// the type binding of `owner` otherwise. Returns `(true, value)` if a router produced the result, `(false, default)`
    /// if the original body must run: no binding, or the router asked for the original.
    pub fn bridge(
        &self,
        owner: &RuntimeType,
        instance: Option<(&RuntimeType, ObjectId)>,
        return_type: &RuntimeType,
        method: RuntimeMethod,
        args: Vec<Value>,
    ) -> (bool, Value) {
        let target = match instance {
            Some((ty, id)) => Target::Instance(ty.clone(), id),
            None => Target::Type(owner.clone()),
        };

        // Clone out of the map so the router may bind or release while it runs.
        let router = self.bindings.borrow().get(&target).cloned();
        let Some(router) = router else {
            return (false, Value::default_for(return_type));
        };

        let call = Call::new(method, args, instance.map(|(_, id)| id), return_type.clone());
        let value = router.route(&call);
        if call.wants_original() {
            (false, Value::default_for(return_type))
        } else {
            (true, value)
        }
    }

    /// Ends the test context.
    ///
    /// # Errors
    /// Returns [`Error::LeakDetected`] naming every target that is still bound. The bindings
    /// stay in place.
    pub fn teardown(&self) -> Result<()> {
        let bindings = self.bindings.borrow();
        if bindings.is_empty() {
            return Ok(());
        }

        let mut leaked = bindings.keys().map(ToString::to_string).collect::<Vec<_>>();
        leaked.sort();
        Err(Error::LeakDetected(leaked))
    }

    /// Number of active bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.borrow().len()
    }

    /// Returns `true` if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.borrow().is_empty()
    }

    /// Returns `true` if `target` is bound.
    #[must_use]
    pub fn is_bound(&self, target: &Target) -> bool {
        self.bindings.borrow().contains_key(target)
    }
}

/// Releases one binding.
///
/// Dropping a handle that was never released logs a warning and keeps the binding, so that
/// [`CallRegistry::teardown`] reports it.
pub struct BindingHandle<'r> {
    registry: &'r CallRegistry,
    target: Target,
    router: Rc<dyn CallRouter>,
    released: Cell<bool>,
}

impl BindingHandle<'_> {
    /// The bound target.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Removes the binding.
    ///
    /// # Errors
    /// Returns [`Error::UnbalancedDispose`] on a second call, or any error of
    /// [`CallRegistry::release`].
    pub fn release(&self) -> Result<()> {
        if self.released.get() {
            return Err(Error::UnbalancedDispose(self.target.to_string()));
        }
        self.registry.release(&self.target, &self.router)?;
        self.released.set(true);
        Ok(())
    }
}

impl Drop for BindingHandle<'_> {
    fn drop(&mut self) {
        if !self.released.get() {
            log::warn!("Binding of {} dropped without release", self.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> RuntimeType {
        RuntimeType::new("Calculator", "Demo.Calculator")
    }

    fn int32() -> RuntimeType {
        RuntimeType::new("mscorlib", "System.Int32")
    }

    fn add() -> RuntimeMethod {
        RuntimeMethod {
            declaring: calculator(),
            name: "Add".to_string(),
            arity: 2,
        }
    }

    fn constant(value: i32) -> Rc<dyn CallRouter> {
        Rc::new(move |_: &Call| Value::I32(value))
    }

    #[test]
    fn bridge_without_binding_falls_through() {
        let registry = CallRegistry::new();
        let (handled, value) = registry.bridge(&calculator(), None, &int32(), add(), vec![]);
        assert!(!handled);
        assert_eq!(value, Value::I32(0));
    }

    #[test]
    fn bind_route_release() {
        let registry = CallRegistry::new();
        let handle = registry
            .bind(Target::Type(calculator()), constant(5))
            .unwrap();
        assert_eq!(registry.len(), 1);

        let (handled, value) = registry.bridge(&calculator(), None, &int32(), add(), vec![]);
        assert!(handled);
        assert_eq!(value, Value::I32(5));

        // Instance calls look up the instance, not the type.
        let (handled, _) =
            registry.bridge(&calculator(), Some((&calculator(), 4)), &int32(), add(), vec![]);
        assert!(!handled);

        handle.release().unwrap();
        assert!(registry.is_empty());
        registry.teardown().unwrap();
    }

    #[test]
    fn router_requesting_original() {
        let registry = CallRegistry::new();
        let router: Rc<dyn CallRouter> = Rc::new(|call: &Call| {
            call.call_original();
            Value::I32(42)
        });
        let handle = registry
            .bind(Target::Instance(calculator(), 7), router)
            .unwrap();

        let (handled, value) =
            registry.bridge(&calculator(), Some((&calculator(), 7)), &int32(), add(), vec![]);
        assert!(!handled);
        assert_eq!(value, Value::I32(0));
        handle.release().unwrap();
    }

    #[test]
    fn duplicate_binding() {
        let registry = CallRegistry::new();
        let first = registry
            .bind(Target::Type(calculator()), constant(1))
            .unwrap();
        let second = registry.bind(Target::Type(calculator()), constant(2));
        assert!(matches!(
            second,
            Err(Error::DuplicateBinding(ref name)) if name == "Demo.Calculator"
        ));
        first.release().unwrap();
    }

    #[test]
    fn unbalanced_dispose() {
        let registry = CallRegistry::new();
        let handle = registry
            .bind(Target::Type(calculator()), constant(1))
            .unwrap();
        handle.release().unwrap();
        assert!(matches!(handle.release(), Err(Error::UnbalancedDispose(_))));
        assert!(matches!(
            registry.release(&Target::Instance(calculator(), 1), &constant(1)),
            Err(Error::UnbalancedDispose(_))
        ));
    }

    #[test]
    fn foreign_router_is_corruption() {
        let registry = CallRegistry::new();
        let handle = registry
            .bind(Target::Type(calculator()), constant(1))
            .unwrap();
        assert!(matches!(
            registry.release(&Target::Type(calculator()), &constant(1)),
            Err(Error::RegistryCorrupted(_))
        ));
        assert!(registry.is_bound(handle.target()));
        handle.release().unwrap();
    }

    #[test]
    fn leaks_are_reported() {
        let registry = CallRegistry::new();
        let _type_handle = registry
            .bind(Target::Type(calculator()), constant(1))
            .unwrap();
        let _instance_handle = registry
            .bind(Target::Instance(calculator(), 3), constant(2))
            .unwrap();

        match registry.teardown() {
            Err(Error::LeakDetected(leaked)) => {
                assert_eq!(
                    leaked,
                    vec!["Demo.Calculator", "Demo.Calculator instance object#3"]
                );
            }
            other => panic!("expected a leak, got {other:?}"),
        }
        assert_eq!(registry.len(), 2);
    }
}
