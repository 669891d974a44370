//! Typed, lazily resolved task properties.
//!
//! A [`Property`] is a named slot owned by a task. Its value comes from a [`Supplier`], which may
//! be a constant, a callable or a view on another task's property. Reading another task's property
//! records it in the supplier's [`Lineage`], which is how the task graph infers data dependencies.

mod supplier;

pub use supplier::{Dependency, Supplier};

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use supplier::Node;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PropertyError {
    #[error("property '{owner}.{name}' is empty")]
    Empty { owner: String, name: String },

    #[error("output property '{owner}.{name}' has not been produced yet")]
    NotYetProduced { owner: String, name: String },

    #[error("output property '{owner}.{name}' was already produced in this execution")]
    AlreadyProduced { owner: String, name: String },

    #[error("property '{owner}.{name}' is finalized and cannot be changed")]
    Finalized { owner: String, name: String },

    #[error("supplier has no value")]
    Void,

    #[error("{0}")]
    Supplier(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyRole {
    Plain,
    /// Frozen to a constant before the owning task executes.
    Config,
    /// Produced by the owning task while it executes.
    Output,
}

/// A property that a supplier reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    pub task: String,
    pub property: String,
    pub role: PropertyRole,
}

/// Type-erased access to a property, used by the runner and the task graph.
pub trait AnyProperty: Send + Sync {
    fn owner(&self) -> &str;
    fn name(&self) -> &str;
    fn role(&self) -> PropertyRole;
    fn is_set(&self) -> bool;
    fn is_filled(&self) -> bool;
    fn finalize(&self) -> Result<(), PropertyError>;
    fn lineage(&self) -> Vec<Lineage>;
    fn clear(&self);
}

struct State<T> {
    supplier: Option<Supplier<T>>,
    default: Option<Supplier<T>>,
    finalized: bool,
    produced: bool,
}

struct Inner<T> {
    owner: String,
    name: String,
    role: PropertyRole,
    state: RwLock<State<T>>,
}

/// A named, typed value slot on a task. Cloning a property yields another handle to the same slot.
pub struct Property<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Property({}.{})", self.inner.owner, self.inner.name)
    }
}

impl<T> Property<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn with_role(owner: &str, name: &str, role: PropertyRole) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner: owner.to_string(),
                name: name.to_string(),
                role,
                state: RwLock::new(State {
                    supplier: None,
                    default: None,
                    finalized: false,
                    produced: false,
                }),
            }),
        }
    }

    pub fn new(owner: &str, name: &str) -> Self {
        Self::with_role(owner, name, PropertyRole::Plain)
    }

    pub fn config(owner: &str, name: &str) -> Self {
        Self::with_role(owner, name, PropertyRole::Config)
    }

    pub fn output(owner: &str, name: &str) -> Self {
        Self::with_role(owner, name, PropertyRole::Output)
    }

    pub fn with_default(self, value: T) -> Self {
        self.write().default = Some(Supplier::of(value));
        self
    }

    pub fn with_default_supplier(self, supplier: Supplier<T>) -> Self {
        self.write().default = Some(supplier);
        self
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn read(&self) -> RwLockReadGuard<'_, State<T>> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<T>> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn empty_error(&self) -> PropertyError {
        let owner = self.inner.owner.clone();
        let name = self.inner.name.clone();
        match self.inner.role {
            PropertyRole::Output => PropertyError::NotYetProduced { owner, name },
            _ => PropertyError::Empty { owner, name },
        }
    }

    /// Replace the underlying supplier. Passing a supplier aliases it rather than copying its value.
    /// Output properties accept one assignment per execution.
    pub fn set(&self, value: impl Into<Supplier<T>>) -> Result<(), PropertyError> {
        let mut state = self.write();
        if state.finalized {
            return Err(PropertyError::Finalized {
                owner: self.inner.owner.clone(),
                name: self.inner.name.clone(),
            });
        }
        if self.inner.role == PropertyRole::Output {
            if state.produced {
                return Err(PropertyError::AlreadyProduced {
                    owner: self.inner.owner.clone(),
                    name: self.inner.name.clone(),
                });
            }
            state.produced = true;
        }
        state.supplier = Some(value.into());
        Ok(())
    }

    /// Set the value only if nothing was assigned yet.
    pub fn setdefault(&self, value: impl Into<Supplier<T>>) -> Result<(), PropertyError> {
        if self.is_set() {
            return Ok(());
        }
        self.set(value)
    }

    /// Replace the current supplier with `current.map(func)`.
    pub fn set_map<F>(&self, func: F) -> Result<(), PropertyError>
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let current = {
            let state = self.read();
            match (&state.supplier, &state.default) {
                (Some(supplier), _) | (None, Some(supplier)) => supplier.clone(),
                (None, None) => return Ok(()),
            }
        };
        let mut state = self.write();
        if state.finalized {
            return Err(PropertyError::Finalized {
                owner: self.inner.owner.clone(),
                name: self.inner.name.clone(),
            });
        }
        state.supplier = Some(current.map(func));
        Ok(())
    }

    pub fn get(&self) -> Result<T, PropertyError> {
        let (supplier, default) = {
            let state = self.read();
            (state.supplier.clone(), state.default.clone())
        };
        let result = match (supplier, &default) {
            (Some(supplier), _) => supplier.get(),
            (None, Some(default)) => default.get(),
            (None, None) => return Err(self.empty_error()),
        };
        match result {
            Err(PropertyError::Void) => match default {
                Some(default) => default.get().map_err(|err| match err {
                    PropertyError::Void => self.empty_error(),
                    other => other,
                }),
                None => Err(self.empty_error()),
            },
            other => other,
        }
    }

    pub fn get_or(&self, default: T) -> T {
        self.get().unwrap_or(default)
    }

    /// A supplier that reads this property lazily.
    pub fn supplier(&self) -> Supplier<T> {
        Supplier::from_node(Arc::new(PropertyNode(self.clone())))
    }

    pub fn map<U, F>(&self, func: F) -> Supplier<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.supplier().map(func)
    }
}

impl<T> AnyProperty for Property<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn owner(&self) -> &str {
        &self.inner.owner
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn role(&self) -> PropertyRole {
        self.inner.role
    }

    fn is_set(&self) -> bool {
        self.read().supplier.is_some()
    }

    fn is_filled(&self) -> bool {
        let state = self.read();
        let supplier = state.supplier.as_ref().is_some_and(|s| s.is_filled());
        supplier || state.default.as_ref().is_some_and(|s| s.is_filled())
    }

    fn finalize(&self) -> Result<(), PropertyError> {
        if self.inner.role != PropertyRole::Config || self.read().finalized {
            return Ok(());
        }
        let value = match self.get() {
            Ok(value) => Some(value),
            Err(PropertyError::Empty { .. }) => None,
            Err(err) => return Err(err),
        };
        let mut state = self.write();
        if let Some(value) = value {
            state.supplier = Some(Supplier::of(value));
        }
        state.finalized = true;
        Ok(())
    }

    fn lineage(&self) -> Vec<Lineage> {
        let state = self.read();
        let mut out = Vec::new();
        if let Some(supplier) = &state.supplier {
            out.extend(supplier.lineage());
        }
        if let Some(default) = &state.default {
            out.extend(default.lineage());
        }
        out
    }

    fn clear(&self) {
        let mut state = self.write();
        state.supplier = None;
        state.produced = false;
    }
}

struct PropertyNode<T>(Property<T>);

impl<T> Node<T> for PropertyNode<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self) -> Result<T, PropertyError> {
        self.0.get()
    }

    fn is_filled(&self) -> bool {
        AnyProperty::is_filled(&self.0)
    }

    fn lineage(&self, out: &mut Vec<Lineage>) {
        out.push(Lineage {
            task: self.0.inner.owner.clone(),
            property: self.0.inner.name.clone(),
            role: self.0.inner.role,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_property_without_default_is_empty() {
        let prop: Property<String> = Property::new("build", "target");
        match prop.get() {
            Err(PropertyError::Empty { owner, name }) => {
                assert_eq!(owner, "build");
                assert_eq!(name, "target");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(prop.get_or("debug".into()), "debug");
    }

    #[test]
    fn default_is_used_until_set() {
        let prop = Property::new("build", "jobs").with_default(4);
        assert_eq!(prop.get().unwrap(), 4);
        prop.set(8).unwrap();
        assert_eq!(prop.get().unwrap(), 8);
        prop.setdefault(16).unwrap();
        assert_eq!(prop.get().unwrap(), 8);
    }

    #[test]
    fn setting_a_supplier_aliases_the_source() {
        let upstream = Property::new("a", "value").with_default(1);
        let downstream: Property<i32> = Property::new("b", "value");
        downstream.set(upstream.supplier()).unwrap();
        assert_eq!(downstream.get().unwrap(), 1);
        upstream.set(2).unwrap();
        assert_eq!(downstream.get().unwrap(), 2);
    }

    #[test]
    fn output_distinguishes_not_yet_produced() {
        let out: Property<String> = Property::output("package", "chart_tarball");
        assert!(matches!(out.get(), Err(PropertyError::NotYetProduced { .. })));
        out.set("chart.tgz".to_string()).unwrap();
        assert!(matches!(
            out.set("again.tgz".to_string()),
            Err(PropertyError::AlreadyProduced { .. })
        ));
        assert_eq!(out.get().unwrap(), "chart.tgz");
        out.clear();
        assert!(matches!(out.get(), Err(PropertyError::NotYetProduced { .. })));
    }

    #[test]
    fn finalize_freezes_config_properties() {
        let source = Property::new("a", "n").with_default(1);
        let config: Property<i32> = Property::config("b", "n");
        config.set(source.supplier()).unwrap();
        config.finalize().unwrap();
        source.set(5).unwrap();
        assert_eq!(config.get().unwrap(), 1);
        assert!(matches!(config.set(3), Err(PropertyError::Finalized { .. })));
    }

    #[test]
    fn lineage_names_the_upstream_property() {
        let upstream: Property<String> = Property::output("helmPackage", "chart_tarball");
        let downstream: Property<String> = Property::new("helmPush", "chart_tarball");
        downstream.set(upstream.map(|path| path.to_uppercase())).unwrap();
        let lineage = AnyProperty::lineage(&downstream);
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0].task, "helmPackage");
        assert_eq!(lineage[0].role, PropertyRole::Output);
    }

    #[test]
    fn set_map_transforms_current_value() {
        let prop = Property::new("t", "file").with_default("Cargo.toml".to_string());
        prop.set_map(|file| format!("/project/{file}")).unwrap();
        assert_eq!(prop.get().unwrap(), "/project/Cargo.toml");
    }
}
