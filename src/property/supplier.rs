use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use super::{Lineage, PropertyError};

/// A node in the lazily evaluated value graph.
pub(crate) trait Node<T>: Send + Sync {
    fn get(&self) -> Result<T, PropertyError>;
    fn is_filled(&self) -> bool;
    fn lineage(&self, out: &mut Vec<Lineage>);
}

/// Type-erased view on a [`Supplier`], used to declare what a callable depends on.
pub trait Dependency: Send + Sync {
    fn is_filled(&self) -> bool;
    fn lineage(&self, out: &mut Vec<Lineage>);
}

/// A deferred value. Suppliers are cheap to clone; clones share the same node, so a supplier that
/// wraps a property sees every later assignment to that property.
pub struct Supplier<T> {
    node: Arc<dyn Node<T>>,
}

impl<T> Clone for Supplier<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<T> fmt::Debug for Supplier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Supplier(filled: {})", self.node.is_filled())
    }
}

impl<T> Supplier<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_node(node: Arc<dyn Node<T>>) -> Self {
        Self { node }
    }

    /// A supplier that always returns `value`.
    pub fn of(value: T) -> Self {
        Self::from_node(Arc::new(Constant(value)))
    }

    /// A supplier without a value.
    pub fn void() -> Self {
        Self::from_node(Arc::new(Void))
    }

    /// A supplier that calls `func` on every evaluation. It counts as filled when `func` succeeds
    /// and every supplier in `dependencies` is filled. The dependencies also make up its lineage,
    /// so leaving them out hides the callable's inputs from dependency inference.
    pub fn of_callable<F>(func: F, dependencies: Vec<Arc<dyn Dependency>>) -> Self
    where
        F: Fn() -> Result<T, PropertyError> + Send + Sync + 'static,
    {
        Self::from_node(Arc::new(Callable {
            func: Box::new(func),
            dependencies,
        }))
    }

    /// Derive a new supplier. The parent is evaluated first; its errors pass through unchanged.
    pub fn map<U, F>(&self, func: F) -> Supplier<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Supplier::from_node(Arc::new(Mapped {
            parent: self.clone(),
            func: Box::new(func),
        }))
    }

    /// Memoize the first successful evaluation.
    pub fn once(&self) -> Self {
        Self::from_node(Arc::new(Once {
            inner: self.clone(),
            cell: OnceLock::new(),
        }))
    }

    pub fn get(&self) -> Result<T, PropertyError> {
        self.node.get()
    }

    pub fn get_or(&self, default: T) -> T {
        self.node.get().unwrap_or(default)
    }

    pub fn is_filled(&self) -> bool {
        self.node.is_filled()
    }

    /// The properties this supplier reads from.
    pub fn lineage(&self) -> Vec<Lineage> {
        let mut out = Vec::new();
        self.node.lineage(&mut out);
        out
    }

    pub fn as_dependency(&self) -> Arc<dyn Dependency> {
        Arc::new(self.clone())
    }
}

impl<T> Dependency for Supplier<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn is_filled(&self) -> bool {
        self.node.is_filled()
    }

    fn lineage(&self, out: &mut Vec<Lineage>) {
        self.node.lineage(out);
    }
}

impl<T> From<T> for Supplier<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Supplier::of(value)
    }
}

struct Constant<T>(T);

impl<T: Clone + Send + Sync> Node<T> for Constant<T> {
    fn get(&self) -> Result<T, PropertyError> {
        Ok(self.0.clone())
    }

    fn is_filled(&self) -> bool {
        true
    }

    fn lineage(&self, _: &mut Vec<Lineage>) {}
}

struct Void;

impl<T> Node<T> for Void {
    fn get(&self) -> Result<T, PropertyError> {
        Err(PropertyError::Void)
    }

    fn is_filled(&self) -> bool {
        false
    }

    fn lineage(&self, _: &mut Vec<Lineage>) {}
}

type CallableFn<T> = Box<dyn Fn() -> Result<T, PropertyError> + Send + Sync>;

struct Callable<T> {
    func: CallableFn<T>,
    dependencies: Vec<Arc<dyn Dependency>>,
}

impl<T> Node<T> for Callable<T> {
    fn get(&self) -> Result<T, PropertyError> {
        (self.func)()
    }

    fn is_filled(&self) -> bool {
        self.dependencies.iter().all(|dep| dep.is_filled()) && (self.func)().is_ok()
    }

    fn lineage(&self, out: &mut Vec<Lineage>) {
        for dep in &self.dependencies {
            dep.lineage(out);
        }
    }
}

type MapFn<U, T> = Box<dyn Fn(U) -> T + Send + Sync>;

struct Mapped<U, T> {
    parent: Supplier<U>,
    func: MapFn<U, T>,
}

impl<U, T> Node<T> for Mapped<U, T>
where
    U: Clone + Send + Sync + 'static,
    T: Send + Sync,
{
    fn get(&self) -> Result<T, PropertyError> {
        self.parent.get().map(&self.func)
    }

    fn is_filled(&self) -> bool {
        self.parent.is_filled()
    }

    fn lineage(&self, out: &mut Vec<Lineage>) {
        self.parent.node.lineage(out);
    }
}

struct Once<T> {
    inner: Supplier<T>,
    cell: OnceLock<T>,
}

impl<T> Node<T> for Once<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn get(&self) -> Result<T, PropertyError> {
        if let Some(value) = self.cell.get() {
            return Ok(value.clone());
        }
        let value = self.inner.get()?;
        Ok(self.cell.get_or_init(|| value).clone())
    }

    fn is_filled(&self) -> bool {
        self.cell.get().is_some() || self.inner.is_filled()
    }

    fn lineage(&self, out: &mut Vec<Lineage>) {
        self.inner.node.lineage(out);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn constant_is_stable() {
        let supplier = Supplier::of(42);
        assert_eq!(supplier.get().unwrap(), 42);
        assert_eq!(supplier.get().unwrap(), 42);
        assert!(supplier.is_filled());
    }

    #[test]
    fn void_fails_but_get_or_does_not() {
        let supplier: Supplier<i32> = Supplier::void();
        assert!(matches!(supplier.get(), Err(PropertyError::Void)));
        assert_eq!(supplier.get_or(7), 7);
        assert!(!supplier.is_filled());
    }

    #[test]
    fn map_propagates_parent_errors() {
        let failing: Supplier<i32> =
            Supplier::of_callable(|| Err(PropertyError::Supplier("boom".into())), vec![]);
        let mapped = failing.map(|v| v * 2);
        match mapped.get() {
            Err(PropertyError::Supplier(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(Supplier::of(3).map(|v| v * 2).get().unwrap(), 6);
    }

    #[test]
    fn callable_is_filled_requires_dependencies() {
        let missing: Supplier<i32> = Supplier::void();
        let callable = Supplier::of_callable(|| Ok(1), vec![missing.as_dependency()]);
        assert!(!callable.is_filled());
        assert_eq!(callable.get().unwrap(), 1);

        let present = Supplier::of(1);
        let callable = Supplier::of_callable(|| Ok(1), vec![present.as_dependency()]);
        assert!(callable.is_filled());
    }

    #[test]
    fn once_memoizes_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let supplier = Supplier::of_callable(
            move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
            vec![],
        )
        .once();
        assert_eq!(supplier.get().unwrap(), 0);
        assert_eq!(supplier.get().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
