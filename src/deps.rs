//! Dependency arrangements
//!
//! `Dependency` is implemented by the four leaf references (a main executor
//! or one of its lazy/reactive/static siblings); `Deps` lifts those into the
//! arrangements a factory can declare: nothing, a single reference, a tuple,
//! a homogeneous `Vec`, or a `Named` map. The factory receives the resolved
//! values in the declared arrangement.

use std::collections::HashMap;
use std::sync::Arc;

use crate::accessor::Accessor;
use crate::error::{ErrorContext, Stage, WeftError};
use crate::executor::{
    DepKind, DepPayload, DepRef, DepSpec, Executor, LazyRef, ReactiveRef, ResolvedDep,
    ResolvedDeps, StaticRef,
};

/// A single dependency reference usable inside an arrangement
pub trait Dependency: Clone + Send + Sync + 'static {
    /// What the factory receives for this reference
    type Output: Send + 'static;

    #[doc(hidden)]
    fn dep_ref(&self) -> DepRef;

    #[doc(hidden)]
    fn extract(dep: ResolvedDep) -> Result<Self::Output, WeftError>;
}

/// A complete dependency arrangement for a factory
pub trait Deps: Send + Sync + 'static {
    /// The resolved shape handed to the factory
    type Output: Send + 'static;

    #[doc(hidden)]
    fn spec(&self) -> DepSpec;

    #[doc(hidden)]
    fn extract(resolved: ResolvedDeps) -> Result<Self::Output, WeftError>;
}

fn shape_error(name: &Arc<str>, message: &str) -> WeftError {
    WeftError::FactoryExecution {
        context: ErrorContext::new(Arc::clone(name), Vec::new(), Stage::DependencyResolution),
        message: message.into(),
        source: None,
    }
}

fn arrangement_error(expected: &str) -> WeftError {
    WeftError::FactoryExecution {
        context: ErrorContext::new(
            Arc::from("dependencies"),
            Vec::new(),
            Stage::DependencyResolution,
        ),
        message: format!("resolved dependencies did not match the declared {expected} arrangement"),
        source: None,
    }
}

fn value_of<T>(dep: ResolvedDep) -> Result<T, WeftError>
where
    T: Clone + Send + Sync + 'static,
{
    let ResolvedDep { name, payload } = dep;
    match payload {
        DepPayload::Value(any) => match any.downcast::<T>() {
            Ok(v) => Ok((*v).clone()),
            Err(_) => Err(shape_error(&name, "dependency value has an unexpected type")),
        },
        DepPayload::Accessor(_) => Err(shape_error(&name, "expected a resolved value")),
    }
}

fn accessor_of<T>(dep: ResolvedDep) -> Result<Accessor<T>, WeftError>
where
    T: Clone + Send + Sync + 'static,
{
    let ResolvedDep { name, payload } = dep;
    match payload {
        DepPayload::Accessor(erased) => Ok(Accessor::from_erased(erased)),
        DepPayload::Value(_) => Err(shape_error(&name, "expected an accessor")),
    }
}

impl<T> Dependency for Executor<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn dep_ref(&self) -> DepRef {
        DepRef {
            kind: DepKind::Plain,
            target: Arc::clone(&self.core),
        }
    }

    fn extract(dep: ResolvedDep) -> Result<T, WeftError> {
        value_of(dep)
    }
}

impl<T> Dependency for ReactiveRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn dep_ref(&self) -> DepRef {
        DepRef {
            kind: DepKind::Reactive,
            target: Arc::clone(&self.0.core),
        }
    }

    fn extract(dep: ResolvedDep) -> Result<T, WeftError> {
        value_of(dep)
    }
}

impl<T> Dependency for LazyRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Accessor<T>;

    fn dep_ref(&self) -> DepRef {
        DepRef {
            kind: DepKind::Lazy,
            target: Arc::clone(&self.0.core),
        }
    }

    fn extract(dep: ResolvedDep) -> Result<Accessor<T>, WeftError> {
        accessor_of(dep)
    }
}

impl<T> Dependency for StaticRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Accessor<T>;

    fn dep_ref(&self) -> DepRef {
        DepRef {
            kind: DepKind::Static,
            target: Arc::clone(&self.0.core),
        }
    }

    fn extract(dep: ResolvedDep) -> Result<Accessor<T>, WeftError> {
        accessor_of(dep)
    }
}

impl Deps for () {
    type Output = ();

    fn spec(&self) -> DepSpec {
        DepSpec::None
    }

    fn extract(_resolved: ResolvedDeps) -> Result<(), WeftError> {
        Ok(())
    }
}

macro_rules! impl_deps_single {
    ($ty:ident) => {
        impl<T> Deps for $ty<T>
        where
            T: Clone + Send + Sync + 'static,
        {
            type Output = <$ty<T> as Dependency>::Output;

            fn spec(&self) -> DepSpec {
                DepSpec::Single(self.dep_ref())
            }

            fn extract(resolved: ResolvedDeps) -> Result<Self::Output, WeftError> {
                let ResolvedDeps::Single(dep) = resolved else {
                    return Err(arrangement_error("single"));
                };
                <$ty<T> as Dependency>::extract(dep)
            }
        }
    };
}

impl_deps_single!(Executor);
impl_deps_single!(LazyRef);
impl_deps_single!(ReactiveRef);
impl_deps_single!(StaticRef);

macro_rules! impl_deps_tuple {
    ($(($D:ident, $idx:tt)),+) => {
        impl<$($D: Dependency),+> Deps for ($($D,)+) {
            type Output = ($($D::Output,)+);

            fn spec(&self) -> DepSpec {
                DepSpec::List(vec![$(self.$idx.dep_ref()),+])
            }

            fn extract(resolved: ResolvedDeps) -> Result<Self::Output, WeftError> {
                let ResolvedDeps::List(items) = resolved else {
                    return Err(arrangement_error("sequence"));
                };
                let mut items = items.into_iter();
                Ok(($(
                    match items.next() {
                        Some(item) => $D::extract(item)?,
                        None => return Err(arrangement_error("sequence")),
                    },
                )+))
            }
        }
    };
}

impl_deps_tuple!((D0, 0));
impl_deps_tuple!((D0, 0), (D1, 1));
impl_deps_tuple!((D0, 0), (D1, 1), (D2, 2));
impl_deps_tuple!((D0, 0), (D1, 1), (D2, 2), (D3, 3));
impl_deps_tuple!((D0, 0), (D1, 1), (D2, 2), (D3, 3), (D4, 4));
impl_deps_tuple!((D0, 0), (D1, 1), (D2, 2), (D3, 3), (D4, 4), (D5, 5));
impl_deps_tuple!((D0, 0), (D1, 1), (D2, 2), (D3, 3), (D4, 4), (D5, 5), (D6, 6));
impl_deps_tuple!(
    (D0, 0),
    (D1, 1),
    (D2, 2),
    (D3, 3),
    (D4, 4),
    (D5, 5),
    (D6, 6),
    (D7, 7)
);

impl<D: Dependency> Deps for Vec<D> {
    type Output = Vec<D::Output>;

    fn spec(&self) -> DepSpec {
        DepSpec::List(self.iter().map(|d| d.dep_ref()).collect())
    }

    fn extract(resolved: ResolvedDeps) -> Result<Self::Output, WeftError> {
        let ResolvedDeps::List(items) = resolved else {
            return Err(arrangement_error("sequence"));
        };
        items.into_iter().map(D::extract).collect()
    }
}

/// A name → reference arrangement; the factory receives a map of resolved
/// values under the same names
#[derive(Clone)]
pub struct Named<D>(Vec<(Arc<str>, D)>);

/// Build a named dependency arrangement
pub fn named<D, N, I>(pairs: I) -> Named<D>
where
    D: Dependency,
    N: Into<Arc<str>>,
    I: IntoIterator<Item = (N, D)>,
{
    Named(pairs.into_iter().map(|(n, d)| (n.into(), d)).collect())
}

impl<D: Dependency> Deps for Named<D> {
    type Output = HashMap<String, D::Output>;

    fn spec(&self) -> DepSpec {
        DepSpec::Map(
            self.0
                .iter()
                .map(|(n, d)| (Arc::clone(n), d.dep_ref()))
                .collect(),
        )
    }

    fn extract(resolved: ResolvedDeps) -> Result<Self::Output, WeftError> {
        let ResolvedDeps::Map(pairs) = resolved else {
            return Err(arrangement_error("named"));
        };
        pairs
            .into_iter()
            .map(|(n, dep)| Ok((n.to_string(), D::extract(dep)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::provide;

    fn exec(v: i32) -> Executor<i32> {
        provide(move |_| async move { Ok(v) })
    }

    #[test]
    fn single_spec_shapes() {
        let e = exec(1);
        assert!(matches!(Deps::spec(&e), DepSpec::Single(_)));
        assert!(matches!(Deps::spec(&e.lazy()), DepSpec::Single(_)));
        assert!(matches!(Deps::spec(&()), DepSpec::None));
    }

    #[test]
    fn tuple_spec_preserves_order_and_kind() {
        let a = exec(1);
        let b = exec(2);
        let deps = (a.clone(), b.reactive());
        let DepSpec::List(refs) = Deps::spec(&deps) else {
            panic!("expected list spec");
        };
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].kind, DepKind::Plain);
        assert_eq!(refs[0].target.id, a.id());
        assert_eq!(refs[1].kind, DepKind::Reactive);
        assert_eq!(refs[1].target.id, b.id());
    }

    #[test]
    fn vec_spec() {
        let deps = vec![exec(1).lazy(), exec(2).lazy()];
        let DepSpec::List(refs) = Deps::spec(&deps) else {
            panic!("expected list spec");
        };
        assert!(refs.iter().all(|r| r.kind == DepKind::Lazy));
    }

    #[test]
    fn named_spec_keeps_names() {
        let deps = named([("left", exec(1)), ("right", exec(2))]);
        let DepSpec::Map(pairs) = Deps::spec(&deps) else {
            panic!("expected map spec");
        };
        assert_eq!(pairs[0].0.as_ref(), "left");
        assert_eq!(pairs[1].0.as_ref(), "right");
    }

    #[test]
    fn value_extraction_downcasts() {
        let dep = ResolvedDep {
            name: Arc::from("n"),
            payload: DepPayload::Value(Arc::new(41i32)),
        };
        assert_eq!(value_of::<i32>(dep).unwrap(), 41);
    }

    #[test]
    fn value_extraction_rejects_wrong_type() {
        let dep = ResolvedDep {
            name: Arc::from("n"),
            payload: DepPayload::Value(Arc::new("text".to_string())),
        };
        assert!(value_of::<i32>(dep).is_err());
    }
}
