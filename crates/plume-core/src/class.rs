//! Error classes and the classified failures produced by handlers.
//!
//! Rust errors carry no class hierarchy, so each failure type names an
//! [`ErrorClass`]: a static node with zero or more parent classes. Status
//! mappings are keyed by class and matched by distance through this graph.

use crate::error::{CallError, CodecError};
use crate::status::Status;
use std::error::Error as StdError;
use std::fmt;

/// A node in the error-class graph.
///
/// Classes are compared by identity, so declare them as `static` items
/// (see [`error_class!`](crate::error_class)).
pub struct ErrorClass {
    pub name: &'static str,
    pub parents: &'static [&'static ErrorClass],
}

impl ErrorClass {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parents(&self) -> &'static [&'static ErrorClass] {
        self.parents
    }

    /// Identity comparison
    pub fn is(&self, other: &ErrorClass) -> bool {
        std::ptr::eq(self, other)
    }

    /// Number of parent edges between `self` and `ancestor`, searched breadth-first.
    ///
    /// Returns `Some(0)` for the class itself and `None` if `ancestor` is not
    /// reachable.
    pub fn distance_to(&self, ancestor: &ErrorClass) -> Option<usize> {
        let mut visited: Vec<*const ErrorClass> = vec![self as *const _];
        let mut frontier: Vec<&ErrorClass> = vec![self];
        let mut depth = 0;

        while !frontier.is_empty() {
            if frontier.iter().any(|class| class.is(ancestor)) {
                return Some(depth);
            }
            let mut next = Vec::new();
            for class in frontier {
                for parent in class.parents {
                    let ptr = *parent as *const ErrorClass;
                    if !visited.contains(&ptr) {
                        visited.push(ptr);
                        next.push(*parent);
                    }
                }
            }
            frontier = next;
            depth += 1;
        }
        None
    }

    /// Whether `self` is `ancestor` or descends from it
    pub fn is_a(&self, ancestor: &ErrorClass) -> bool {
        self.distance_to(ancestor).is_some()
    }
}

impl fmt::Debug for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorClass").field(&self.name).finish()
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Declare a static [`ErrorClass`].
///
/// ```
/// plume_core::error_class!(pub static STORAGE = "StorageError");
/// plume_core::error_class!(pub static QUOTA = "QuotaError": STORAGE);
/// assert_eq!(QUOTA.distance_to(&STORAGE), Some(1));
/// ```
#[macro_export]
macro_rules! error_class {
    ($vis:vis static $ident:ident = $name:literal $(: $($parent:path),+)?) => {
        $vis static $ident: $crate::class::ErrorClass = $crate::class::ErrorClass {
            name: $name,
            parents: &[$($(&$parent),+)?],
        };
    };
}

error_class!(pub static ERROR = "Error");
error_class!(pub static STATUS = "Status": ERROR);
error_class!(pub static IO = "IoError": ERROR);
error_class!(pub static TIMEOUT = "Elapsed": ERROR);
error_class!(pub static CALL = "CallError": ERROR);
error_class!(pub static CODEC = "CodecError": ERROR);

/// An error that knows its class.
pub trait Classified: StdError + Send + Sync + 'static {
    fn error_class(&self) -> &'static ErrorClass;
}

impl Classified for Status {
    fn error_class(&self) -> &'static ErrorClass {
        &STATUS
    }
}

impl Classified for std::io::Error {
    fn error_class(&self) -> &'static ErrorClass {
        &IO
    }
}

impl Classified for tokio::time::error::Elapsed {
    fn error_class(&self) -> &'static ErrorClass {
        &TIMEOUT
    }
}

impl Classified for CallError {
    fn error_class(&self) -> &'static ErrorClass {
        &CALL
    }
}

impl Classified for CodecError {
    fn error_class(&self) -> &'static ErrorClass {
        &CODEC
    }
}

/// A failure escaping handler code, tagged with its class.
///
/// Any [`Classified`] error converts into a `ServiceError` with `?`; other
/// errors go through [`ServiceError::new`] or [`ServiceError::unclassified`].
pub struct ServiceError {
    class: &'static ErrorClass,
    inner: Box<dyn StdError + Send + Sync>,
}

impl ServiceError {
    pub fn new<E>(class: &'static ErrorClass, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self {
            class,
            inner: error.into(),
        }
    }

    /// Wrap an error that has no class of its own; it is classed as [`ERROR`]
    pub fn unclassified<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::new(&ERROR, error)
    }

    pub fn class(&self) -> &'static ErrorClass {
        self.class
    }

    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }
}

impl<E: Classified> From<E> for ServiceError {
    fn from(error: E) -> Self {
        Self {
            class: error.error_class(),
            inner: Box::new(error),
        }
    }
}

impl fmt::Debug for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceError")
            .field("class", &self.class.name)
            .field("error", &self.inner)
            .finish()
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for ServiceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    error_class!(static A1 = "A1Error");
    error_class!(static A2 = "A2Error": A1);
    error_class!(static A3 = "A3Error": A2);
    error_class!(static RETRYABLE = "Retryable");
    error_class!(static B1 = "B1Error": RETRYABLE, A1);

    #[test]
    fn test_distance_walks_parents() {
        assert_eq!(A3.distance_to(&A3), Some(0));
        assert_eq!(A3.distance_to(&A2), Some(1));
        assert_eq!(A3.distance_to(&A1), Some(2));
        assert_eq!(A1.distance_to(&A2), None);
    }

    #[test]
    fn test_distance_with_multiple_parents() {
        assert_eq!(B1.distance_to(&RETRYABLE), Some(1));
        assert_eq!(B1.distance_to(&A1), Some(1));
        assert!(!B1.is_a(&A2));
    }

    #[test]
    fn test_service_error_from_classified() {
        let err: ServiceError = Status::not_found("no such user").into();
        assert!(err.class().is(&STATUS));
        assert!(err.downcast_ref::<Status>().is_some());
        assert_eq!(err.to_string(), "NOT_FOUND: no such user");
    }

    #[test]
    fn test_unclassified_error() {
        let err = ServiceError::unclassified("boom");
        assert!(err.class().is(&ERROR));
        assert_eq!(err.to_string(), "boom");
    }
}
