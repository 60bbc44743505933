use core::fmt::{Debug, Display};
use downcast_rs::{impl_downcast, DowncastSync};

/// Trait that allows the host to return custom errors from the I/O shell.
///
/// Implementations of the `Io` trait can fail in ways the interpreter cannot
/// classify (a closed pipe, a poisoned buffer). Such failures travel through
/// the interpreter boxed as `HostError` and can be downcast back to the
/// concrete type at the call site.
///
/// # Examples
///
/// ```rust
/// use std::fmt;
/// use silvan_core::HostError;
///
/// #[derive(Debug)]
/// struct MyError {
///     code: u32,
/// }
///
/// impl fmt::Display for MyError {
///     fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
///         write!(f, "MyError, code={}", self.code)
///     }
/// }
///
/// impl HostError for MyError {}
///
/// let boxed: Box<dyn HostError> = Box::new(MyError { code: 1312 });
/// assert_eq!(boxed.downcast_ref::<MyError>().unwrap().code, 1312);
/// ```
pub trait HostError: 'static + Display + Debug + DowncastSync {}
impl_downcast!(HostError);
