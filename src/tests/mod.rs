mod builtin;
mod exec;

use super::Error;
use crate::{function::FunctionBuilder, package::PackageBuilder, Interpreter, PackageRef};

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}
fn assert_std_err_impl<T: std::error::Error>() {}

#[test]
fn assert_error_properties() {
    assert_send::<Error>();
    assert_sync::<Error>();
    assert_std_err_impl::<Error>();
}

/// Instantiates a package with one function assembled by `assemble` and
/// returns the interpreter together with the package.
pub(crate) fn single_function(
    assemble: impl FnOnce(&mut FunctionBuilder),
) -> (Interpreter, PackageRef, i64) {
    let mut function = FunctionBuilder::new();
    assemble(&mut function);
    let mut package = PackageBuilder::new();
    let index = package.add_function(function.finish());
    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).expect("valid package");
    (interp, package, index)
}

/// Runs one function with no arguments and returns the raw result word.
pub(crate) fn run(assemble: impl FnOnce(&mut FunctionBuilder)) -> Result<i64, Error> {
    let (mut interp, package, index) = single_function(assemble);
    interp.call(&package.function(index))
}
