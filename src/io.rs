//! The I/O shell behind the `print` and `read` builtins.
//!
//! The interpreter never touches stdin or stdout directly; it goes through
//! the [`Io`] trait so hosts can redirect the builtins. [`StdIo`] is the
//! default implementation.

use silvan_core::HostError;
use std::{
    fmt,
    io::{self, BufRead, Write},
};

/// Host interface of the `print` and `read` builtins.
pub trait Io {
    /// Writes `text` to the host's output.
    ///
    /// A host-specific failure surfaces to the embedder as
    /// [`Error::Host`](crate::Error::Host); running code cannot observe it.
    fn print(&mut self, text: &str) -> Result<(), Box<dyn HostError>>;

    /// Reads one line from the host's input, without the line terminator.
    ///
    /// `Ok(None)` is a read failure in the language's sense (end of input or
    /// an unreadable stream) and makes the builtin throw the generic
    /// exception. `Err` is reserved for host-specific failures that should
    /// abort the call instead.
    fn read_line(&mut self) -> Result<Option<String>, Box<dyn HostError>>;
}

/// [`Io`] implementation over the process's stdin and stdout.
#[derive(Debug, Default)]
pub struct StdIo;

impl Io for StdIo {
    fn print(&mut self, text: &str) -> Result<(), Box<dyn HostError>> {
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        stdout
            .write_all(text.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(|error| Box::new(StdIoError(error)) as Box<dyn HostError>)
    }

    fn read_line(&mut self) -> Result<Option<String>, Box<dyn HostError>> {
        let stdin = io::stdin();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => Ok(None),
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                Ok(Some(line))
            }
        }
    }
}

/// A stdout failure wrapped as a [`HostError`].
#[derive(Debug)]
pub struct StdIoError(io::Error);

impl fmt::Display for StdIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stdio error: {}", self.0)
    }
}

impl HostError for StdIoError {}
