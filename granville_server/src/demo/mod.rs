//! A minimal grain host used by seed tests and `--demo` binary mode; not
//! part of the runtime proper.

mod echo_grain;

pub use echo_grain::{EchoGrain, ECHO_INTERFACE_ID};
