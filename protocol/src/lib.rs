//! Wire protocol between Oppi's server and its remote clients.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod protocol;

pub use protocol::*;
