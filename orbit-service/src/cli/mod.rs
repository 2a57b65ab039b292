//! Command-line interface of the `orbit-service` binary

mod args;

pub use args::Args;
