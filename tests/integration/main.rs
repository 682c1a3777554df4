//! End-to-end tests driving the `ralph` binary.

mod cli;
mod daemon;
