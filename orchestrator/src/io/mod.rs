//! I/O adapters: subprocess plumbing, version control, generator, CI
//! provider, and the SQLite task store.

pub mod ci;
pub mod generator;
pub mod git;
pub mod process;
pub mod store;
