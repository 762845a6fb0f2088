//! tests/component/mod.rs
//!
//! Component tests drive the `Engine` actor in memory, through the same
//! channels the transport and admin services use.

mod engine;
