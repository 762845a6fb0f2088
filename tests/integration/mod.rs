//! tests/integration/mod.rs
//!
//! End-to-end scenarios over real sockets on loopback.

mod consensus;
