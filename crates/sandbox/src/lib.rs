//! Sandbox runtimes.
//!
//! The only shipped runtime is [`LocalShell`], a persistent bash session on
//! the local machine. Anything implementing the core `Sandbox` trait (remote
//! containers, VMs) can be swapped in without touching the agent loop.

pub mod local;

pub use local::LocalShell;
