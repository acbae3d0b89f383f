//! Dapper: a Debug Adapter Protocol server for a dynamic script runtime.
//!
//! The crate splits into the client-facing DAP plumbing ([`dap`]), the
//! backend-agnostic debugger core ([`debugger`]), the two debuggee
//! backends ([`backend`]), the debuggee-side launcher support
//! ([`launcher`]), the session kernel ([`server`]) and the script runtime
//! itself ([`runtime`]).

pub mod backend;
pub mod dap;
pub mod debugger;
pub mod launcher;
pub mod runtime;
pub mod server;
