//! Shared ambient stack for the VPN data-plane toolkit: logging init and
//! configuration types used by `vpn-fairqueue` and `vpn-secproto`.
//!
//! Neither core crate depends on this for its algorithms — only for the
//! plumbing a host application wires up around them.

pub mod config;
pub mod logging;
