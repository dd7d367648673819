//! # `brigade-server`
//!
//! A TCP front end for the [`brigade`] dispatcher. Every connection speaks
//! newline-delimited JSON and opens with a single envelope line naming what
//! it is: a worker going on duty, a request to take a worker off duty, or a
//! job for a capability tag.
//!
//! See [`server::envelope`] for the wire format and [`server::serve`] for the
//! accept loop.

pub mod server;
