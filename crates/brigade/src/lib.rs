//! # `brigade`: capability-routed job dispatch
//!
//! `brigade` routes jobs to dynamically registered workers. Each worker
//! declares the capability tags it serves; each job names the tag it needs.
//! Among the workers declaring a tag, selection is a strict round-robin: the
//! worker that just served a tag moves to the back of that tag's rotation.
//!
//! ## Components
//!
//! - [`Connection`]: the two-primitive transport contract (`recv`, `send`)
//!   shared by workers and incoming callers. [`ChannelConnection`] is an
//!   in-memory implementation.
//! - [`Registry`]: who is on duty, keyed by [`WorkerId`].
//! - [`CapabilityIndex`]: per-tag rotation queues of worker identifiers.
//! - [`Dispatcher`]: the session object tying the two together and relaying
//!   jobs.
//!
//! ## Example
//!
//! ```
//! use brigade::{Capability, Connection, Dispatcher, channel_pair};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> brigade::Result<()> {
//! let dispatcher = Dispatcher::new();
//!
//! let (worker_end, mut worker) = channel_pair::<String>(1);
//! dispatcher.on_duty("ana", Capability::try_from("grill")?, worker_end)?;
//! tokio::spawn(async move {
//!     while let Ok(order) = worker.recv().await {
//!         let _ = worker.send(format!("grilled {order}")).await;
//!     }
//! });
//!
//! let (mut caller, mut incoming) = channel_pair::<String>(1);
//! caller.send("halloumi".to_string()).await?;
//! dispatcher.handle_job("grill", &mut incoming).await?;
//! assert_eq!(caller.recv().await?, "grilled halloumi");
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `tracing`: emit [`tracing`](https://docs.rs/tracing) events for
//!   registration, selection and session teardown.

mod capability;
mod connection;
mod dispatcher;
mod error;
mod id;
mod index;
mod registry;

pub use crate::capability::*;
pub use crate::connection::*;
pub use crate::dispatcher::*;
pub use crate::error::*;
pub use crate::id::*;
pub use crate::index::*;
pub use crate::registry::*;
