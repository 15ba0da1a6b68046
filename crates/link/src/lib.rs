//! Rank-addressed, full-mesh communication between the parties of a
//! protocol run.
//!
//! A [`ContextFactory`] turns a [`TopologyDescriptor`](corelib::TopologyDescriptor)
//! and the local rank into a [`Context`]: one [`Channel`] per peer, plus a
//! [`ReceiverLoop`] that dispatches inbound envelopes to those channels.
//!
//! ```no_run
//! # async fn run() -> corelib::Result<()> {
//! use corelib::TopologyDescriptor;
//! use link::ContextFactory;
//!
//! let desc = TopologyDescriptor::new(["127.0.0.1:9530", "127.0.0.1:9531"]);
//! let ctx = ContextFactory::new().create_context(&desc, 0).await?;
//! ctx.connect_to_mesh().await?;
//! ctx.send(1, "greeting", &b"hello"[..]).await?;
//! let reply = ctx.recv(1, "greeting").await?;
//! # let _ = reply;
//! ctx.close().await;
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod channel;
pub mod context;
pub mod factory;
pub mod receiver;
pub mod stats;
pub mod throttle;

pub use channel::{Channel, ChannelOptions, CloseStatus};
pub use context::Context;
pub use factory::ContextFactory;
pub use receiver::ReceiverLoop;
pub use stats::{ReceiverSnapshot, StatsSnapshot};
pub use throttle::Throttle;
