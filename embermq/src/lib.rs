#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use embermq::{AckLevel, Broker, Deadline, Result};
//! use embermq::conf::Settings;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Broker::open(Settings::default())?;
//!     let topic = "orders".into();
//!
//!     let offset = broker
//!         .publish(&topic, None, "hello".into(), AckLevel::Local, &Deadline::none())
//!         .await?;
//!     println!("stored at {:?}", offset);
//!
//!     let mut sub = broker.subscribe(&topic, &"billing".into(), "", &Deadline::none()).await?;
//!     for d in sub.fetch(100, &Deadline::none()).await? {
//!         println!("{} {:?}", d.offset, d.payload);
//!         sub.commit(d.offset).await?;
//!     }
//!
//!     broker.shutdown().await
//! }
//!
//! ```

/// Storage
pub mod codec; // Record framing shared by segments and the offsets log
pub mod retention; // Segment retention policies
pub mod segment; // Append-only segment files with a sparse index
pub mod topic; // Topic log, a chain of segments

/// Consumption
pub mod assign; // Member selection strategies
pub mod group; // Consumer group coordinator
pub mod inflight; // Unacknowledged messages of a member
pub mod offset; // Committed offsets
pub mod subscribe; // Consumer handle

/// Broker
pub mod broker; // Topic registry and the publish/subscribe/commit surface
pub mod context; // Shared execution context
pub mod extend; // Extension points
pub mod flow; // Ingress buffering, batching and backpressure
pub mod replication; // Replica acknowledgement
pub mod stats; // Runtime statistics

/// Common
pub mod error; // Typed errors
pub mod logger; // slog backend for the log facade
pub mod types; // Common data types

pub use embermq_conf as conf;
pub use embermq_utils as utils;

pub use broker::Broker;
pub use context::BrokerContext;
pub use error::{BrokerError, ErrorKind, Result};
pub use subscribe::Subscription;
pub use types::{AckLevel, Deadline, Delivery, Message, Offset, Record, TopicConfig};
