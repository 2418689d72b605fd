//! Event-sourced Linux traffic control.
//!
//! This crate models hierarchical bandwidth shaping (HTB/TBF/PRIO/
//! FQ_CODEL qdiscs, HTB classes, u32 classifiers) as a validated domain
//! aggregate whose history lives in an append-only event log, and
//! projects that state onto the kernel as bit-exact rtnetlink messages.
//!
//! # Layers
//!
//! - [`util`]: value types — [`Handle`](util::Handle),
//!   [`Bandwidth`](util::Bandwidth), [`DeviceName`](util::DeviceName).
//! - [`model`]: the typed entity model (qdisc sum type, HTB class,
//!   filter + match list).
//! - [`aggregate`]: the rule-validated mutation core with replay.
//! - [`event`]: events, the [`EventStore`](event::EventStore) trait,
//!   an in-memory store, and (behind the `sqlite` feature) a SQLite
//!   store with optimistic concurrency.
//! - [`command`]: string-typed commands and their handlers.
//! - [`shaping`]: the fluent declarative front-end.
//! - [`plan`]: serde types for externally-loaded configurations.
//! - [`netlink`]: wire structs, marshalling, and the
//!   [`TcBackend`](netlink::TcBackend) seam with Linux and in-memory
//!   implementations.
//!
//! # Example
//!
//! ```ignore
//! use tcshape::event::MemoryEventStore;
//! use tcshape::netlink::LinuxBackend;
//! use tcshape::shaping::NetworkInterface;
//! use tcshape::util::CancelToken;
//!
//! #[tokio::main]
//! async fn main() -> tcshape::Result<()> {
//!     let store = MemoryEventStore::new();
//!     let backend = LinuxBackend::new();
//!
//!     NetworkInterface::new("eth0")?
//!         .with_hard_limit_bandwidth("1gbps")?
//!         .create_traffic_class("interactive")
//!         .with_guaranteed_bandwidth("200mbps")?
//!         .with_priority(0)
//!         .for_port(22)
//!         .done()
//!         .create_traffic_class("bulk")
//!         .with_guaranteed_bandwidth("100mbps")?
//!         .with_priority(7)
//!         .done()
//!         .apply_to_backend(&store, &backend, &CancelToken::new())
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod command;
pub mod error;
pub mod event;
pub mod model;
pub mod netlink;
pub mod plan;
pub mod shaping;
pub mod util;

pub use aggregate::TrafficControlAggregate;
pub use error::{Error, Result};
pub use event::{Event, EventPayload, EventStore, MemoryEventStore};
#[cfg(feature = "sqlite")]
pub use event::SqliteEventStore;
pub use model::{Filter, HtbClass, Match, Qdisc, QdiscKind};
pub use shaping::NetworkInterface;
pub use util::{Bandwidth, CancelToken, DeviceName, Handle};
