//! In-memory typed model of the traffic control hierarchy.
//!
//! Entities are plain data validated at construction; the hierarchy
//! invariants that span entities (unique handles, resolvable parents,
//! resolvable flow targets) live in the aggregate.

pub mod class;
pub mod filter;
pub mod qdisc;

pub use class::HtbClass;
pub use filter::{Cidr, Filter, FilterProtocol, Match, TransportProtocol};
pub use qdisc::{FqCodelParams, HtbParams, PrioParams, Qdisc, QdiscKind, TbfParams};
