//! Projecting aggregate state onto a backend.
//!
//! The projection walks the aggregate's entities in dependency order
//! (qdiscs root-first, classes parents-first, filters in creation
//! order) and issues one backend operation per entity. Cancellation is
//! observed between operations; an individual netlink write is never
//! interrupted mid-message.

use tracing::info;

use super::backend::TcBackend;
use crate::aggregate::TrafficControlAggregate;
use crate::error::Result;
use crate::model::{HtbClass, Qdisc};
use crate::util::CancelToken;

/// Applies aggregate state to a [`TcBackend`].
pub struct Projection<'a, B> {
    backend: &'a B,
}

impl<'a, B: TcBackend> Projection<'a, B> {
    /// Bind a projection to a backend.
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Create every entity the aggregate holds, in dependency order.
    pub async fn sync(
        &self,
        aggregate: &TrafficControlAggregate,
        cancel: &CancelToken,
    ) -> Result<()> {
        for qdisc in ordered_qdiscs(aggregate) {
            cancel.checkpoint()?;
            self.backend.add_qdisc(qdisc).await?;
        }
        for class in ordered_classes(aggregate) {
            cancel.checkpoint()?;
            self.backend.add_class(class).await?;
        }
        for filter in aggregate.filters() {
            cancel.checkpoint()?;
            self.backend.add_filter(filter, None).await?;
        }
        info!(
            device = %aggregate.device(),
            qdiscs = aggregate.qdiscs().len(),
            classes = aggregate.classes().len(),
            filters = aggregate.filters().len(),
            "aggregate projected"
        );
        Ok(())
    }
}

/// Root qdiscs first, then children, stable by handle within a tier.
fn ordered_qdiscs(aggregate: &TrafficControlAggregate) -> Vec<&Qdisc> {
    let mut qdiscs: Vec<&Qdisc> = aggregate.qdiscs().values().collect();
    qdiscs.sort_by_key(|q| (q.parent().is_some(), q.handle()));
    qdiscs
}

/// Classes sorted so parents precede children: depth is the length of
/// the parent chain within the class map.
fn ordered_classes(aggregate: &TrafficControlAggregate) -> Vec<&HtbClass> {
    let classes = aggregate.classes();
    let depth = |class: &HtbClass| {
        let mut depth = 0usize;
        let mut parent = class.parent;
        while let Some(next) = classes.get(&parent) {
            depth += 1;
            parent = next.parent;
            if depth > classes.len() {
                break; // cycle guard; the aggregate never creates one
            }
        }
        depth
    };
    let mut ordered: Vec<&HtbClass> = classes.values().collect();
    ordered.sort_by_key(|c| (depth(c), c.handle));
    ordered
}
