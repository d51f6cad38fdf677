//! Additive merge of a run's local tag counts into per-window counters.

use std::collections::BTreeMap;

use hashflow_core::{WindowCounter, WindowKey};
use tracing::debug;

use crate::{CounterStore, MergeOutcome, Result};

/// What one merge wrote: the resulting counters plus created/incremented tallies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeSummary {
    pub counters: Vec<WindowCounter>,
    pub created: usize,
    pub incremented: usize,
}

pub struct WindowMerger<'a, C> {
    counters: &'a C,
}

impl<'a, C> WindowMerger<'a, C>
where
    C: CounterStore,
{
    pub fn new(counters: &'a C) -> Self {
        Self { counters }
    }

    /// Add every local count to its `(tag, window)` counter.
    ///
    /// Stops at the first store error; counters merged before it stay committed.
    pub fn merge(&self, local: &BTreeMap<String, u64>, window: &WindowKey) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        for (tag, &delta) in local {
            if delta == 0 {
                continue;
            }
            let (count, outcome) = self.counters.upsert_add(tag, window, delta)?;
            match outcome {
                MergeOutcome::Created => summary.created += 1,
                MergeOutcome::Incremented => summary.incremented += 1,
            }
            #[cfg(feature = "metrics")]
            hashflow_metrics::record_counter_merge(outcome == MergeOutcome::Created);
            summary.counters.push(WindowCounter {
                tag: tag.clone(),
                window: window.clone(),
                count,
            });
        }
        debug!(
            window = %window,
            created = summary.created,
            incremented = summary.incremented,
            "window merge finished"
        );
        Ok(summary)
    }
}
