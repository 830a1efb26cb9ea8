//! Strategies deciding where node selection starts.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::node::Node;

/// Policy deciding where a pool starts looking for a node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum SelectionStrategy {
    /// Cycle through the nodes, one step per selection.
    #[default]
    RoundRobin,
    /// Always prefer the first usable node in pool order.
    Sticky,
    /// Start at a pseudo-random position derived from the seed and the selection cursor.
    Randomized {
        /// Seed of the pseudo-random sequence.
        seed: u64,
    },
}

impl SelectionStrategy {
    /// Returns the index the next scan starts at, advancing the cursor if the strategy rotates.
    pub(super) fn start_index(&self, cursor: &AtomicUsize, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        match self {
            SelectionStrategy::RoundRobin => {
                // This operation wraps around an overflow, i.e. after max is reached the value is reset back to 0.
                cursor.fetch_add(1, Ordering::Relaxed) % len
            }
            SelectionStrategy::Sticky => 0,
            SelectionStrategy::Randomized { seed } => {
                let step = cursor.fetch_add(1, Ordering::Relaxed) as u64;
                StdRng::seed_from_u64(seed ^ step).gen_range(0..len)
            }
        }
    }
}

/// Why a node was handed out by [`NodePool::select_node`](super::NodePool::select_node).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SelectionKind {
    /// The node is alive.
    Alive,
    /// The node was dead but its dead timeout elapsed, it's tentatively used again.
    Resurrected,
    /// Every candidate is dead, this one is tried as a last resort.
    LastResort,
}

/// A node picked for the next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Snapshot of the chosen node.
    pub node: Node,
    /// How the node was chosen.
    pub kind: SelectionKind,
}
