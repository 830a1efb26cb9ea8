//! The shared registry of cluster nodes and their health.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod node;
pub mod selection;

pub use node::{features, DeadTimeout, InvalidNodeError, Node};
pub use selection::{Selection, SelectionKind, SelectionStrategy};

use node::NodeHealth;

const NODE_POOL: &str = "NodePool";

/// A type alias for an atomic swap operation on a shared value.
pub(crate) type AtomicSwap<T> = Arc<ArcSwap<T>>;

/// An error returned by a [`NodePool`] operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodePoolError {
    /// The pool holds no node at all.
    #[error("No nodes available in the node pool")]
    NoNodesAvailable,
    /// The pool has a fixed node set.
    #[error("The node pool does not support reseeding")]
    ReseedNotSupported,
}

#[derive(Debug)]
struct PooledNode {
    node: Node,
    // Shared with the entry replacing this one on reseed, matched by identifier or address.
    health: Arc<Mutex<NodeHealth>>,
}

impl PooledNode {
    fn new(node: Node) -> Self {
        let health = Arc::new(Mutex::new(node.health.clone()));
        Self { node, health }
    }

    fn with_health(node: Node, health: &Arc<Mutex<NodeHealth>>) -> Self {
        Self {
            node,
            health: Arc::clone(health),
        }
    }

    fn health(&self) -> MutexGuard<'_, NodeHealth> {
        // Health updates are plain field writes, a poisoned cell is still consistent.
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Node {
        let mut node = self.node.clone();
        node.health = self.health().clone();
        node
    }
}

/// The collection of nodes shared by every request issued through one transport.
///
/// Reads load the current node list without locking. Each node carries its own health cell, so
/// concurrent `mark_dead`/`mark_alive` calls are serialized per node and never lost, and a
/// [`reseed`](Self::reseed) keeps the very same cell for nodes it retains.
#[derive(Debug)]
pub struct NodePool {
    nodes: AtomicSwap<Vec<Arc<PooledNode>>>,
    cursor: AtomicUsize,
    strategy: SelectionStrategy,
    supports_reseeding: bool,
    supports_pinging: bool,
    last_update: Mutex<Option<Instant>>,
    reseed_lock: Mutex<()>,
    sniffed_on_startup: AtomicBool,
}

impl NodePool {
    /// A pool around a single node. It never reseeds and never pings, requests are not retried.
    pub fn single(node: Node) -> Self {
        Self::new(vec![node], SelectionStrategy::Sticky, false, false)
    }

    /// A pool with a fixed set of nodes.
    pub fn static_pool(nodes: Vec<Node>, strategy: SelectionStrategy) -> Self {
        Self::new(nodes, strategy, false, true)
    }

    /// A pool whose node set is replaced by topology discovery.
    pub fn sniffing(nodes: Vec<Node>, strategy: SelectionStrategy) -> Self {
        Self::new(nodes, strategy, true, true)
    }

    fn new(
        nodes: Vec<Node>,
        strategy: SelectionStrategy,
        supports_reseeding: bool,
        supports_pinging: bool,
    ) -> Self {
        let mut seen = HashSet::new();
        let nodes = nodes
            .into_iter()
            .filter(|node| seen.insert(node.id().to_string()))
            .map(|node| Arc::new(PooledNode::new(node)))
            .collect();
        Self {
            nodes: Arc::new(ArcSwap::from_pointee(nodes)),
            cursor: AtomicUsize::new(0),
            strategy,
            supports_reseeding,
            supports_pinging,
            last_update: Mutex::new(None),
            reseed_lock: Mutex::new(()),
            sniffed_on_startup: AtomicBool::new(false),
        }
    }

    /// Number of nodes in the pool.
    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    /// Returns `true` if the pool holds no node.
    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }

    /// Snapshots of all nodes, in pool order.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.load().iter().map(|n| n.snapshot()).collect()
    }

    /// Snapshot of the node with the given identifier.
    pub fn node(&self, id: &str) -> Option<Node> {
        self.find(id).map(|n| n.snapshot())
    }

    /// Current snapshot of a node taken earlier, matched by identifier, else by address.
    pub fn current(&self, node: &Node) -> Option<Node> {
        self.find_node(node).map(|n| n.snapshot())
    }

    /// The selection policy.
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Whether the node set can be replaced by topology discovery.
    pub fn supports_reseeding(&self) -> bool {
        self.supports_reseeding
    }

    /// Whether nodes of this pool may be health checked before use.
    pub fn supports_pinging(&self) -> bool {
        self.supports_pinging
    }

    /// When the node set was last replaced by a successful reseed.
    pub fn last_update(&self) -> Option<Instant> {
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retries a logical request may make before every distinct node has been tried once.
    pub fn max_retries(&self) -> usize {
        self.len().saturating_sub(1)
    }

    /// Returns the next candidate satisfying `predicate`.
    ///
    /// Alive nodes are preferred, then nodes whose dead timeout elapsed at `now` (tentatively
    /// resurrected), and finally, when every candidate is dead, the one closest to its
    /// resurrection. `Ok(None)` means no node satisfies the predicate.
    pub fn select_node<P>(&self, now: Instant, predicate: P) -> Result<Option<Selection>, NodePoolError>
    where
        P: Fn(&Node) -> bool,
    {
        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return Err(NodePoolError::NoNodesAvailable);
        }
        let start = self.strategy.start_index(&self.cursor, nodes.len());
        let mut resurrectable: Option<&Arc<PooledNode>> = None;
        let mut last_resort: Option<(&Arc<PooledNode>, Option<Instant>)> = None;
        for pooled in nodes[start..].iter().chain(nodes[..start].iter()) {
            let node = pooled.snapshot();
            if !predicate(&node) {
                continue;
            }
            if node.is_alive() {
                return Ok(Some(Selection {
                    node,
                    kind: SelectionKind::Alive,
                }));
            }
            match node.dead_until() {
                Some(until) if until <= now => {
                    resurrectable.get_or_insert(pooled);
                }
                until => {
                    let closer = last_resort.map_or(true, |(_, best)| until < best);
                    if closer {
                        last_resort = Some((pooled, until));
                    }
                }
            }
        }
        if let Some(pooled) = resurrectable {
            let mut health = pooled.health();
            health.resurrected = true;
            drop(health);
            let node = pooled.snapshot();
            debug!("{NODE_POOL}: resurrecting node {node}");
            return Ok(Some(Selection {
                node,
                kind: SelectionKind::Resurrected,
            }));
        }
        Ok(last_resort.map(|(pooled, _)| {
            let node = pooled.snapshot();
            warn!("{NODE_POOL}: all candidate nodes are dead, falling back to {node}");
            Selection {
                node,
                kind: SelectionKind::LastResort,
            }
        }))
    }

    /// Marks the node dead until `now` plus the backoff for its failure count.
    ///
    /// Returns the new dead-until instant, or `None` if the node is no longer in the pool.
    pub fn mark_dead(&self, node: &Node, now: Instant, dead_timeout: &DeadTimeout) -> Option<Instant> {
        let pooled = self.find_node(node)?;
        let mut health = pooled.health();
        health.failed_attempts = health.failed_attempts.saturating_add(1);
        let dead_until = now + dead_timeout.delay(health.failed_attempts);
        health.alive = false;
        health.dead_until = Some(dead_until);
        health.resurrected = false;
        debug!(
            "{NODE_POOL}: node {node} marked dead after {} failed attempt(s)",
            health.failed_attempts
        );
        Some(dead_until)
    }

    /// Marks the node alive and forgets its failures. Returns `false` if the node is no longer in the pool.
    pub fn mark_alive(&self, node: &Node) -> bool {
        let Some(pooled) = self.find_node(node) else {
            return false;
        };
        let mut health = pooled.health();
        health.alive = true;
        health.dead_until = None;
        health.failed_attempts = 0;
        health.resurrected = false;
        true
    }

    /// Atomically replaces the node set, returning `true` if it was replaced.
    ///
    /// Nodes already known by identifier keep their health, as do known addresses reported under
    /// another identifier; new ones start alive. An empty list is ignored, as it would leave
    /// the pool with nothing to reseed from.
    pub fn reseed(&self, nodes: Vec<Node>) -> Result<bool, NodePoolError> {
        if !self.supports_reseeding {
            return Err(NodePoolError::ReseedNotSupported);
        }
        if nodes.is_empty() {
            warn!("{NODE_POOL}: ignoring reseed with an empty list of nodes");
            return Ok(false);
        }
        let _guard = self.reseed_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.nodes.load_full();
        let mut seen = HashSet::new();
        let reseeded: Vec<_> = nodes
            .into_iter()
            .filter(|node| seen.insert(node.id().to_string()))
            .map(|node| {
                let known = current
                    .iter()
                    .find(|pooled| pooled.node.id() == node.id())
                    .or_else(|| current.iter().find(|pooled| pooled.node.url() == node.url()));
                Arc::new(match known {
                    Some(pooled) => PooledNode::with_health(node, &pooled.health),
                    None => PooledNode::new(node),
                })
            })
            .collect();
        info!(
            "{NODE_POOL}: reseeded with {} node(s), previously {}",
            reseeded.len(),
            current.len()
        );
        self.nodes.store(Arc::new(reseeded));
        *self.last_update.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        Ok(true)
    }

    pub(crate) fn sniffed_on_startup(&self) -> bool {
        self.sniffed_on_startup.load(Ordering::Acquire)
    }

    pub(crate) fn set_sniffed_on_startup(&self) {
        self.sniffed_on_startup.store(true, Ordering::Release);
    }

    fn find(&self, id: &str) -> Option<Arc<PooledNode>> {
        self.nodes
            .load()
            .iter()
            .find(|pooled| pooled.node.id() == id)
            .cloned()
    }

    // Snapshots taken before a reseed may carry an identifier the pool no longer uses.
    fn find_node(&self, node: &Node) -> Option<Arc<PooledNode>> {
        let nodes = self.nodes.load();
        nodes
            .iter()
            .find(|pooled| pooled.node.id() == node.id())
            .or_else(|| nodes.iter().find(|pooled| pooled.node.url() == node.url()))
            .cloned()
    }
}
