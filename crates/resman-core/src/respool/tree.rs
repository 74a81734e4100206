//! The resource-pool tree.
//!
//! Built from the resource-pool store at boot and refreshed on admin
//! change. Topology is guarded by a read-write lock (read-held for
//! lookups, write-held only for create/delete); each pool guards its own
//! queues and allocation. Allocation changes at a leaf propagate to the
//! root.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use resman_api::{Error, ResourcePoolConfig, Resources, Result};
use resman_store::ResourcePoolStore;

use super::pool::ResourcePool;

#[derive(Debug)]
struct Topology {
    pools: HashMap<String, Arc<ResourcePool>>,
    /// Pool ids with at least one child.
    inner_nodes: HashSet<String>,
    root: String,
}

#[derive(Debug)]
pub struct Tree {
    topology: RwLock<Topology>,
    queue_bound: usize,
}

impl Tree {
    /// Build the tree from pool configs. Exactly one root is required;
    /// every parent must exist and precede no cycle.
    pub fn build(configs: &[ResourcePoolConfig], queue_bound: usize) -> Result<Arc<Self>> {
        let topology = Self::assemble(configs, queue_bound)?;
        Ok(Arc::new(Self {
            topology: RwLock::new(topology),
            queue_bound,
        }))
    }

    /// Build the tree by reading all pool configs from the store.
    pub async fn from_store(
        store: &dyn ResourcePoolStore,
        queue_bound: usize,
    ) -> Result<Arc<Self>> {
        let configs = store.get_all_resource_pools().await?;
        Self::build(&configs, queue_bound)
    }

    fn assemble(configs: &[ResourcePoolConfig], queue_bound: usize) -> Result<Topology> {
        let mut pools = HashMap::new();
        let mut inner_nodes = HashSet::new();
        let mut root = None;

        for config in configs {
            match &config.parent {
                None => {
                    if root.replace(config.name.clone()).is_some() {
                        return Err(Error::Internal(
                            "resource-pool config has more than one root".to_owned(),
                        ));
                    }
                }
                Some(parent) => {
                    inner_nodes.insert(parent.clone());
                }
            }
            let pool = Arc::new(ResourcePool::new(config, queue_bound));
            if pools.insert(config.name.clone(), pool).is_some() {
                return Err(Error::Internal(format!(
                    "duplicate resource pool {}",
                    config.name
                )));
            }
        }

        let root = root.ok_or_else(|| {
            Error::Internal("resource-pool config has no root".to_owned())
        })?;

        // Every parent must resolve, and walking parents from any node
        // must reach the root without revisiting a node.
        for pool in pools.values() {
            let mut seen = HashSet::new();
            let mut current = pool.id().to_owned();
            while let Some(parent) = pools
                .get(&current)
                .ok_or_else(|| Error::NotFound(format!("resource pool {current}")))?
                .parent()
            {
                if !seen.insert(current.clone()) {
                    return Err(Error::Internal(format!(
                        "cycle in resource-pool tree at {current}"
                    )));
                }
                current = parent.to_owned();
            }
            if current != root {
                return Err(Error::Internal(format!(
                    "resource pool {} is not connected to the root",
                    pool.id()
                )));
            }
        }

        Ok(Topology {
            pools,
            inner_nodes,
            root,
        })
    }

    pub fn get(&self, id: &str) -> Result<Arc<ResourcePool>> {
        let topology = self.topology.read().expect("tree lock poisoned");
        topology
            .pools
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("resource pool {id}")))
    }

    pub fn root(&self) -> Arc<ResourcePool> {
        let topology = self.topology.read().expect("tree lock poisoned");
        topology.pools[&topology.root].clone()
    }

    /// Leaf pools in id order. Scheduling walks this order round-robin
    /// so fairness across leaves is deterministic.
    pub fn leaves(&self) -> Vec<Arc<ResourcePool>> {
        let topology = self.topology.read().expect("tree lock poisoned");
        let mut leaves: Vec<Arc<ResourcePool>> = topology
            .pools
            .values()
            .filter(|pool| !topology.inner_nodes.contains(pool.id()))
            .cloned()
            .collect();
        leaves.sort_by(|a, b| a.id().cmp(b.id()));
        leaves
    }

    /// True when the pool has no children. Only leaves accept gangs.
    pub fn is_leaf(&self, id: &str) -> Result<bool> {
        let topology = self.topology.read().expect("tree lock poisoned");
        if !topology.pools.contains_key(id) {
            return Err(Error::NotFound(format!("resource pool {id}")));
        }
        Ok(!topology.inner_nodes.contains(id))
    }

    /// Charge an allocation to a pool and all its ancestors.
    pub fn charge(&self, pool_id: &str, delta: Resources) -> Result<()> {
        self.walk_up(pool_id, |pool| pool.add_allocation(delta))
    }

    /// Release an allocation from a pool and all its ancestors.
    pub fn uncharge(&self, pool_id: &str, delta: Resources) -> Result<()> {
        self.walk_up(pool_id, |pool| pool.release_allocation(delta))
    }

    fn walk_up(&self, pool_id: &str, f: impl Fn(&ResourcePool)) -> Result<()> {
        let topology = self.topology.read().expect("tree lock poisoned");
        let mut current = pool_id.to_owned();
        loop {
            let pool = topology
                .pools
                .get(&current)
                .ok_or_else(|| Error::NotFound(format!("resource pool {current}")))?;
            f(pool);
            match pool.parent() {
                Some(parent) => current = parent.to_owned(),
                None => return Ok(()),
            }
        }
    }

    /// Refresh the tree on admin change: new pools are added, existing
    /// pools keep their queues and allocation. Pools absent from the new
    /// config are only dropped when they hold nothing.
    pub fn refresh(&self, configs: &[ResourcePoolConfig]) -> Result<()> {
        let fresh = Self::assemble(configs, self.queue_bound)?;
        let mut topology = self.topology.write().expect("tree lock poisoned");

        let mut merged: HashMap<String, Arc<ResourcePool>> = HashMap::new();
        for (id, pool) in &fresh.pools {
            match topology.pools.get(id) {
                Some(existing) => {
                    merged.insert(id.clone(), existing.clone());
                }
                None => {
                    merged.insert(id.clone(), pool.clone());
                }
            }
        }
        // Pools removed from config survive while non-empty.
        for (id, pool) in &topology.pools {
            if !merged.contains_key(id)
                && (!pool.allocation().is_zero() || pool.ready_len() > 0)
            {
                tracing::warn!(pool = %id, "keeping non-empty pool dropped from config");
                merged.insert(id.clone(), pool.clone());
            }
        }

        topology.pools = merged;
        topology.inner_nodes = fresh.inner_nodes;
        topology.root = fresh.root;
        Ok(())
    }
}
