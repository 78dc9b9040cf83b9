//! Block registry
//!
//! The registry is the immutable, validated list of blocks a cascade runs. It is
//! always kept sorted by block number; that order is the tie-break used by the
//! scheduler and everything downstream of it.

pub mod loader;

pub use loader::{RawBlock, RegistryFormat, RegistryLoader};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::core::errors::RegistryError;

/// Sequence number identifying a block; unique within a registry.
pub type BlockNumber = u32;

/// A single unit of work and the blocks it waits on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDefinition {
    pub id: String,
    pub block_number: BlockNumber,
    pub name: String,
    /// Informational only; never used for ordering.
    pub weight: u32,
    pub depends_on: BTreeSet<BlockNumber>,
}

impl BlockDefinition {
    pub fn new<S: Into<String>>(
        id: S,
        block_number: BlockNumber,
        depends_on: impl IntoIterator<Item = BlockNumber>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            block_number,
            weight: 0,
            depends_on: depends_on.into_iter().collect(),
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// True when every dependency is in `completed`.
    pub fn dependencies_met(&self, completed: &BTreeSet<BlockNumber>) -> bool {
        self.depends_on.is_subset(completed)
    }
}

/// Validated, ordered collection of block definitions
#[derive(Debug, Clone)]
pub struct Registry {
    blocks: Vec<BlockDefinition>,
    index: HashMap<BlockNumber, usize>,
}

impl Registry {
    /// Build a registry, rejecting duplicates, dangling edges and cycles.
    pub fn new(blocks: Vec<BlockDefinition>) -> Result<Self, RegistryError> {
        let registry = Self::build(blocks)?;
        if let Some(cycle) = registry.cycles().into_iter().next() {
            return Err(RegistryError::Cycle { blocks: cycle });
        }
        Ok(registry)
    }

    /// Like [`Registry::new`] but accepts dependency cycles.
    ///
    /// Blocks on a cycle never become ready, so a run over such a registry ends
    /// in `Waiting`. Each cycle is logged as a configuration defect.
    pub fn new_allowing_cycles(blocks: Vec<BlockDefinition>) -> Result<Self, RegistryError> {
        let registry = Self::build(blocks)?;
        for cycle in registry.cycles() {
            tracing::warn!(
                "Registry: blocks {:?} form a dependency cycle and will never become ready",
                cycle
            );
        }
        Ok(registry)
    }

    fn build(mut blocks: Vec<BlockDefinition>) -> Result<Self, RegistryError> {
        if blocks.is_empty() {
            return Err(RegistryError::Empty);
        }
        blocks.sort_by_key(|b| b.block_number);

        let mut index = HashMap::with_capacity(blocks.len());
        let mut ids: HashMap<&str, BlockNumber> = HashMap::with_capacity(blocks.len());
        for (pos, block) in blocks.iter().enumerate() {
            if let Some(&prev) = index.get(&block.block_number) {
                let first: &BlockDefinition = &blocks[prev];
                return Err(RegistryError::DuplicateBlockNumber {
                    block_number: block.block_number,
                    first: first.id.clone(),
                    second: block.id.clone(),
                });
            }
            if let Some(&first) = ids.get(block.id.as_str()) {
                return Err(RegistryError::DuplicateId {
                    id: block.id.clone(),
                    first,
                    second: block.block_number,
                });
            }
            index.insert(block.block_number, pos);
            ids.insert(block.id.as_str(), block.block_number);
        }

        for block in &blocks {
            if let Some(&dependency) = block.depends_on.iter().find(|d| !index.contains_key(d)) {
                return Err(RegistryError::UnknownDependency {
                    block_number: block.block_number,
                    dependency,
                });
            }
        }

        Ok(Self { blocks, index })
    }

    /// Blocks in ascending block-number order
    pub fn blocks(&self) -> &[BlockDefinition] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, block_number: BlockNumber) -> Option<&BlockDefinition> {
        self.index.get(&block_number).map(|&pos| &self.blocks[pos])
    }

    pub fn contains(&self, block_number: BlockNumber) -> bool {
        self.index.contains_key(&block_number)
    }

    pub fn block_numbers(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.blocks.iter().map(|b| b.block_number)
    }

    /// First block, in ascending order, that is neither completed nor failed and
    /// whose dependencies are all completed.
    pub fn next_ready(
        &self,
        completed: &BTreeSet<BlockNumber>,
        failed: &BTreeSet<BlockNumber>,
    ) -> Option<&BlockDefinition> {
        self.blocks.iter().find(|b| {
            !completed.contains(&b.block_number)
                && !failed.contains(&b.block_number)
                && b.dependencies_met(completed)
        })
    }

    /// Every block that depends on `block_number`, directly or through other blocks.
    pub fn transitive_dependents(&self, block_number: BlockNumber) -> BTreeSet<BlockNumber> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![block_number];
        while let Some(current) = frontier.pop() {
            for block in &self.blocks {
                if block.depends_on.contains(&current) && found.insert(block.block_number) {
                    frontier.push(block.block_number);
                }
            }
        }
        found
    }

    /// Dependency cycles, each as a sorted list of block numbers.
    pub fn cycles(&self) -> Vec<Vec<BlockNumber>> {
        let mut graph = DiGraphMap::<BlockNumber, ()>::new();
        for block in &self.blocks {
            graph.add_node(block.block_number);
            for &dep in &block.depends_on {
                graph.add_edge(dep, block.block_number, ());
            }
        }

        let mut cycles: Vec<Vec<BlockNumber>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|mut scc| {
                scc.sort_unstable();
                scc
            })
            .collect();
        cycles.sort();
        cycles
    }
}
