// Bounded cache of decoded index blocks, keyed by VCN

use super::block::IndexBlock;
use discfs_core::DiscError;
use log::trace;
use std::collections::{HashMap, VecDeque};

pub struct BlockCache {
    capacity: usize,
    blocks: HashMap<u64, IndexBlock>,
    /// Least recently used first
    order: VecDeque<u64>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            blocks: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn promote(&mut self, vcn: u64) {
        if let Some(pos) = self.order.iter().position(|&v| v == vcn) {
            self.order.remove(pos);
        }
        self.order.push_back(vcn);
    }

    /// Return the cached block, loading and caching it on a miss.
    pub fn get_or_load<F>(&mut self, vcn: u64, load: F) -> Result<IndexBlock, DiscError>
    where
        F: FnOnce(u64) -> Result<IndexBlock, DiscError>,
    {
        if let Some(block) = self.blocks.get(&vcn) {
            let block = block.clone();
            self.promote(vcn);
            return Ok(block);
        }
        let block = load(vcn)?;
        self.insert(block.clone());
        Ok(block)
    }

    pub fn insert(&mut self, block: IndexBlock) {
        let vcn = block.vcn;
        self.blocks.insert(vcn, block);
        self.promote(vcn);
        while self.blocks.len() > self.capacity {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.blocks.remove(&evicted);
            trace!("Evicted index block at VCN {}", evicted);
        }
    }

    pub fn remove(&mut self, vcn: u64) {
        self.blocks.remove(&vcn);
        self.order.retain(|&v| v != vcn);
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.order.clear();
    }
}
