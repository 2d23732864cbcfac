// NTFS index engine
// B+trees with an inline root in $INDEX_ROOT and overflow blocks in $INDEX_ALLOCATION,
// tracked by the index's $BITMAP. Used for directories ($I30) and the view indexes
// of $Secure, $ObjId, $Quota and $Reparse.

pub mod block;
pub mod cache;
pub mod collation;
pub mod entry;
pub mod keys;
pub mod node;

pub use collation::{Collate, CollationRule, Collator, UpperCase};
pub use entry::{IndexEntry, IndexKind};
pub use keys::{
    describe_entry, IndexData, IndexKey, ObjectIdData, ObjectIdKey, QuotaData, ReparseKey, SecurityDescriptorData,
    SecurityHashKey, SecurityIdKey, Sid,
};

use self::block::{node_capacity, IndexBlock};
use self::cache::BlockCache;
use self::node::IndexNode;
use super::attributes::{
    AttributeRecord, ATTR_TYPE_BITMAP, ATTR_TYPE_FILE_NAME, ATTR_TYPE_INDEX_ALLOCATION, ATTR_TYPE_INDEX_ROOT,
};
use super::bitmap::Bitmap;
use super::codec::{round_up, ByteCodec};
use super::file::NtfsFile;
use super::stream::{resident_size, NtfsStream};
use super::structures::IndexRootHeader;
use super::transaction::NtfsTransaction;
use super::volume::NtfsContext;
use discfs_core::DiscError;
use log::{debug, trace};
use std::cmp::Ordering;
use std::fmt::Write as _;

/// A node is either the root or a block addressed by VCN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRef {
    Root,
    Block(u64),
}

enum Removal {
    Missing,
    /// Entry removed; the node may have split and promoted an entry for its parent
    Removed(Option<IndexEntry>),
}

pub struct Index {
    file: NtfsFile,
    name: String,
    kind: IndexKind,
    header: IndexRootHeader,
    collator: Collator,
    root: IndexNode,
    cache: BlockCache,
    block_size: usize,
    /// Bytes per VCN unit of the allocation stream
    vcn_size: u64,
}

impl Index {
    /// Add an empty index named `name` to `file`.
    pub fn create(
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        file: NtfsFile,
        name: &str,
        indexed_type: u32,
        rule: CollationRule,
    ) -> Result<Self, DiscError> {
        if file.attribute(ATTR_TYPE_INDEX_ROOT, name)?.is_some() {
            return Err(DiscError::InvalidInput(format!(
                "Index '{}' already exists in {}",
                name,
                file.reference()
            )));
        }

        let block_size = ctx.index_buffer_size()?;
        let cluster_size = ctx.cluster_size() as usize;
        let raw_clusters_per_buffer = if block_size >= cluster_size {
            (block_size / cluster_size) as i8
        } else {
            (block_size / 512) as i8
        };
        let header = IndexRootHeader {
            indexed_type,
            collation_rule: rule.raw(),
            index_buffer_size: block_size as u32,
            raw_clusters_per_buffer,
        };

        let mut index = Self::assemble(ctx, file, name, header, IndexNode::empty())?;
        let attr = AttributeRecord::new_resident(ATTR_TYPE_INDEX_ROOT, name, index.root_value());
        index.file.add_attribute(ctx, attr)?;
        index.file.touch(tx)?;
        index.file.save(ctx)?;
        debug!(
            "Created index '{}' ({:?} collation) in {}",
            name,
            rule,
            index.file.reference()
        );
        Ok(index)
    }

    /// Open the existing index `name` of `file`.
    pub fn open(ctx: &mut NtfsContext, file: NtfsFile, name: &str) -> Result<Self, DiscError> {
        let attr = file.require(ATTR_TYPE_INDEX_ROOT, name)?;
        let value = attr
            .value()
            .ok_or_else(|| DiscError::Corrupt(format!("Non-resident $INDEX_ROOT '{}'", name)))?;
        let (header, _) = IndexRootHeader::read_from(value)?;
        let kind = kind_for(header.indexed_type);
        let node_bytes = value
            .get(IndexRootHeader::SIZE..)
            .ok_or_else(|| DiscError::Corrupt(format!("Truncated $INDEX_ROOT '{}'", name)))?;
        let root = IndexNode::read(node_bytes, kind)?;
        Self::assemble(ctx, file, name, header, root)
    }

    fn assemble(
        ctx: &NtfsContext,
        file: NtfsFile,
        name: &str,
        header: IndexRootHeader,
        root: IndexNode,
    ) -> Result<Self, DiscError> {
        let rule = CollationRule::from_raw(header.collation_rule)?;
        let block_size = header.index_buffer_size as usize;
        let bytes_per_sector = ctx.bytes_per_sector();
        if !block_size.is_power_of_two() || block_size < bytes_per_sector {
            return Err(DiscError::Corrupt(format!(
                "Index '{}' has block size {}",
                name, block_size
            )));
        }
        let cluster_size = ctx.cluster_size();
        let vcn_size = if block_size as u64 >= cluster_size { cluster_size } else { 512 };

        Ok(Self {
            file,
            name: name.to_string(),
            kind: kind_for(header.indexed_type),
            header,
            collator: Collator::new(rule, ctx.upcase.clone()),
            root,
            cache: BlockCache::new(ctx.options.index_cache_capacity),
            block_size,
            vcn_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn collation_rule(&self) -> CollationRule {
        self.collator.rule()
    }

    pub fn file(&self) -> &NtfsFile {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut NtfsFile {
        &mut self.file
    }

    pub fn into_file(self) -> NtfsFile {
        self.file
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.collator.compare(a, b)
    }

    fn vcns_per_block(&self) -> u64 {
        (self.block_size as u64 / self.vcn_size).max(1)
    }

    fn root_value(&self) -> Vec<u8> {
        let node_size = self.root.size(self.kind);
        let mut value = vec![0u8; IndexRootHeader::SIZE + node_size];
        self.header.write_to(&mut value);
        self.root.write(
            &mut value[IndexRootHeader::SIZE..],
            self.kind,
            node::NODE_HEADER_SIZE,
            node_size,
        );
        value
    }

    /// Whether `node` fits the room the root may take in its FILE record.
    fn root_fits(&self, node: &IndexNode) -> Result<bool, DiscError> {
        let attr = self.file.require(ATTR_TYPE_INDEX_ROOT, &self.name)?;
        let budget = self.file.free_space_for(ATTR_TYPE_INDEX_ROOT, &self.name)? + attr.size();
        let needed = resident_size(&self.name, IndexRootHeader::SIZE + node.size(self.kind));
        Ok(needed <= budget)
    }

    fn write_root(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction) -> Result<(), DiscError> {
        let value = self.root_value();
        let slot = self
            .file
            .require_mut(ATTR_TYPE_INDEX_ROOT, &self.name)?
            .value_mut()
            .ok_or_else(|| DiscError::Corrupt("Non-resident $INDEX_ROOT".to_string()))?;
        *slot = value;
        self.file.touch(tx)?;
        self.file.save(ctx)
    }

    fn load_block(&mut self, ctx: &mut NtfsContext, vcn: u64) -> Result<IndexBlock, DiscError> {
        let Self {
            cache,
            file,
            name,
            kind,
            block_size,
            vcn_size,
            ..
        } = self;
        cache.get_or_load(vcn, |vcn| {
            let mut raw = vec![0u8; *block_size];
            let read = NtfsStream::new(ATTR_TYPE_INDEX_ALLOCATION, name).read(ctx, file, vcn * *vcn_size, &mut raw)?;
            if read < raw.len() {
                return Err(DiscError::Corrupt(format!(
                    "Index block at VCN {} of '{}' lies past the allocation stream",
                    vcn, name
                )));
            }
            let block = IndexBlock::read(&raw, *kind, ctx.bytes_per_sector(), ctx.options.strict_fixup)?;
            if block.vcn != vcn {
                return Err(DiscError::Corrupt(format!(
                    "Index block at VCN {} claims VCN {}",
                    vcn, block.vcn
                )));
            }
            trace!("Loaded index block {} of '{}'", vcn, name);
            Ok(block)
        })
    }

    fn write_block(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction, block: IndexBlock) -> Result<(), DiscError> {
        let bytes = block.to_bytes(self.kind, self.block_size, ctx.bytes_per_sector())?;
        NtfsStream::new(ATTR_TYPE_INDEX_ALLOCATION, &self.name).write(
            ctx,
            &mut self.file,
            tx,
            block.vcn * self.vcn_size,
            &bytes,
        )?;
        self.cache.insert(block);
        Ok(())
    }

    fn load_bitmap(&mut self, ctx: &mut NtfsContext) -> Result<Bitmap, DiscError> {
        let stream = NtfsStream::new(ATTR_TYPE_BITMAP, &self.name);
        if !stream.exists(&self.file)? {
            return Ok(Bitmap::with_limit(0, u64::MAX));
        }
        let bytes = stream.get_content(ctx, &self.file)?;
        Bitmap::from_bytes(&bytes, bytes.len() as u64 * 8, u64::MAX)
    }

    fn store_bitmap(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction, bitmap: &Bitmap) -> Result<(), DiscError> {
        let mut bytes = bitmap.as_bytes().to_vec();
        bytes.resize(round_up(bytes.len().max(1), 8), 0);
        NtfsStream::new(ATTR_TYPE_BITMAP, &self.name).set_content(ctx, &mut self.file, tx, &bytes)
    }

    /// Claim a free block slot, creating the allocation and bitmap streams on first use.
    fn allocate_block(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction) -> Result<u64, DiscError> {
        let allocation = NtfsStream::new(ATTR_TYPE_INDEX_ALLOCATION, &self.name);
        if !allocation.exists(&self.file)? {
            debug!("Creating $INDEX_ALLOCATION for '{}' in {}", self.name, self.file.reference());
            allocation.create(ctx, &mut self.file, tx)?;
        }
        let bitmap_stream = NtfsStream::new(ATTR_TYPE_BITMAP, &self.name);
        if !bitmap_stream.exists(&self.file)? {
            bitmap_stream.create(ctx, &mut self.file, tx)?;
        }

        let mut bitmap = self.load_bitmap(ctx)?;
        let slot = bitmap.allocate_first_available(0)?;
        self.store_bitmap(ctx, tx, &bitmap)?;

        let end = (slot + 1) * self.block_size as u64;
        if allocation.len(&self.file)? < end {
            allocation.set_length(ctx, &mut self.file, tx, end)?;
        }
        let vcn = slot * self.vcns_per_block();
        debug!("Allocated index block {} (VCN {}) for '{}'", slot, vcn, self.name);
        Ok(vcn)
    }

    fn free_block(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction, vcn: u64) -> Result<(), DiscError> {
        let mut bitmap = self.load_bitmap(ctx)?;
        bitmap.mark_absent(vcn / self.vcns_per_block())?;
        self.store_bitmap(ctx, tx, &bitmap)?;
        self.cache.remove(vcn);
        debug!("Freed index block at VCN {} of '{}'", vcn, self.name);
        Ok(())
    }

    fn get_node(&mut self, ctx: &mut NtfsContext, at: NodeRef) -> Result<IndexNode, DiscError> {
        match at {
            NodeRef::Root => Ok(self.root.clone()),
            NodeRef::Block(vcn) => Ok(self.load_block(ctx, vcn)?.node),
        }
    }

    fn put_node(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        at: NodeRef,
        node: IndexNode,
    ) -> Result<(), DiscError> {
        match at {
            NodeRef::Root => {
                self.root = node;
                self.write_root(ctx, tx)
            }
            NodeRef::Block(vcn) => self.write_block(ctx, tx, IndexBlock::new(vcn, node)),
        }
    }

    /// Position of the first entry not less than `key`, and whether it is equal.
    fn locate(&self, node: &IndexNode, key: &[u8]) -> (usize, bool) {
        for (i, entry) in node.entries.iter().enumerate() {
            if entry.is_end {
                return (i, false);
            }
            match self.collator.compare(key, &entry.key) {
                Ordering::Less => return (i, false),
                Ordering::Equal => return (i, true),
                Ordering::Greater => {}
            }
        }
        (node.entries.len().saturating_sub(1), false)
    }

    fn insert_ordered(&self, node: &mut IndexNode, entry: IndexEntry) {
        let (position, _) = self.locate(node, &entry.key);
        node.entries.insert(position, entry);
    }

    /// Write `node` back, splitting it when it has outgrown its slot.
    ///
    /// A split block keeps its upper half in place and returns the median
    /// entry, now pointing at a new block holding the lower half. An
    /// overflowing root moves its entries into a new block. Removal can
    /// overflow the root too, when a longer predecessor key replaces the
    /// removed one.
    fn fit_node(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        at: NodeRef,
        mut node: IndexNode,
    ) -> Result<Option<IndexEntry>, DiscError> {
        match at {
            NodeRef::Block(vcn) => {
                if node.entries_size(self.kind) <= node_capacity(self.block_size, ctx.bytes_per_sector()) {
                    self.put_node(ctx, tx, at, node)?;
                    return Ok(None);
                }
                let keys = node.key_count();
                if keys < 3 {
                    return Err(DiscError::CapacityExceeded(format!(
                        "Index block {} of '{}' overflows with {} entries",
                        vcn, self.name, keys
                    )));
                }
                let median = keys / 2;
                let right = node.entries.split_off(median + 1);
                let mut promoted = node.entries.pop().ok_or_else(|| {
                    DiscError::Corrupt("Index node lost its median entry".to_string())
                })?;
                node.entries.push(IndexEntry::end(promoted.child));
                let left = node;

                let left_vcn = self.allocate_block(ctx, tx)?;
                self.put_node(ctx, tx, NodeRef::Block(left_vcn), left)?;
                self.put_node(ctx, tx, at, IndexNode { entries: right })?;
                promoted.child = Some(left_vcn);
                debug!(
                    "Split index block {} of '{}': lower half moved to {}",
                    vcn, self.name, left_vcn
                );
                Ok(Some(promoted))
            }
            NodeRef::Root => {
                if self.root_fits(&node)? {
                    self.put_node(ctx, tx, at, node)?;
                    return Ok(None);
                }
                let child_vcn = self.allocate_block(ctx, tx)?;
                debug!("Pushing root of '{}' down into block {}", self.name, child_vcn);
                let mut root = IndexNode {
                    entries: vec![IndexEntry::end(Some(child_vcn))],
                };
                if let Some(promoted) = self.fit_node(ctx, tx, NodeRef::Block(child_vcn), node)? {
                    root.entries.insert(0, promoted);
                }
                if !self.root_fits(&root)? {
                    return Err(DiscError::CapacityExceeded(format!(
                        "Root of index '{}' cannot hold its End entry",
                        self.name
                    )));
                }
                self.put_node(ctx, tx, at, root)?;
                Ok(None)
            }
        }
    }

    /// Insert below `at`, returning an entry the parent must take after a split.
    fn add_to(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        at: NodeRef,
        entry: IndexEntry,
    ) -> Result<Option<IndexEntry>, DiscError> {
        let mut node = self.get_node(ctx, at)?;
        let (position, exact) = self.locate(&node, &entry.key);
        if exact {
            return Err(DiscError::InvalidInput(format!(
                "Key already present in index '{}'",
                self.name
            )));
        }

        if let Some(child) = node.entries[position].child {
            match self.add_to(ctx, tx, NodeRef::Block(child), entry)? {
                Some(promoted) => node.entries.insert(position, promoted),
                None => return Ok(None),
            }
        } else {
            node.entries.insert(position, entry);
        }
        self.fit_node(ctx, tx, at, node)
    }

    /// Insert a new entry. An equal key already present is `InvalidInput`.
    pub fn insert(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        key: &[u8],
        data: &[u8],
    ) -> Result<(), DiscError> {
        if self.kind == IndexKind::FileName && data.len() != 8 {
            return Err(DiscError::InvalidInput(format!(
                "File name index entries carry an 8-byte reference, got {} bytes",
                data.len()
            )));
        }
        trace!("Inserting {} byte key into '{}'", key.len(), self.name);
        // The root absorbs its own splits, so nothing is promoted out of it
        self.add_to(ctx, tx, NodeRef::Root, IndexEntry::new(key.to_vec(), data.to_vec()))?;
        Ok(())
    }

    /// Insert, or replace the data of an existing key.
    pub fn set(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction, key: &[u8], data: &[u8]) -> Result<(), DiscError> {
        self.remove(ctx, tx, key)?;
        self.insert(ctx, tx, key, data)
    }

    /// Data of the entry equal to `key`.
    pub fn try_get(&mut self, ctx: &mut NtfsContext, key: &[u8]) -> Result<Option<Vec<u8>>, DiscError> {
        let mut node = self.root.clone();
        loop {
            let (position, exact) = self.locate(&node, key);
            let entry = &node.entries[position];
            if exact {
                return Ok(Some(entry.data.clone()));
            }
            match entry.child {
                Some(vcn) => node = self.load_block(ctx, vcn)?.node,
                None => return Ok(None),
            }
        }
    }

    /// Like `try_get`, with absence reported as `NotFound`.
    pub fn get(&mut self, ctx: &mut NtfsContext, key: &[u8]) -> Result<Vec<u8>, DiscError> {
        self.try_get(ctx, key)?
            .ok_or_else(|| DiscError::NotFound(format!("Key not in index '{}'", self.name)))
    }

    pub fn contains_key(&mut self, ctx: &mut NtfsContext, key: &[u8]) -> Result<bool, DiscError> {
        Ok(self.try_get(ctx, key)?.is_some())
    }

    /// Key and data of the greatest entry in the subtree under block `vcn`.
    fn largest_leaf_entry(&mut self, ctx: &mut NtfsContext, vcn: u64) -> Result<(Vec<u8>, Vec<u8>), DiscError> {
        let mut node = self.load_block(ctx, vcn)?.node;
        loop {
            if let Some(child) = node.end_entry().child {
                node = self.load_block(ctx, child)?.node;
                continue;
            }
            let count = node.entries.len();
            if count < 2 {
                return Err(DiscError::Corrupt(format!("Empty leaf block in index '{}'", self.name)));
            }
            let entry = &node.entries[count - 2];
            if entry.child.is_some() {
                return Err(DiscError::Corrupt(format!(
                    "Index '{}' mixes leaf and node entries",
                    self.name
                )));
            }
            return Ok((entry.key.clone(), entry.data.clone()));
        }
    }

    /// Free the child of `node.entries[idx]` if it emptied, pushing an entry
    /// left without a subtree down into its successor's subtree.
    fn lift_child(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        node: &mut IndexNode,
        idx: usize,
    ) -> Result<Option<IndexEntry>, DiscError> {
        let Some(vcn) = node.entries[idx].child else {
            return Ok(None);
        };
        let child = self.get_node(ctx, NodeRef::Block(vcn))?;
        if child.entries.len() == 1 {
            // Only the End entry is left: pass its subtree straight through
            node.entries[idx].child = child.entries[0].child;
            self.free_block(ctx, tx, vcn)?;
        }

        if node.entries[idx].child.is_none() && !node.entries[idx].is_end {
            let entry = node.entries.remove(idx);
            match node.entries[idx].child {
                Some(next) => return self.add_to(ctx, tx, NodeRef::Block(next), entry),
                None => node.entries.insert(idx, entry),
            }
        }
        Ok(None)
    }

    /// Give the End entry a subtree again when it lost its own.
    fn populate_end(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        node: &mut IndexNode,
    ) -> Result<Option<IndexEntry>, DiscError> {
        let count = node.entries.len();
        if count < 2 || node.end_entry().child.is_some() {
            return Ok(None);
        }
        let Some(vcn) = node.entries[count - 2].child else {
            return Ok(None);
        };
        let mut moved = node.entries.remove(count - 2);
        moved.child = None;
        node.end_entry_mut().child = Some(vcn);
        self.add_to(ctx, tx, NodeRef::Block(vcn), moved)
    }

    fn after_child_removal(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        at: NodeRef,
        mut node: IndexNode,
        idx: usize,
        overflow: Option<IndexEntry>,
    ) -> Result<Option<IndexEntry>, DiscError> {
        let mut idx = idx;
        if let Some(entry) = overflow {
            node.entries.insert(idx, entry);
            idx += 1;
        }
        if let Some(entry) = self.lift_child(ctx, tx, &mut node, idx)? {
            self.insert_ordered(&mut node, entry);
        }
        if let Some(entry) = self.populate_end(ctx, tx, &mut node)? {
            self.insert_ordered(&mut node, entry);
        }
        self.fit_node(ctx, tx, at, node)
    }

    fn remove_from(
        &mut self,
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        at: NodeRef,
        key: &[u8],
    ) -> Result<Removal, DiscError> {
        let mut node = self.get_node(ctx, at)?;
        let (idx, exact) = self.locate(&node, key);
        let child = node.entries[idx].child;

        if exact {
            let Some(child) = child else {
                node.entries.remove(idx);
                return Ok(Removal::Removed(self.fit_node(ctx, tx, at, node)?));
            };
            // Internal entry: take over the greatest key of the left subtree
            let (pred_key, pred_data) = self.largest_leaf_entry(ctx, child)?;
            let overflow = match self.remove_from(ctx, tx, NodeRef::Block(child), &pred_key)? {
                Removal::Removed(overflow) => overflow,
                Removal::Missing => {
                    return Err(DiscError::Corrupt(format!(
                        "Predecessor vanished from index '{}'",
                        self.name
                    )))
                }
            };
            node.entries[idx].key = pred_key;
            node.entries[idx].data = pred_data;
            return Ok(Removal::Removed(
                self.after_child_removal(ctx, tx, at, node, idx, overflow)?,
            ));
        }

        let Some(child) = child else {
            return Ok(Removal::Missing);
        };
        match self.remove_from(ctx, tx, NodeRef::Block(child), key)? {
            Removal::Missing => Ok(Removal::Missing),
            Removal::Removed(overflow) => Ok(Removal::Removed(
                self.after_child_removal(ctx, tx, at, node, idx, overflow)?,
            )),
        }
    }

    /// Remove the entry equal to `key`. Returns false when there is none.
    ///
    /// Nodes are never merged; emptied blocks are released and a root left
    /// with a single child takes that child back when it fits.
    pub fn remove(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction, key: &[u8]) -> Result<bool, DiscError> {
        match self.remove_from(ctx, tx, NodeRef::Root, key)? {
            Removal::Missing => Ok(false),
            Removal::Removed(_) => {
                while self.shrink_root(ctx, tx)? {}
                trace!("Removed key from '{}'", self.name);
                Ok(true)
            }
        }
    }

    /// Pull the only child of an otherwise empty root back into the root.
    pub fn shrink_root(&mut self, ctx: &mut NtfsContext, tx: &NtfsTransaction) -> Result<bool, DiscError> {
        if self.root.entries.len() != 1 {
            return Ok(false);
        }
        let Some(vcn) = self.root.entries[0].child else {
            return Ok(false);
        };
        let child = self.get_node(ctx, NodeRef::Block(vcn))?;
        if !self.root_fits(&child)? {
            return Ok(false);
        }
        self.put_node(ctx, tx, NodeRef::Root, child)?;
        self.free_block(ctx, tx, vcn)?;
        debug!("Shrunk root of '{}' by absorbing block {}", self.name, vcn);
        Ok(true)
    }

    /// Every entry in collation order.
    pub fn entries<'a>(&'a mut self, ctx: &'a mut NtfsContext) -> IndexEntries<'a> {
        IndexEntries::new(self, ctx, None)
    }

    /// Entries for which `query(key)` is `Equal`.
    ///
    /// `query` compares the sought value against a stored key and must
    /// agree with the index collation, which lets the scan skip subtrees.
    pub fn find_all<'a, Q>(&'a mut self, ctx: &'a mut NtfsContext, query: Q) -> IndexEntries<'a>
    where
        Q: Fn(&[u8]) -> Ordering + 'a,
    {
        IndexEntries::new(self, ctx, Some(Box::new(query)))
    }

    pub fn count(&mut self, ctx: &mut NtfsContext) -> Result<usize, DiscError> {
        self.entries(ctx).try_fold(0, |count, entry| entry.map(|_| count + 1))
    }

    /// Render the tree, one line per entry.
    pub fn dump(&mut self, ctx: &mut NtfsContext) -> Result<String, DiscError> {
        let mut out = String::new();
        let root = self.root.clone();
        self.dump_node(ctx, &root, "", "R", &mut out)?;
        Ok(out)
    }

    fn dump_node(
        &mut self,
        ctx: &mut NtfsContext,
        node: &IndexNode,
        prefix: &str,
        id: &str,
        out: &mut String,
    ) -> Result<(), DiscError> {
        let _ = writeln!(out, "{}{}:", prefix, id);
        for entry in &node.entries {
            if entry.is_end {
                let _ = writeln!(out, "{}      E", prefix);
            } else {
                let text = describe_entry(&self.name, self.collator.rule(), &entry.key, &entry.data);
                let _ = writeln!(out, "{}      {}", prefix, text);
            }
            if let Some(vcn) = entry.child {
                let child = self.load_block(ctx, vcn)?.node;
                self.dump_node(ctx, &child, &format!("{}        ", prefix), &format!(":i{}", vcn), out)?;
            }
        }
        Ok(())
    }
}

fn kind_for(indexed_type: u32) -> IndexKind {
    if indexed_type == ATTR_TYPE_FILE_NAME {
        IndexKind::FileName
    } else {
        IndexKind::View
    }
}

struct Frame {
    node: IndexNode,
    pos: usize,
    /// The current entry's subtree has been visited
    child_done: bool,
}

/// Lazy depth-first scan of an index.
pub struct IndexEntries<'a> {
    index: &'a mut Index,
    ctx: &'a mut NtfsContext,
    query: Option<Box<dyn Fn(&[u8]) -> Ordering + 'a>>,
    stack: Vec<Frame>,
    finished: bool,
}

impl<'a> IndexEntries<'a> {
    fn new(
        index: &'a mut Index,
        ctx: &'a mut NtfsContext,
        query: Option<Box<dyn Fn(&[u8]) -> Ordering + 'a>>,
    ) -> Self {
        let root = index.root.clone();
        Self {
            index,
            ctx,
            query,
            stack: vec![Frame {
                node: root,
                pos: 0,
                child_done: false,
            }],
            finished: false,
        }
    }
}

impl Iterator for IndexEntries<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), DiscError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            let frame = self.stack.last_mut()?;
            let Some(entry) = frame.node.entries.get(frame.pos) else {
                self.stack.pop();
                continue;
            };

            // (descend, emit, keep scanning)
            let (descend, emit, keep_going) = match (&self.query, entry.is_end) {
                (_, true) => (true, false, true),
                (None, false) => (true, true, true),
                (Some(query), false) => match query(&entry.key) {
                    Ordering::Equal => (true, true, true),
                    Ordering::Greater => (false, false, true),
                    Ordering::Less => (true, false, false),
                },
            };

            if descend && !frame.child_done {
                if let Some(vcn) = entry.child {
                    frame.child_done = true;
                    match self.index.load_block(self.ctx, vcn) {
                        Ok(block) => {
                            self.stack.push(Frame {
                                node: block.node,
                                pos: 0,
                                child_done: false,
                            });
                            continue;
                        }
                        Err(e) => {
                            self.finished = true;
                            return Some(Err(e));
                        }
                    }
                }
            }

            let item = emit.then(|| (entry.key.clone(), entry.data.clone()));
            frame.pos += 1;
            frame.child_done = false;
            if !keep_going {
                // Everything after this key sorts above the query
                self.finished = true;
            }
            if let Some(item) = item {
                return Some(Ok(item));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::codec::ByteCodec;
    use crate::ntfs::file_record::FileRecordReference;
    use crate::ntfs::structures::FileNameRecord;
    use crate::test_helpers::formatted_context;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn view_index(ctx: &mut NtfsContext, tx: &NtfsTransaction, rule: CollationRule) -> Index {
        let file = NtfsFile::create(ctx, tx, false).unwrap();
        Index::create(ctx, tx, file, "$T", 0, rule).unwrap()
    }

    fn key20(n: u32) -> Vec<u8> {
        let mut key = vec![0u8; 20];
        key[..4].copy_from_slice(&n.to_be_bytes());
        key[4..8].copy_from_slice(&n.to_le_bytes());
        key
    }

    fn keys_in_order(index: &mut Index, ctx: &mut NtfsContext) -> Vec<Vec<u8>> {
        index.entries(ctx).map(|e| e.unwrap().0).collect()
    }

    #[test]
    fn test_small_index_stays_in_root() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::UnsignedLong);
        for id in [5u32, 1, 3] {
            index.insert(&mut ctx, &tx, &id.to_le_bytes(), &[id as u8; 4]).unwrap();
        }
        assert!(index.root.is_leaf());
        assert!(index.file().attribute(ATTR_TYPE_INDEX_ALLOCATION, "$T").unwrap().is_none());
        assert_eq!(index.get(&mut ctx, &3u32.to_le_bytes()).unwrap(), vec![3u8; 4]);
        assert!(index.get(&mut ctx, &4u32.to_le_bytes()).unwrap_err().is_not_found());
        assert!(matches!(
            index.insert(&mut ctx, &tx, &5u32.to_le_bytes(), &[0u8; 4]),
            Err(DiscError::InvalidInput(_))
        ));

        let keys = keys_in_order(&mut index, &mut ctx);
        let ids: Vec<u32> = keys.iter().map(|k| u32::from_le_bytes([k[0], k[1], k[2], k[3]])).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn test_two_hundred_entries_split_into_blocks() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::Binary);
        let mut order: Vec<u32> = (0..200).collect();
        order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        for &n in &order {
            index.insert(&mut ctx, &tx, &key20(n), &(n as u64).to_le_bytes()).unwrap();
        }

        assert!(!index.root.is_leaf(), "root should point at blocks after 200 inserts");
        assert!(index.file().attribute(ATTR_TYPE_INDEX_ALLOCATION, "$T").unwrap().is_some());
        for n in 0..200u32 {
            assert_eq!(index.get(&mut ctx, &key20(n)).unwrap(), (n as u64).to_le_bytes().to_vec());
        }
        let keys = keys_in_order(&mut index, &mut ctx);
        assert_eq!(keys.len(), 200);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(index.count(&mut ctx).unwrap(), 200);
    }

    #[test]
    fn test_reopen_reads_blocks_from_disk() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::Binary);
        for n in 0..150u32 {
            index.insert(&mut ctx, &tx, &key20(n), &[1u8; 8]).unwrap();
        }
        let reference = index.file().reference();
        drop(index);

        let file = NtfsFile::load(&mut ctx, reference).unwrap();
        let mut index = Index::open(&mut ctx, file, "$T").unwrap();
        assert_eq!(index.count(&mut ctx).unwrap(), 150);
        assert!(index.contains_key(&mut ctx, &key20(149)).unwrap());
    }

    #[test]
    fn test_remove_everything_collapses_tree() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::Binary);
        let mut order: Vec<u32> = (0..200).collect();
        for &n in &order {
            index.insert(&mut ctx, &tx, &key20(n), &[7u8; 8]).unwrap();
        }
        order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(11));

        for (removed, &n) in order.iter().enumerate() {
            assert!(index.remove(&mut ctx, &tx, &key20(n)).unwrap());
            if removed % 40 == 0 {
                let keys = keys_in_order(&mut index, &mut ctx);
                assert_eq!(keys.len(), 200 - removed - 1);
                assert!(keys.windows(2).all(|w| w[0] < w[1]));
            }
        }
        assert!(!index.remove(&mut ctx, &tx, &key20(3)).unwrap());
        assert_eq!(index.count(&mut ctx).unwrap(), 0);
        assert!(index.root.is_leaf());

        let bitmap = index.load_bitmap(&mut ctx).unwrap();
        assert_eq!(bitmap.count_present(), 0);
    }

    #[test]
    fn test_find_all_with_prefix_query() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::SecurityHash);
        for hash in 0..60u32 {
            for id in 0..3u32 {
                let key = SecurityHashKey { hash, id: 0x100 + id }.to_bytes();
                index.insert(&mut ctx, &tx, &key, &[0u8; 20]).unwrap();
            }
        }

        let wanted = 41u32;
        let found: Vec<_> = index
            .find_all(&mut ctx, move |key| {
                let hash = u32::from_le_bytes([key[0], key[1], key[2], key[3]]);
                wanted.cmp(&hash)
            })
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(found.len(), 3);
        for (key, _) in &found {
            assert_eq!(&key[..4], &wanted.to_le_bytes());
        }

        let none: Vec<_> = index.find_all(&mut ctx, |_| Ordering::Less).collect();
        assert!(none.is_empty());
    }

    #[test]
    fn test_set_replaces_data() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::UnsignedLong);
        index.set(&mut ctx, &tx, &9u32.to_le_bytes(), &[1, 1]).unwrap();
        index.set(&mut ctx, &tx, &9u32.to_le_bytes(), &[2, 2, 2]).unwrap();
        assert_eq!(index.get(&mut ctx, &9u32.to_le_bytes()).unwrap(), vec![2, 2, 2]);
        assert_eq!(index.count(&mut ctx).unwrap(), 1);
    }

    #[test]
    fn test_directory_index_is_case_insensitive() {
        let (mut ctx, tx) = formatted_context();
        let dir = NtfsFile::create(&mut ctx, &tx, true).unwrap();
        let parent = dir.reference();
        let mut index = Index::create(&mut ctx, &tx, dir, "$I30", ATTR_TYPE_FILE_NAME, CollationRule::FileName).unwrap();
        assert_eq!(index.kind(), IndexKind::FileName);

        let target = FileRecordReference::new(40, 1);
        let key = FileNameRecord::new(parent, "Report.DOC", 0, 0).to_bytes();
        index.insert(&mut ctx, &tx, &key, &target.raw().to_le_bytes()).unwrap();
        let found = index
            .get(&mut ctx, &FileNameRecord::lookup_key("report.doc").to_bytes())
            .unwrap();
        assert_eq!(found, target.raw().to_le_bytes().to_vec());
        assert!(index.insert(&mut ctx, &tx, &key, &[0u8; 4]).is_err());

        let dump = index.dump(&mut ctx).unwrap();
        assert!(dump.contains("\"Report.DOC\""));
        assert!(dump.starts_with("R:"));
    }

    /// Id first, big-endian, so binary order follows the id; the tail varies the entry size.
    fn sized_key(id: u32, tail: usize) -> Vec<u8> {
        let mut key = id.to_be_bytes().to_vec();
        key.extend((0..tail).map(|i| (id as usize + i) as u8));
        key
    }

    #[test]
    fn test_random_insert_remove_keeps_every_key() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::Binary);
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let mut model: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        for step in 0..1500 {
            let id = rng.gen_range(0..400u32);
            match model.remove(&id) {
                Some(key) => {
                    assert!(index.remove(&mut ctx, &tx, &key).unwrap(), "step {}: remove {}", step, id);
                }
                None => {
                    // Long and short keys mixed, so a removal can swap a longer predecessor upwards
                    let key = sized_key(id, rng.gen_range(4..164));
                    index.insert(&mut ctx, &tx, &key, &id.to_le_bytes()).unwrap();
                    model.insert(id, key);
                }
            }
            if step % 100 == 99 {
                let expected: Vec<Vec<u8>> = model.values().cloned().collect();
                assert_eq!(keys_in_order(&mut index, &mut ctx), expected, "step {}", step);
            }
        }

        for (id, key) in &model {
            assert_eq!(index.get(&mut ctx, key).unwrap(), id.to_le_bytes().to_vec());
        }
        let reference = index.file().reference();
        drop(index);

        let file = NtfsFile::load(&mut ctx, reference).unwrap();
        let mut index = Index::open(&mut ctx, file, "$T").unwrap();
        let expected: Vec<Vec<u8>> = model.values().cloned().collect();
        assert_eq!(keys_in_order(&mut index, &mut ctx), expected);
    }

    #[test]
    fn test_removal_pushes_overflowing_root_down() {
        let (mut ctx, tx) = formatted_context();
        let mut index = view_index(&mut ctx, &tx, CollationRule::Binary);
        let mut keys = Vec::new();
        let mut id = 0u32;
        while id < 120 {
            let key = sized_key(id, if id % 3 == 0 { 160 } else { 4 });
            index.insert(&mut ctx, &tx, &key, &[0u8; 4]).unwrap();
            keys.push(key);
            id += 1;
        }
        assert!(!index.root.is_leaf());

        // Removing root separators pulls their predecessors, often longer, into the root
        for _ in 0..6 {
            let separators: Vec<Vec<u8>> = index
                .root
                .entries
                .iter()
                .filter(|e| !e.is_end)
                .map(|e| e.key.clone())
                .collect();
            for key in &separators {
                assert!(index.remove(&mut ctx, &tx, key).unwrap());
                keys.retain(|k| k != key);
            }
        }
        keys.sort();
        assert_eq!(keys_in_order(&mut index, &mut ctx), keys);
        for key in &keys {
            assert!(index.contains_key(&mut ctx, key).unwrap());
        }
    }
}
