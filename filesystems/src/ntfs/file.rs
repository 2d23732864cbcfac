// NTFS files
// A base FILE record plus any extension records, tied together by $ATTRIBUTE_LIST

use super::attribute_list::{AttributeList, AttributeListRecord};
use super::attributes::{
    AttributeRecord, ATTR_TYPE_ATTRIBUTE_LIST, ATTR_TYPE_FILE_NAME, ATTR_TYPE_STANDARD_INFORMATION,
};
use super::codec::ByteCodec;
use super::file_record::{FileRecord, FileRecordReference};
use super::structures::{FileNameRecord, StandardInformation, FILE_ATTRIBUTE_ARCHIVE, FILE_NAME_DOS};
use super::transaction::NtfsTransaction;
use super::volume::NtfsContext;
use discfs_core::DiscError;
use log::{debug, trace};

pub struct NtfsFile {
    base: FileRecord,
    extensions: Vec<FileRecord>,
    list: Option<AttributeList>,
}

impl NtfsFile {
    /// Load a file and every extension record its attribute list names.
    pub fn load(ctx: &mut NtfsContext, reference: FileRecordReference) -> Result<Self, DiscError> {
        let base = ctx.read_reference(reference)?;
        Self::from_base(ctx, base)
    }

    /// Load by MFT index alone, for metadata files whose sequence is known to be current.
    pub fn load_index(ctx: &mut NtfsContext, index: u64) -> Result<Self, DiscError> {
        let base = ctx.read_record(index)?;
        if !base.is_in_use() {
            return Err(DiscError::NotFound(format!("MFT record {} is not in use", index)));
        }
        Self::from_base(ctx, base)
    }

    fn from_base(ctx: &mut NtfsContext, base: FileRecord) -> Result<Self, DiscError> {
        if !base.is_base() {
            return Err(DiscError::InvalidInput(format!(
                "MFT record {} is an extension of {}",
                base.index, base.base_reference
            )));
        }

        let list = match base.find(ATTR_TYPE_ATTRIBUTE_LIST, "") {
            None => None,
            Some(attr) => {
                let value = attr
                    .value()
                    .ok_or_else(|| DiscError::UnsupportedFeature("Non-resident attribute list".to_string()))?;
                Some(AttributeList::from_bytes(value)?)
            }
        };

        let mut extensions = Vec::new();
        if let Some(list) = &list {
            for reference in list.referenced_records() {
                if reference.index() == base.index {
                    continue;
                }
                let record = ctx.read_reference(reference).map_err(|e| {
                    DiscError::Corrupt(format!(
                        "Attribute list of MFT record {} names unreadable {}: {}",
                        base.index, reference, e
                    ))
                })?;
                if record.base_reference != base.reference() {
                    return Err(DiscError::Corrupt(format!(
                        "Extension record {} belongs to {}, not {}",
                        record.index,
                        record.base_reference,
                        base.reference()
                    )));
                }
                extensions.push(record);
            }
        }

        trace!(
            "Loaded file {} with {} extension record(s)",
            base.reference(),
            extensions.len()
        );
        Ok(Self { base, extensions, list })
    }

    /// Allocate a new base record carrying only $STANDARD_INFORMATION.
    pub fn create(ctx: &mut NtfsContext, tx: &NtfsTransaction, directory: bool) -> Result<Self, DiscError> {
        let base = ctx.allocate_record()?;
        Ok(Self::with_base(base, tx, directory))
    }

    /// Like `create`, claiming a specific reserved record.
    pub fn create_at(
        ctx: &mut NtfsContext,
        tx: &NtfsTransaction,
        index: u64,
        directory: bool,
    ) -> Result<Self, DiscError> {
        let base = ctx.mft.allocate_specific(ctx.device.as_mut(), index)?;
        Ok(Self::with_base(base, tx, directory))
    }

    fn with_base(mut base: FileRecord, tx: &NtfsTransaction, directory: bool) -> Self {
        base.set_directory(directory);
        let info = StandardInformation::new(tx.filetime(), FILE_ATTRIBUTE_ARCHIVE);
        let mut attr = AttributeRecord::new_resident(ATTR_TYPE_STANDARD_INFORMATION, "", info.to_bytes());
        attr.id = base.allocate_attribute_id();
        base.insert_attribute(attr);
        debug!("Created {} {}", if directory { "directory" } else { "file" }, base.reference());
        Self {
            base,
            extensions: Vec::new(),
            list: None,
        }
    }

    pub fn reference(&self) -> FileRecordReference {
        self.base.reference()
    }

    pub fn base_record(&self) -> &FileRecord {
        &self.base
    }

    pub fn extension_records(&self) -> &[FileRecord] {
        &self.extensions
    }

    pub fn attribute_list(&self) -> Option<&AttributeList> {
        self.list.as_ref()
    }

    pub fn is_directory(&self) -> bool {
        self.base.is_directory()
    }

    fn records(&self) -> impl Iterator<Item = &FileRecord> + '_ {
        std::iter::once(&self.base).chain(self.extensions.iter())
    }

    /// Record index and attribute id of the first fragment of an attribute.
    fn locate(&self, attr_type: u32, name: &str) -> Option<(u64, u16)> {
        match &self.list {
            Some(list) => list
                .find_first(attr_type, name)
                .map(|entry| (entry.reference.index(), entry.attribute_id)),
            None => self.base.find(attr_type, name).map(|attr| (self.base.index, attr.id)),
        }
    }

    fn record_by_index(&self, index: u64) -> Result<&FileRecord, DiscError> {
        self.records().find(|r| r.index == index).ok_or_else(|| {
            DiscError::Corrupt(format!(
                "Attribute list of {} names MFT record {} which was not loaded",
                self.base.reference(),
                index
            ))
        })
    }

    fn record_by_index_mut(&mut self, index: u64) -> Result<&mut FileRecord, DiscError> {
        let base_reference = self.base.reference();
        if self.base.index == index {
            return Ok(&mut self.base);
        }
        self.extensions.iter_mut().find(|r| r.index == index).ok_or_else(|| {
            DiscError::Corrupt(format!(
                "Attribute list of {} names MFT record {} which was not loaded",
                base_reference, index
            ))
        })
    }

    /// Look an attribute up, through the attribute list when there is one.
    ///
    /// `Ok(None)` means the file has no such attribute; a list entry that
    /// cannot be resolved is corruption.
    pub fn attribute(&self, attr_type: u32, name: &str) -> Result<Option<&AttributeRecord>, DiscError> {
        let Some((index, id)) = self.locate(attr_type, name) else {
            return Ok(None);
        };
        let record = self.record_by_index(index)?;
        let position = record.position_by_id(id).ok_or_else(|| {
            DiscError::Corrupt(format!("MFT record {} lacks attribute id {}", index, id))
        })?;
        Ok(Some(&record.attributes()[position]))
    }

    pub fn attribute_mut(&mut self, attr_type: u32, name: &str) -> Result<Option<&mut AttributeRecord>, DiscError> {
        let Some((index, id)) = self.locate(attr_type, name) else {
            return Ok(None);
        };
        let record = self.record_by_index_mut(index)?;
        let position = record.position_by_id(id).ok_or_else(|| {
            DiscError::Corrupt(format!("MFT record {} lacks attribute id {}", index, id))
        })?;
        Ok(Some(&mut record.attributes_mut()[position]))
    }

    /// Like `attribute`, with absence reported as `NotFound`.
    pub fn require(&self, attr_type: u32, name: &str) -> Result<&AttributeRecord, DiscError> {
        self.attribute(attr_type, name)?
            .ok_or_else(|| DiscError::NotFound(format!("Attribute {:#x} '{}' in {}", attr_type, name, self.reference())))
    }

    pub fn require_mut(&mut self, attr_type: u32, name: &str) -> Result<&mut AttributeRecord, DiscError> {
        let reference = self.reference();
        self.attribute_mut(attr_type, name)?
            .ok_or_else(|| DiscError::NotFound(format!("Attribute {:#x} '{}' in {}", attr_type, name, reference)))
    }

    /// Every fragment of an attribute across all records, in VCN order.
    pub fn fragments(&self, attr_type: u32, name: &str) -> Vec<&AttributeRecord> {
        let mut fragments: Vec<&AttributeRecord> = self
            .records()
            .flat_map(|r| r.attributes().iter())
            .filter(|attr| attr.matches(attr_type, name))
            .collect();
        fragments.sort_by_key(|attr| attr.start_vcn());
        fragments
    }

    /// All attributes of the file, base record first.
    pub fn all_attributes(&self) -> impl Iterator<Item = &AttributeRecord> + '_ {
        self.records().flat_map(|r| r.attributes().iter())
    }

    /// Free bytes in the record holding the attribute.
    pub fn free_space_for(&self, attr_type: u32, name: &str) -> Result<usize, DiscError> {
        match self.locate(attr_type, name) {
            Some((index, _)) => Ok(self.record_by_index(index)?.free_space()),
            None => Ok(self.base.free_space()),
        }
    }

    /// Add an attribute, assigning it a file-wide unique id.
    pub fn add_attribute(&mut self, ctx: &mut NtfsContext, mut attr: AttributeRecord) -> Result<u16, DiscError> {
        if attr.size() > self.base.max_attribute_size() {
            return Err(DiscError::CapacityExceeded(format!(
                "Attribute {:#x} '{}' of {} bytes does not fit an empty FILE record",
                attr.attr_type,
                attr.name,
                attr.size()
            )));
        }
        attr.id = self.base.allocate_attribute_id();
        let id = attr.id;
        trace!(
            "Adding attribute {:#x} '{}' id {} to {}",
            attr.attr_type,
            attr.name,
            id,
            self.reference()
        );
        self.base.insert_attribute(attr);
        self.rebalance(ctx)?;
        Ok(id)
    }

    /// Remove every fragment of an attribute. Clusters are the caller's to free.
    pub fn remove_attribute(
        &mut self,
        ctx: &mut NtfsContext,
        attr_type: u32,
        name: &str,
    ) -> Result<Vec<AttributeRecord>, DiscError> {
        let mut removed = self.base.remove_attributes(attr_type, name);
        for record in &mut self.extensions {
            removed.extend(record.remove_attributes(attr_type, name));
        }
        if removed.is_empty() {
            return Err(DiscError::NotFound(format!(
                "Attribute {:#x} '{}' in {}",
                attr_type,
                name,
                self.reference()
            )));
        }
        self.rebalance(ctx)?;
        Ok(removed)
    }

    /// Rebuild the attribute list from what the records actually hold.
    fn sync_list(&mut self) {
        let Some(list) = &mut self.list else {
            return;
        };
        let mut rebuilt = AttributeList::new();
        for record in std::iter::once(&self.base).chain(self.extensions.iter()) {
            for attr in record.attributes() {
                if attr.attr_type != ATTR_TYPE_ATTRIBUTE_LIST {
                    rebuilt.insert(AttributeListRecord::from_attribute(attr, record.reference()));
                }
            }
        }
        *list = rebuilt;
        let bytes = list.to_bytes();
        if let Some(value) = self
            .base
            .find_mut(ATTR_TYPE_ATTRIBUTE_LIST, "")
            .and_then(|attr| attr.value_mut())
        {
            *value = bytes;
        }
    }

    /// Put an attribute in an extension record with room, allocating one if needed.
    fn place_in_extension(&mut self, ctx: &mut NtfsContext, attr: AttributeRecord) -> Result<(), DiscError> {
        let size = attr.size();
        if let Some(record) = self.extensions.iter_mut().find(|r| r.free_space() >= size) {
            trace!("Moving attribute id {} to extension record {}", attr.id, record.index);
            record.insert_attribute(attr);
            return Ok(());
        }

        let mut record = ctx.allocate_record()?;
        if size > record.max_attribute_size() {
            ctx.release_record(&mut record)?;
            return Err(DiscError::CapacityExceeded(format!(
                "Attribute of {} bytes does not fit an empty FILE record",
                size
            )));
        }
        record.base_reference = self.base.reference();
        debug!(
            "Spilling attribute id {} of {} into new extension record {}",
            attr.id,
            self.reference(),
            record.index
        );
        record.insert_attribute(attr);
        self.extensions.push(record);
        Ok(())
    }

    /// Restore the size invariant of every record.
    ///
    /// An overflowing base record gets an attribute list, then sheds its
    /// largest movable attributes into extension records. Emptied extension
    /// records are released and the list collapses once nothing lives
    /// outside the base record.
    pub fn rebalance(&mut self, ctx: &mut NtfsContext) -> Result<(), DiscError> {
        loop {
            self.sync_list();

            if self.base.used_size() > self.base.record_size() {
                if self.list.is_none() {
                    debug!("Creating attribute list for {}", self.reference());
                    let mut attr = AttributeRecord::new_resident(ATTR_TYPE_ATTRIBUTE_LIST, "", Vec::new());
                    attr.id = self.base.allocate_attribute_id();
                    self.base.insert_attribute(attr);
                    self.list = Some(AttributeList::new());
                    continue;
                }
                let position = self.base.largest_movable().ok_or_else(|| {
                    DiscError::CapacityExceeded(format!(
                        "Base record {} overflows with nothing left to move",
                        self.base.index
                    ))
                })?;
                let attr = self.base.take_attribute(position);
                self.place_in_extension(ctx, attr)?;
                continue;
            }

            let overflowing = self
                .extensions
                .iter()
                .position(|r| r.used_size() > r.record_size());
            if let Some(i) = overflowing {
                if self.extensions[i].attributes().len() < 2 {
                    return Err(DiscError::CapacityExceeded(format!(
                        "Extension record {} holds a single oversized attribute",
                        self.extensions[i].index
                    )));
                }
                let Some(position) = self.extensions[i].largest_movable() else {
                    return Err(DiscError::CapacityExceeded(format!(
                        "Extension record {} overflows",
                        self.extensions[i].index
                    )));
                };
                let attr = self.extensions[i].take_attribute(position);
                self.place_in_extension(ctx, attr)?;
                continue;
            }
            break;
        }

        let (empty, kept): (Vec<_>, Vec<_>) = self
            .extensions
            .drain(..)
            .partition(|r| r.attributes().is_empty());
        self.extensions = kept;
        for mut record in empty {
            debug!("Releasing empty extension record {}", record.index);
            ctx.release_record(&mut record)?;
        }

        if self.extensions.is_empty() && self.list.is_some() {
            debug!("Collapsing attribute list of {}", self.reference());
            self.base.remove_attributes(ATTR_TYPE_ATTRIBUTE_LIST, "");
            self.list = None;
        }
        self.sync_list();
        Ok(())
    }

    /// Rebalance and write every record back.
    pub fn save(&mut self, ctx: &mut NtfsContext) -> Result<(), DiscError> {
        self.rebalance(ctx)?;
        for record in &mut self.extensions {
            ctx.write_record(record)?;
        }
        ctx.write_record(&mut self.base)
    }

    pub fn standard_information(&self) -> Result<StandardInformation, DiscError> {
        let attr = self.require(ATTR_TYPE_STANDARD_INFORMATION, "")?;
        let value = attr
            .value()
            .ok_or_else(|| DiscError::Corrupt("Non-resident $STANDARD_INFORMATION".to_string()))?;
        Ok(StandardInformation::read_from(value)?.0)
    }

    pub fn set_standard_information(&mut self, info: &StandardInformation) -> Result<(), DiscError> {
        let value = self
            .require_mut(ATTR_TYPE_STANDARD_INFORMATION, "")?
            .value_mut()
            .ok_or_else(|| DiscError::Corrupt("Non-resident $STANDARD_INFORMATION".to_string()))?;
        *value = info.to_bytes();
        Ok(())
    }

    /// Stamp the modification times with the transaction time.
    pub fn touch(&mut self, tx: &NtfsTransaction) -> Result<(), DiscError> {
        let mut info = self.standard_information()?;
        info.times.touch(tx.filetime());
        self.set_standard_information(&info)
    }

    /// The long name of the file, skipping DOS 8.3 aliases.
    pub fn file_name(&self) -> Result<Option<FileNameRecord>, DiscError> {
        for attr in self.all_attributes().filter(|a| a.attr_type == ATTR_TYPE_FILE_NAME) {
            let Some(value) = attr.value() else {
                continue;
            };
            let (name, _) = FileNameRecord::read_from(value)?;
            if name.namespace != FILE_NAME_DOS {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Add a hard link name. The directory index entry is the caller's to insert.
    pub fn add_file_name(&mut self, ctx: &mut NtfsContext, name: &FileNameRecord) -> Result<(), DiscError> {
        let attr = AttributeRecord::new_resident(ATTR_TYPE_FILE_NAME, "", name.to_bytes()).indexed();
        self.add_attribute(ctx, attr)?;
        self.base.hard_links += 1;
        Ok(())
    }

    /// Release every cluster and record the file owns.
    pub fn delete(mut self, ctx: &mut NtfsContext) -> Result<(), DiscError> {
        let reference = self.reference();
        let runs: Vec<_> = self.all_attributes().flat_map(AttributeRecord::get_clusters).collect();
        ctx.free_clusters(&runs)?;
        for record in &mut self.extensions {
            ctx.release_record(record)?;
        }
        ctx.release_record(&mut self.base)?;
        debug!("Deleted {}", reference);
        Ok(())
    }

    pub fn dump(&self) -> String {
        let mut out = self.base.dump();
        if let Some(list) = &self.list {
            out.push_str(&list.dump());
        }
        for record in &self.extensions {
            out.push_str(&record.dump());
        }
        out
    }
}
