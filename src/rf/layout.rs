//! Address layout of the RF reader fields
//!
//! The registry blocks are expanded into a flat list of entries, each bound
//! to a contiguous address range. All regions share one linear address space:
//! an entry occupies its range in the bank of its own region and the same
//! addresses stay unused in the other banks.

use log::{debug, trace};

use crate::error::{ModbusError, ModbusResult};
use crate::field::{Field, FieldProperties, ResumeCursor};
use crate::processor::MAX_MAPPING_SIZE;
use crate::rf::constants::{Quantity, Repeat, RfFieldType, FIELD_BLOCKS};

/// Values of the size-determining runtime configuration fields
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutParams {
    pub tags_in_field: u16,
    pub memory_selector: i16,
    pub epc_length: u16,
    pub tid_length: u16,
    pub user_length: u16,
    pub selection_mask_count: u16,
    pub selection_mask_max_length: u16,
    pub custom_command_max_length: u16,
}

impl LayoutParams {
    fn repeat_count(&self, repeat: Repeat) -> u16 {
        match repeat {
            Repeat::Once => 1,
            Repeat::PerSelectionMask => self.selection_mask_count,
            Repeat::PerTag => self.tags_in_field,
        }
    }

    /// Address quantity of a field, 0 when the memory selector disables it
    pub fn address_quantity(&self, field: RfFieldType) -> u16 {
        let descriptor = field.descriptor();
        if let Some(bit) = descriptor.selector_bit {
            if self.memory_selector & bit != bit {
                return 0;
            }
        }
        match descriptor.quantity {
            Quantity::Fixed(quantity) => quantity,
            Quantity::SizedBy(RfFieldType::SelectionMaskMaxLength) => self.selection_mask_max_length,
            Quantity::SizedBy(RfFieldType::EpcLength) => self.epc_length,
            Quantity::SizedBy(RfFieldType::TidLength) => self.tid_length,
            Quantity::SizedBy(RfFieldType::UserLength) => self.user_length,
            Quantity::SizedBy(RfFieldType::CustomCommandMaxLength) => self.custom_command_max_length,
            Quantity::SizedBy(_) => 0,
        }
    }

    /// Size of the address space these values lay out
    ///
    /// Fails with an invalid data error when it exceeds [`MAX_MAPPING_SIZE`].
    pub fn address_space_size(&self) -> ModbusResult<u32> {
        let total = FIELD_BLOCKS.iter().try_fold(0u64, |total, block| {
            let block_size: u64 = block
                .fields
                .iter()
                .map(|field| self.address_quantity(*field) as u64)
                .sum();
            block_size
                .checked_mul(self.repeat_count(block.repeat) as u64)
                .and_then(|size| total.checked_add(size))
        });
        match total {
            Some(total) if total <= MAX_MAPPING_SIZE as u64 => Ok(total as u32),
            Some(total) => Err(ModbusError::invalid_data(format!(
                "Address space of {} exceeds {}",
                total, MAX_MAPPING_SIZE
            ))),
            None => Err(ModbusError::invalid_data("Address space size overflows")),
        }
    }
}

/// One laid out occurrence of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub field: RfFieldType,
    pub address: u32,
    pub address_quantity: u16,
    pub group_index: u16,
}

/// Expanded address layout
#[derive(Debug, Clone, Default)]
pub struct FieldLayout {
    entries: Vec<LayoutEntry>,
    version: u64,
    total: u32,
}

impl FieldLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lay out all fields for the given configuration
    ///
    /// Repeated blocks are emitted as a whole once per occurrence; the group
    /// index of an entry is its occurrence number. Fields with an address
    /// quantity of 0 are left out. Every call starts a new layout version.
    /// A configuration that does not fit a mapping is rejected and leaves the
    /// layout unchanged.
    pub fn expand(&mut self, params: &LayoutParams) -> ModbusResult<()> {
        params.address_space_size()?;
        let mut entries = Vec::new();
        let mut address: u32 = 0;
        for block in FIELD_BLOCKS.iter() {
            for group_index in 0..params.repeat_count(block.repeat) {
                for field in block.fields.iter().copied() {
                    let address_quantity = params.address_quantity(field);
                    if address_quantity == 0 {
                        continue;
                    }
                    trace!("{} -> {}[{}]", address, field, group_index);
                    entries.push(LayoutEntry { field, address, address_quantity, group_index });
                    address += address_quantity as u32;
                }
            }
        }
        self.entries = entries;
        self.total = address;
        self.version += 1;
        debug!(
            "Expanded {} fields into {} address units (layout version {})",
            self.entries.len(),
            self.total,
            self.version
        );
        Ok(())
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Size of the address space
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Find the first entry matching `field` or containing `address`
    ///
    /// The scan starts at the entry `start` was resolved to, or at the first
    /// entry. A lookup by address alone is a start address: the returned field
    /// carries the offset of `address` within the entry. A lookup by address
    /// with `start` is an end address: the returned field carries the length
    /// from the start offset (same entry) or from 0 (later entry). When nothing
    /// matches, the result has no field and its address is the total size.
    pub fn resolve(
        &self,
        start: Option<&FieldProperties>,
        address: Option<u32>,
        field: Option<&Field>,
    ) -> ModbusResult<FieldProperties> {
        let start_index = match start {
            Some(props) => {
                let cursor = props.cursor;
                if cursor.layout_version() != self.version {
                    return Err(ModbusError::stale_cursor(cursor.layout_version(), self.version));
                }
                cursor.scan_index()
            }
            None => 0,
        };
        let start_field = start.and_then(|props| props.field);

        for (i, entry) in self.entries.iter().enumerate().skip(start_index) {
            let field_matches = field.map_or(false, |f| f.id() == entry.field.id());
            let address_matches = address.map_or(false, |a| {
                a >= entry.address && a - entry.address < entry.address_quantity as u32
            });
            if !field_matches && !address_matches {
                continue;
            }

            let mut current = entry.field.field();
            if let Some(selected) = address {
                let (offset, length) = match start_field {
                    Some(start_field) => {
                        let length_from_zero = (selected - entry.address + 1) as u16;
                        let offset = if i == start_index && start_field.id() == entry.field.id() {
                            start_field.offset()
                        } else {
                            0
                        };
                        (offset, length_from_zero.saturating_sub(offset))
                    }
                    None => ((selected - entry.address) as u16, 0),
                };
                current = current.with_span(offset, length);
                debug!("Found {} -> {}", selected, current);
            } else {
                debug!("Found {} -> {}", entry.field, entry.address);
            }

            let scanned_fields = self.scanned(start_index, i + 1, start_field, Some(current));
            let descriptor = entry.field.descriptor();
            return Ok(FieldProperties {
                field: Some(current),
                address: entry.address,
                address_quantity: entry.address_quantity,
                region: Some(descriptor.region),
                data_type: Some(descriptor.data_type),
                group_index: entry.group_index,
                durable: descriptor.durable,
                scanned_fields,
                cursor: ResumeCursor::new(self.version, i),
            });
        }

        Ok(FieldProperties {
            field: None,
            address: self.total,
            address_quantity: 0,
            region: None,
            data_type: None,
            group_index: 0,
            durable: false,
            scanned_fields: self.scanned(start_index, self.entries.len(), start_field, None),
            cursor: ResumeCursor::new(self.version, self.entries.len()),
        })
    }

    /// Fields of the entries in `[from, to)`, the first and last carrying the
    /// spans of the start and current lookups
    fn scanned(&self, from: usize, to: usize, start: Option<Field>, current: Option<Field>) -> Vec<Field> {
        let to = to.max(from);
        self.entries[from.min(self.entries.len())..to.min(self.entries.len())]
            .iter()
            .enumerate()
            .map(|(n, entry)| {
                let i = from + n;
                match (current, start) {
                    (Some(current), _) if i + 1 == to => current,
                    (_, Some(start)) if i == from && start.id() == entry.field.id() => start,
                    _ => entry.field.field(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{DataType, Region};
    use crate::rf::constants::{MEMORY_SELECTOR_CRC, MEMORY_SELECTOR_PC};

    fn params() -> LayoutParams {
        LayoutParams {
            tags_in_field: 0,
            memory_selector: 0,
            epc_length: 6,
            tid_length: 0,
            user_length: 4,
            selection_mask_count: 0,
            selection_mask_max_length: 4,
            custom_command_max_length: 0,
        }
    }

    /// Size of the single-occurrence block
    const BASE_TOTAL: u32 = 128 * 3 + 4 + 1 + 3 + 1 + 1 + 1 + 1 + 1 + 1 + 8 + 1 + 1 + 2 + 1;

    #[test]
    fn test_expand_without_groups() {
        let mut layout = FieldLayout::new();
        layout.expand(&params()).unwrap();
        assert_eq!(layout.entries().len(), 24);
        assert_eq!(layout.total(), BASE_TOTAL);
        assert_eq!(layout.version(), 1);

        let first = layout.entries()[0];
        assert_eq!((first.field, first.address, first.address_quantity), (RfFieldType::VendorName, 0, 128));
        let serial = layout.entries()[3];
        assert_eq!((serial.field, serial.address), (RfFieldType::SerialNumber, 384));
    }

    #[test]
    fn test_expand_groups_and_selector() {
        let mut layout = FieldLayout::new();
        let mut p = params();
        p.tags_in_field = 2;
        p.memory_selector = MEMORY_SELECTOR_CRC | MEMORY_SELECTOR_PC;
        p.selection_mask_count = 3;
        layout.expand(&p).unwrap();

        let masks: Vec<_> = layout.entries().iter().filter(|e| e.field == RfFieldType::SelectionMaskBank).collect();
        assert_eq!(masks.iter().map(|e| e.group_index).collect::<Vec<_>>(), vec![0, 1, 2]);

        let tag_block: Vec<_> = layout.entries().iter().skip(24 + 3 * 4).map(|e| (e.field, e.group_index)).collect();
        // custom command data has no room, the remaining per-tag fields repeat per tag
        assert_eq!(tag_block, vec![
            (RfFieldType::LockOperation, 0), (RfFieldType::KillOperation, 0),
            (RfFieldType::Crc, 0), (RfFieldType::Pc, 0),
            (RfFieldType::Epc, 0), (RfFieldType::UserBank, 0), (RfFieldType::CustomCommandLength, 0),
            (RfFieldType::LockOperation, 1), (RfFieldType::KillOperation, 1),
            (RfFieldType::Crc, 1), (RfFieldType::Pc, 1),
            (RfFieldType::Epc, 1), (RfFieldType::UserBank, 1), (RfFieldType::CustomCommandLength, 1),
        ]);
        let per_tag = 1 + 2 + 1 + 1 + 6 + 4 + 1;
        let per_mask = 1 + 1 + 1 + 4;
        assert_eq!(layout.total(), BASE_TOTAL + 3 * per_mask + 2 * per_tag);
    }

    #[test]
    fn test_expand_is_deterministic() {
        let mut p = params();
        p.tags_in_field = 5;
        p.memory_selector = 31;
        let mut a = FieldLayout::new();
        let mut b = FieldLayout::new();
        a.expand(&p).unwrap();
        b.expand(&p).unwrap();
        assert_eq!(a.entries(), b.entries());
        assert_eq!(a.total(), b.total());
    }

    #[test]
    fn test_resolve_every_address() {
        let mut layout = FieldLayout::new();
        let mut p = params();
        p.tags_in_field = 3;
        p.memory_selector = 31;
        p.selection_mask_count = 2;
        layout.expand(&p).unwrap();

        for address in 0..layout.total() {
            let props = layout.resolve(None, Some(address), None).unwrap();
            assert!(props.address <= address && address < props.end_address(), "address {}", address);
            assert_eq!(props.field.map(|f| f.offset() as u32), Some(address - props.address));
        }
        let sentinel = layout.resolve(None, Some(layout.total()), None).unwrap();
        assert!(sentinel.is_empty());
        assert_eq!(sentinel.address, layout.total());
        assert_eq!(sentinel.scanned_fields.len(), layout.entries().len());
    }

    #[test]
    fn test_resolve_by_field() {
        let mut layout = FieldLayout::new();
        layout.expand(&params()).unwrap();
        let props = layout.resolve(None, None, Some(&RfFieldType::TagCount.field())).unwrap();
        assert_eq!(props.region, Some(Region::InputRegisters));
        assert_eq!(props.data_type, Some(DataType::UShort));
        assert_eq!(props.field.and_then(|f| f.span()), None);
        assert_eq!(props.scanned_fields.len(), 21);

        let missing = layout.resolve(None, None, Some(&RfFieldType::Epc.field())).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_end_address_spans() {
        let mut layout = FieldLayout::new();
        layout.expand(&params()).unwrap();
        let vendor = layout.resolve(None, Some(10), None).unwrap();
        assert_eq!(vendor.field.map(|f| (f.offset(), f.length())), Some((10, 0)));

        // same field
        let end = layout.resolve(Some(&vendor), Some(19), None).unwrap();
        assert_eq!(end.field.map(|f| (f.offset(), f.length())), Some((10, 10)));
        assert_eq!(end.scanned_fields.len(), 1);

        // into the next field
        let end = layout.resolve(Some(&vendor), Some(130), None).unwrap();
        assert_eq!(end.field.map(|f| (f.id(), f.offset(), f.length())), Some((1, 0, 3)));
        let spans: Vec<_> = end.scanned_fields.iter().map(|f| (f.id(), f.offset(), f.length())).collect();
        assert_eq!(spans, vec![(0, 10, 0), (1, 0, 3)]);
    }

    #[test]
    fn test_stale_cursor_is_rejected() {
        let mut layout = FieldLayout::new();
        layout.expand(&params()).unwrap();
        let start = layout.resolve(None, Some(0), None).unwrap();
        layout.expand(&params()).unwrap();
        match layout.resolve(Some(&start), Some(1), None) {
            Err(ModbusError::StaleCursor { cursor_version: 1, layout_version: 2 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_layout_is_rejected() {
        let mut layout = FieldLayout::new();
        layout.expand(&params()).unwrap();
        let entries = layout.entries().to_vec();

        let mut p = params();
        p.tags_in_field = u16::MAX;
        p.epc_length = u16::MAX;
        p.memory_selector = 31;
        assert!(matches!(p.address_space_size(), Err(ModbusError::InvalidData { .. })));
        assert!(layout.expand(&p).is_err());
        assert_eq!(layout.entries(), &entries[..]);
        assert_eq!(layout.version(), 1);

        // one tag of the largest EPC still overflows the mapping
        p.tags_in_field = 1;
        assert!(layout.expand(&p).is_err());
        p.epc_length = 64;
        layout.expand(&p).unwrap();
        assert_eq!(layout.total(), p.address_space_size().unwrap());
        assert_eq!(layout.version(), 2);
    }

    #[test]
    fn test_largest_layout_fits() {
        let mut p = params();
        p.user_length = 0;
        p.selection_mask_max_length = 0;
        p.tags_in_field = 1;
        p.epc_length = 0;
        let base = p.address_space_size().unwrap();
        p.epc_length = (MAX_MAPPING_SIZE - base) as u16;
        assert_eq!(p.address_space_size().unwrap(), MAX_MAPPING_SIZE);

        let mut layout = FieldLayout::new();
        layout.expand(&p).unwrap();
        let last = layout.resolve(None, Some(MAX_MAPPING_SIZE - 1), None).unwrap();
        assert!(last.field.is_some());
        assert!(layout.resolve(None, Some(MAX_MAPPING_SIZE), None).unwrap().is_empty());
    }
}
