//! Contiguous mapped regions and the cells decoded inside them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Address, Cell, DisassemblyError, Offset};

/// Access rights of a mapped area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Access {
    pub const READ: Access = Access { read: true, write: false, execute: false };
    pub const READ_WRITE: Access = Access { read: true, write: true, execute: false };
    pub const READ_EXECUTE: Access = Access { read: true, write: false, execute: true };
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}

/// A named region of bytes starting at `base`, with the sparse map of the
/// cells decoded inside it.
///
/// Cells never overlap: a cell at offset `o` of length `n` is the only cell
/// intersecting `[o, o + n)`.
#[derive(Debug, Clone)]
pub struct MemoryArea {
    name: String,
    base: Address,
    access: Access,
    bytes: Vec<u8>,
    cells: BTreeMap<Offset, Cell>,
}

impl MemoryArea {
    /// An empty area whose first byte lives at `base`.
    pub fn new(name: impl Into<String>, base: Address, access: Access) -> Self {
        Self {
            name: name.into(),
            base,
            access,
            bytes: Vec::new(),
            cells: BTreeMap::new(),
        }
    }

    /// Shortcut for `new` followed by `map_bytes` at the base.
    ///
    /// Fails with `OutOfBounds` when the bytes would run past the top of the
    /// address space.
    pub fn with_bytes(
        name: impl Into<String>,
        base: Address,
        access: Access,
        bytes: Vec<u8>,
    ) -> Result<Self, DisassemblyError> {
        if base.offset().checked_add(bytes.len() as Offset).is_none() {
            return Err(DisassemblyError::OutOfBounds { address: base, length: bytes.len() });
        }
        let mut area = Self::new(name, base, access);
        area.bytes = bytes;
        Ok(area)
    }

    /// Copy `bytes` into the backing store at native `offset`, growing the
    /// store (zero filled) when the range goes past its current end.
    pub fn map_bytes(&mut self, offset: Offset, bytes: &[u8]) -> Result<(), DisassemblyError> {
        let address = self.make_address(offset);
        let start = offset
            .checked_sub(self.base.offset())
            .ok_or(DisassemblyError::OutOfBounds { address, length: bytes.len() })? as usize;
        let end = start
            .checked_add(bytes.len())
            .ok_or(DisassemblyError::OutOfBounds { address, length: bytes.len() })?;
        if self.base.offset().checked_add(end as u64).is_none() {
            return Err(DisassemblyError::OutOfBounds { address, length: bytes.len() });
        }
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_executable(&self) -> bool {
        self.access.execute
    }

    /// Address of the first mapped byte.
    pub fn start(&self) -> Address {
        self.base
    }

    /// Native offset one past the last mapped byte.
    pub fn end_offset(&self) -> Offset {
        self.base.offset() + self.bytes.len() as Offset
    }

    /// Number of mapped bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Raw backing store.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Build an address bound to this area's addressing scheme.
    pub fn make_address(&self, offset: Offset) -> Address {
        self.base.with_offset(offset)
    }

    /// Whether `address` falls inside the mapped range.
    pub fn contains(&self, address: &Address) -> bool {
        address.same_space(&self.base)
            && address.offset() >= self.base.offset()
            && address.offset() < self.end_offset()
    }

    /// Whether two areas share at least one address.
    pub fn intersects(&self, other: &MemoryArea) -> bool {
        self.base.same_space(&other.base)
            && self.base.offset() < other.end_offset()
            && other.base.offset() < self.end_offset()
    }

    fn index_of(&self, address: &Address, length: usize) -> Result<usize, DisassemblyError> {
        if !self.contains(address) {
            return Err(DisassemblyError::OutOfBounds { address: *address, length });
        }
        let start = (address.offset() - self.base.offset()) as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.bytes.len() => Ok(start),
            _ => Err(DisassemblyError::OutOfBounds { address: *address, length }),
        }
    }

    /// Read exactly `length` bytes at `address`.
    pub fn read_bytes(&self, address: &Address, length: usize) -> Result<&[u8], DisassemblyError> {
        let start = self.index_of(address, length)?;
        Ok(&self.bytes[start..start + length])
    }

    /// Read at most `length` bytes at `address`, stopping at the end of the area.
    pub fn read_available(&self, address: &Address, length: usize) -> Result<&[u8], DisassemblyError> {
        let start = self.index_of(address, 1)?;
        let end = start.saturating_add(length).min(self.bytes.len());
        Ok(&self.bytes[start..end])
    }

    /// Cell starting exactly at `offset`.
    pub fn cell_at(&self, offset: Offset) -> Option<&Cell> {
        self.cells.get(&offset)
    }

    pub(crate) fn cell_at_mut(&mut self, offset: Offset) -> Option<&mut Cell> {
        self.cells.get_mut(&offset)
    }

    /// Cell whose span covers `offset`, with its start offset.
    pub fn cell_covering(&self, offset: Offset) -> Option<(Offset, &Cell)> {
        let (&start, cell) = self.cells.range(..=offset).next_back()?;
        if offset - start < cell.length() as Offset {
            Some((start, cell))
        } else {
            None
        }
    }

    /// Start offsets of every cell intersecting `[offset, offset + length)`.
    pub fn overlapping(&self, offset: Offset, length: usize) -> Vec<Offset> {
        let end = offset.saturating_add(length as Offset);
        let mut result = Vec::new();
        if let Some((start, _)) = self.cell_covering(offset) {
            if start < offset {
                result.push(start);
            }
        }
        result.extend(self.cells.range(offset..end).map(|(&start, _)| start));
        result
    }

    /// Insert `cell` at `offset`, replacing the cell starting there if any.
    ///
    /// Fails with `Overlap` when the span intersects any other cell; the area is
    /// left unchanged on error.
    pub fn set_cell(&mut self, offset: Offset, cell: Cell) -> Result<Option<Cell>, DisassemblyError> {
        let address = self.make_address(offset);
        self.index_of(&address, cell.length())?;
        if let Some(&existing) = self
            .overlapping(offset, cell.length())
            .iter()
            .find(|&&start| start != offset)
        {
            return Err(DisassemblyError::Overlap {
                address,
                length: cell.length(),
                existing: self.make_address(existing),
            });
        }
        Ok(self.cells.insert(offset, cell))
    }

    /// Insert `cell` at `offset`, removing every cell it overlaps.
    pub fn force_cell(&mut self, offset: Offset, cell: Cell) -> Result<Vec<(Offset, Cell)>, DisassemblyError> {
        let address = self.make_address(offset);
        self.index_of(&address, cell.length())?;
        let removed = self
            .overlapping(offset, cell.length())
            .into_iter()
            .filter_map(|start| self.cells.remove(&start).map(|old| (start, old)))
            .collect();
        self.cells.insert(offset, cell);
        Ok(removed)
    }

    pub fn remove_cell(&mut self, offset: Offset) -> Option<Cell> {
        self.cells.remove(&offset)
    }

    /// Populated cells in address order. Each call starts a fresh pass.
    pub fn iter_cells(&self) -> impl Iterator<Item = (Address, &Cell)> + '_ {
        self.cells.iter().map(move |(&offset, cell)| (self.make_address(offset), cell))
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}..{} ({} bytes)",
            self.name,
            self.access,
            self.base,
            self.make_address(self.end_offset()),
            self.bytes.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> MemoryArea {
        MemoryArea::with_bytes("code", Address::flat(0x100, 16), Access::READ_EXECUTE, (0u8..16).collect()).unwrap()
    }

    fn raw(n: usize) -> Cell {
        Cell::value(&vec![0; n], &Address::flat(0, 16)).unwrap()
    }

    #[test]
    fn test_read_bounds() {
        let area = area();
        let at = area.make_address(0x10e);
        assert_eq!(area.read_bytes(&at, 2).unwrap(), &[14, 15]);
        assert!(matches!(area.read_bytes(&at, 3), Err(DisassemblyError::OutOfBounds { .. })));
        assert!(area.read_bytes(&area.make_address(0xff), 1).is_err());
        assert_eq!(area.read_available(&at, 16).unwrap().len(), 2);
    }

    #[test]
    fn test_map_bytes_grows() {
        let mut area = MemoryArea::new("data", Address::flat(0x20, 16), Access::READ);
        area.map_bytes(0x24, b"AB").unwrap();
        assert_eq!(area.size(), 6);
        assert_eq!(area.bytes(), &[0, 0, 0, 0, b'A', b'B']);
        assert!(area.map_bytes(0x10, b"x").is_err());
    }

    #[test]
    fn test_with_bytes_rejects_wrapping_range() {
        let top = Address::flat(u64::MAX - 10, 64);
        let err = MemoryArea::with_bytes("high", top, Access::READ, vec![0; 123]).unwrap_err();
        assert!(matches!(err, DisassemblyError::OutOfBounds { length: 123, .. }));

        let area = MemoryArea::with_bytes("high", top, Access::READ, vec![0; 10]).unwrap();
        assert_eq!(area.end_offset(), u64::MAX - 1);
        assert!(area.contains(&top));
    }

    #[test]
    fn test_set_cell_overlap_leaves_area_unchanged() {
        let mut area = area();
        area.set_cell(0x100, raw(4)).unwrap();
        area.set_cell(0x104, raw(2)).unwrap();

        let err = area.set_cell(0x102, raw(1)).unwrap_err();
        assert!(matches!(err, DisassemblyError::Overlap { .. }));
        let err = area.set_cell(0x100, raw(5)).unwrap_err();
        assert!(matches!(err, DisassemblyError::Overlap { .. }));

        assert_eq!(area.cell_count(), 2);
        assert_eq!(area.cell_at(0x100).unwrap().length(), 4);
    }

    #[test]
    fn test_set_cell_replaces_same_offset() {
        let mut area = area();
        area.set_cell(0x100, raw(4)).unwrap();
        let old = area.set_cell(0x100, raw(2)).unwrap();
        assert_eq!(old.unwrap().length(), 4);
        assert_eq!(area.cell_at(0x100).unwrap().length(), 2);
    }

    #[test]
    fn test_set_cell_out_of_bounds() {
        let mut area = area();
        assert!(matches!(area.set_cell(0x10f, raw(2)), Err(DisassemblyError::OutOfBounds { .. })));
    }

    #[test]
    fn test_force_cell() {
        let mut area = area();
        area.set_cell(0x100, raw(1)).unwrap();
        area.set_cell(0x101, raw(1)).unwrap();
        area.set_cell(0x104, raw(1)).unwrap();
        let removed = area.force_cell(0x100, raw(3)).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(area.cell_count(), 2);
        assert!(area.cell_covering(0x102).is_some());
        assert!(area.cell_covering(0x103).is_none());
    }

    #[test]
    fn test_iterate_in_order() {
        let mut area = area();
        area.set_cell(0x108, raw(1)).unwrap();
        area.set_cell(0x100, raw(2)).unwrap();
        let offsets: Vec<_> = area.iter_cells().map(|(a, _)| a.offset()).collect();
        assert_eq!(offsets, vec![0x100, 0x108]);
        // restartable
        assert_eq!(area.iter_cells().count(), 2);
    }
}
