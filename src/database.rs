//! The disassembly database.
//!
//! [`Database`] owns every [`MemoryArea`], the label table, the cross-reference
//! index and the event channel. All writes go through it so that the three
//! stay consistent:
//!
//! * display names are unique across the whole database,
//! * references never point from or to a destroyed cell,
//! * cells never overlap.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::event::{EventHandler, EventScope, UpdatedCells};
use crate::{Address, Cell, DisassemblyError, Label, LabelKind, MemoryArea, Offset, XRefs};

/// Highest version the collision resolver will try before giving up.
pub const MAX_LABEL_VERSION: u32 = 0xffff;

/// Areas, labels, cross-references and the event channel of one session.
#[derive(Default)]
pub struct Database {
    areas: Vec<MemoryArea>,
    labels: BTreeMap<Address, Label>,
    names: HashMap<String, Address>,
    xrefs: XRefs,
    handler: Option<Box<dyn EventHandler>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("areas", &self.areas)
            .field("labels", &self.labels)
            .field("xrefs", &self.xrefs)
            .field("handling_events", &self.handler.is_some())
            .finish()
    }
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /*───────────────────────────  memory areas  ───────────────────────────*/

    /// Add a mapped area. Areas may not share addresses.
    pub fn add_memory_area(&mut self, area: MemoryArea) -> Result<(), DisassemblyError> {
        if let Some(other) = self.areas.iter().find(|other| other.intersects(&area)) {
            return Err(DisassemblyError::Overlap {
                address: area.start(),
                length: area.size(),
                existing: other.start(),
            });
        }
        let position = self.areas.partition_point(|other| other.start() < area.start());
        log::debug!("mapped area {}", area);
        self.areas.insert(position, area);
        Ok(())
    }

    /// Areas ordered by start address.
    pub fn memory_areas(&self) -> impl Iterator<Item = &MemoryArea> + '_ {
        self.areas.iter()
    }

    /// Area containing `address`.
    pub fn memory_area(&self, address: &Address) -> Option<&MemoryArea> {
        self.areas.iter().find(|area| area.contains(address))
    }

    fn area_index(&self, address: &Address, length: usize) -> Result<usize, DisassemblyError> {
        self.areas
            .iter()
            .position(|area| area.contains(address))
            .ok_or(DisassemblyError::OutOfBounds { address: *address, length })
    }

    /// Address of native `offset` in the first area that maps it.
    pub fn make_address(&self, offset: Offset) -> Option<Address> {
        self.areas
            .iter()
            .map(|area| area.make_address(offset))
            .find(|address| self.memory_area(address).is_some())
    }

    pub fn read_bytes(&self, address: &Address, length: usize) -> Result<&[u8], DisassemblyError> {
        let index = self.area_index(address, length)?;
        self.areas[index].read_bytes(address, length)
    }

    /// Up to `length` bytes, truncated at the end of the owning area.
    pub fn read_available(&self, address: &Address, length: usize) -> Result<&[u8], DisassemblyError> {
        let index = self.area_index(address, length)?;
        self.areas[index].read_available(address, length)
    }

    /*───────────────────────────────  cells  ──────────────────────────────*/

    pub fn cell_at(&self, address: &Address) -> Option<&Cell> {
        self.memory_area(address)?.cell_at(address.offset())
    }

    /// Cell whose span covers `address`, with the address it starts at.
    pub fn cell_covering(&self, address: &Address) -> Option<(Address, &Cell)> {
        let area = self.memory_area(address)?;
        let (start, cell) = area.cell_covering(address.offset())?;
        Some((area.make_address(start), cell))
    }

    /// Cells intersecting `[address, address + length)`, with their start address.
    pub fn cells_overlapping(&self, address: &Address, length: usize) -> Vec<(Address, &Cell)> {
        let Some(area) = self.memory_area(address) else {
            return Vec::new();
        };
        area.overlapping(address.offset(), length)
            .into_iter()
            .filter_map(|offset| area.cell_at(offset).map(|cell| (area.make_address(offset), cell)))
            .collect()
    }

    /// Every cell of every area, in address order.
    pub fn cells(&self) -> impl Iterator<Item = (Address, &Cell)> + '_ {
        self.areas.iter().flat_map(MemoryArea::iter_cells)
    }

    pub fn cell_count(&self) -> usize {
        self.areas.iter().map(MemoryArea::cell_count).sum()
    }

    /// Write `cell` at `address`, replacing only a cell that starts there.
    pub fn set_cell(&mut self, address: &Address, cell: Cell) -> Result<(), DisassemblyError> {
        self.commit(address, cell, false)
    }

    /// Write `cell` at `address`, destroying every cell it overlaps.
    pub fn force_cell(&mut self, address: &Address, cell: Cell) -> Result<(), DisassemblyError> {
        self.commit(address, cell, true)
    }

    fn commit(&mut self, address: &Address, cell: Cell, force: bool) -> Result<(), DisassemblyError> {
        let index = self.area_index(address, cell.length())?;
        let references = cell.references().to_vec();
        let label_kind = cell.label_kind();

        let area = &mut self.areas[index];
        let displaced = if force {
            area.force_cell(address.offset(), cell)?
        } else {
            area.set_cell(address.offset(), cell)?
                .map(|old| vec![(address.offset(), old)])
                .unwrap_or_default()
        };
        let displaced: Vec<(Address, Cell)> = displaced
            .into_iter()
            .map(|(offset, old)| (area.make_address(offset), old))
            .collect();

        let mut modified = vec![*address];
        for (old, previous) in displaced {
            if old == *address {
                // Retyped in place: references made by the old content are
                // gone, references to this address still hold.
                self.xrefs.remove_references_from(&old);
                if previous.label_kind() != label_kind {
                    self.relabel(&old, label_kind);
                }
            } else {
                self.destroy(&old);
                modified.push(old);
            }
        }

        for reference in &references {
            self.xrefs.add_reference(*address, reference.target);
        }

        self.notify(modified);
        Ok(())
    }

    /// Swap an auto-generated label for one matching the new cell kind.
    fn relabel(&mut self, address: &Address, kind: Option<LabelKind>) {
        if !self.labels.get(address).is_some_and(Label::is_auto_generated) {
            return;
        }
        self.remove_label(address);
        if let Some(kind) = kind {
            if let Err(e) = self.assign_label(address, Label::from_address(address, kind)) {
                log::warn!("{}: cannot relabel retyped cell: {}", address, e);
            }
        }
    }

    fn destroy(&mut self, address: &Address) {
        self.remove_label(address);
        // Sources forget the target too, so a rebuild cannot bring the pair back
        for source in self.xrefs.to(address) {
            let Ok(index) = self.area_index(&source, 1) else {
                continue;
            };
            if let Some(cell) = self.areas[index].cell_at_mut(source.offset()) {
                cell.drop_references_to(address);
            }
        }
        self.xrefs.remove_references_involving(address);
    }

    /// Remove the cell starting at `address`, with its label and every
    /// reference involving it.
    pub fn remove_cell(&mut self, address: &Address) -> Option<Cell> {
        let index = self.area_index(address, 1).ok()?;
        let cell = self.areas[index].remove_cell(address.offset())?;
        self.destroy(address);
        self.notify([*address]);
        Some(cell)
    }

    /// Attach a comment to the cell at `address`. Returns false if there is none.
    pub fn set_comment(&mut self, address: &Address, comment: impl Into<String>) -> bool {
        let Ok(index) = self.area_index(address, 1) else {
            return false;
        };
        let Some(cell) = self.areas[index].cell_at_mut(address.offset()) else {
            return false;
        };
        cell.set_comment(comment);
        self.notify([*address]);
        true
    }

    /*──────────────────────────────  labels  ──────────────────────────────*/

    /// Bind `label` to `address`, bumping its version until its display name
    /// is unique. Returns the label as stored.
    pub fn assign_label(&mut self, address: &Address, mut label: Label) -> Result<Label, DisassemblyError> {
        self.area_index(address, 1)?;

        loop {
            let name = label.display_name();
            match self.names.get(&name) {
                Some(owner) if owner != address => {
                    if label.version() >= MAX_LABEL_VERSION {
                        return Err(DisassemblyError::LabelSpaceExhausted(name));
                    }
                    log::debug!("label {} already names {}, bumping version", name, owner);
                    label.increment_version();
                }
                _ => break,
            }
        }

        if let Some(old) = self.labels.insert(*address, label.clone()) {
            self.names.remove(&old.display_name());
        }
        self.names.insert(label.display_name(), *address);
        Ok(label)
    }

    /// Label bound to `address`, if any.
    pub fn label_for(&self, address: &Address) -> Option<&Label> {
        self.labels.get(address)
    }

    /// Address `label` is bound to.
    pub fn address_for(&self, label: &Label) -> Option<Address> {
        let address = self.names.get(&label.display_name())?;
        (self.labels.get(address) == Some(label)).then_some(*address)
    }

    /// Address whose label renders as `name`.
    pub fn address_for_name(&self, name: &str) -> Option<Address> {
        self.names.get(name).copied()
    }

    pub fn remove_label(&mut self, address: &Address) -> Option<Label> {
        let label = self.labels.remove(address)?;
        self.names.remove(&label.display_name());
        Some(label)
    }

    /// Every bound label, ordered by address.
    pub fn labels(&self) -> impl Iterator<Item = (&Address, &Label)> + '_ {
        self.labels.iter()
    }

    /// Bind a label without collision resolution, failing if the name is taken.
    pub(crate) fn restore_label(&mut self, address: &Address, label: Label) -> Result<(), DisassemblyError> {
        self.area_index(address, 1)?;
        let name = label.display_name();
        if self.names.contains_key(&name) || self.labels.contains_key(address) {
            return Err(DisassemblyError::CorruptInput(format!("label {} is bound twice", name)));
        }
        self.names.insert(name, *address);
        self.labels.insert(*address, label);
        Ok(())
    }

    /*─────────────────────────────  xrefs  ─────────────────────────────*/

    pub fn xrefs(&self) -> &XRefs {
        &self.xrefs
    }

    pub(crate) fn restore_reference(&mut self, from: Address, to: Address) {
        self.xrefs.add_reference(from, to);
    }

    /// Recompute the index from the references stored in every cell.
    ///
    /// Only needed to repair the index after bulk edits.
    pub fn rebuild_xrefs(&mut self) -> usize {
        let mut xrefs = XRefs::new();
        for (address, cell) in self.cells() {
            for reference in cell.references() {
                xrefs.add_reference(address, reference.target);
            }
        }
        self.xrefs = xrefs;
        self.xrefs.len()
    }

    /*─────────────────────────────  events  ─────────────────────────────*/

    /// Route every subsequent cell write to `handler`, replacing any previous one.
    pub fn start_event_handling(&mut self, handler: Box<dyn EventHandler>) {
        self.handler = Some(handler);
    }

    /// Stop notifying and hand the handler back.
    pub fn stop_event_handling(&mut self) -> Option<Box<dyn EventHandler>> {
        self.handler.take()
    }

    pub fn is_handling_events(&self) -> bool {
        self.handler.is_some()
    }

    /// Handle events until the returned scope is dropped.
    pub fn subscribe(&mut self, handler: Box<dyn EventHandler>) -> EventScope<'_> {
        EventScope::new(self, handler)
    }

    fn notify(&mut self, addresses: impl IntoIterator<Item = Address>) {
        if let Some(handler) = self.handler.as_mut() {
            let update = UpdatedCells::new(addresses);
            if !handler.on_cells_updated(&update) {
                log::warn!("event handler reported a failure for {} address(es)", update.len());
            }
        }
    }
}
