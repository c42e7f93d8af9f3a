//! The disassembly pipeline.
//!
//! [`Disassembler::run`] asks the configured architecture to decode bytes at
//! pending addresses and commits each result to the database: the cell, its
//! auto-label and the cross-references it reports. Decode failures become
//! one-byte undecoded cells, so every address is attempted at most once and
//! the pass always terminates.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::architecture::Architecture;
use crate::{Address, Cell, CellKind, Database, DecodeError, DisassemblyError, Label, LabelKind, Offset, Reference};

/// Maximum chunk size for parallel linear sweep
const CHUNK_SIZE: usize = 4096;

/// Which discovered addresses the pipeline decodes.
#[derive(Copy, Clone, ValueEnum, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Traversal {
    /// Follow fall-through and every jump or call target
    #[default]
    Recursive,
    /// Follow fall-through from the entry points only
    Seeds,
    /// Decode every executable area front to back
    Linear,
}

impl fmt::Display for Traversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Traversal::Recursive => write!(f, "Recursive descent"),
            Traversal::Seeds => write!(f, "Entry points only"),
            Traversal::Linear => write!(f, "Linear sweep"),
        }
    }
}

/// Behaviour of one disassembly pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisassemblyOptions {
    pub traversal: Traversal,
    /// Shortest printable run typed as a string
    pub min_string_length: usize,
    /// Longest printable run typed as a string
    pub max_string_length: usize,
    /// Give entry points a `lbl_` label
    pub label_entry_points: bool,
}

impl Default for DisassemblyOptions {
    fn default() -> Self {
        Self {
            traversal: Traversal::Recursive,
            min_string_length: 2,
            max_string_length: 0x100,
            label_entry_points: true,
        }
    }
}

/// What a pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisassemblyReport {
    /// Cells decoded by the architecture
    pub decoded: usize,
    /// Addresses the architecture could not decode
    pub failed: usize,
    /// Strings found behind data references
    pub strings: usize,
    /// Data references typed as single data bytes
    pub data: usize,
    /// The pass stopped before running out of work
    pub interrupted: bool,
}

impl fmt::Display for DisassemblyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} decoded, {} failed, {} string(s), {} data{}",
            self.decoded,
            self.failed,
            self.strings,
            self.data,
            if self.interrupted { " (interrupted)" } else { "" }
        )
    }
}

/// Shared flag aborting a pass between two cells.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Pending {
    /// Decode as code, labelling the cell with the given kind
    Code(Address, Option<LabelKind>),
    /// Type the target of a data reference
    Data(Address),
}

/// Drives one architecture over a database.
pub struct Disassembler<'a> {
    architecture: &'a dyn Architecture,
    options: DisassemblyOptions,
    interrupt: Interrupt,
}

impl<'a> Disassembler<'a> {
    pub fn new(architecture: &'a dyn Architecture, options: DisassemblyOptions) -> Self {
        Self { architecture, options, interrupt: Interrupt::new() }
    }

    /// Use a flag shared with the driver.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run one pass starting from `seeds`.
    pub fn run(&self, database: &mut Database, seeds: &[Address]) -> Result<DisassemblyReport, DisassemblyError> {
        let start_time = Instant::now();
        let mut seeds = seeds.to_vec();
        seeds.extend(self.architecture.entry_points(database));

        log::info!(
            "{} with {} from {} seed(s)",
            self.options.traversal,
            self.architecture.name(),
            seeds.len()
        );

        let report = match self.options.traversal {
            Traversal::Recursive | Traversal::Seeds => self.traverse(database, &seeds)?,
            Traversal::Linear => self.sweep(database, &seeds)?,
        };

        if report.interrupted {
            log::warn!("disassembly interrupted: {}", report);
        } else {
            log::info!("disassembly completed in {:?}: {}", start_time.elapsed(), report);
        }
        Ok(report)
    }

    fn seed_label(&self) -> Option<LabelKind> {
        self.options.label_entry_points.then_some(LabelKind::Code)
    }

    fn traverse(&self, database: &mut Database, seeds: &[Address]) -> Result<DisassemblyReport, DisassemblyError> {
        let mut report = DisassemblyReport::default();
        let mut queue: VecDeque<Pending> = seeds.iter().map(|s| Pending::Code(*s, self.seed_label())).collect();
        let mut seen = HashSet::new();

        while let Some(pending) = queue.pop_front() {
            if self.interrupt.is_triggered() {
                report.interrupted = true;
                break;
            }
            match pending {
                Pending::Code(address, label) => {
                    if !seen.insert(pending_key(&pending)) {
                        // Already visited, maybe without the label this path asks for
                        if let Some(kind) = label {
                            if database.cell_at(&address).is_some_and(|c| c.kind() == CellKind::Code) {
                                self.ensure_label(database, &address, kind)?;
                            }
                        }
                        continue;
                    }
                    let Some(cell) = self.decode_at(database, &address, label, &mut report)? else {
                        continue;
                    };
                    if cell.falls_through() {
                        if let Some(next) = address.checked_add(cell.length() as u64) {
                            queue.push_front(Pending::Code(next, None));
                        }
                    }
                    for reference in cell.references() {
                        match follow(reference) {
                            Pending::Code(..) if self.options.traversal == Traversal::Seeds => {}
                            next => queue.push_back(next),
                        }
                    }
                }
                Pending::Data(address) => {
                    if seen.insert(pending_key(&pending)) {
                        self.analyse_data(database, &address, &mut report)?;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Decode and commit one cell. Returns the committed cell, `None` when
    /// the address was skipped or could not be decoded.
    fn decode_at(
        &self,
        database: &mut Database,
        address: &Address,
        label: Option<LabelKind>,
        report: &mut DisassemblyReport,
    ) -> Result<Option<Cell>, DisassemblyError> {
        if database.memory_area(address).is_none() {
            log::debug!("{}: outside mapped areas", address);
            return Ok(None);
        }
        if let Some((start, existing)) = database.cell_covering(address) {
            if !existing.is_undecoded() {
                if start == *address && existing.kind() == CellKind::Code {
                    if let Some(kind) = label {
                        self.ensure_label(database, address, kind)?;
                    }
                } else {
                    log::debug!("{}: already typed as {:?} at {}", address, existing.kind(), start);
                }
                return Ok(None);
            }
        }

        let bytes = database.read_available(address, self.architecture.max_instruction_size())?;
        match self.architecture.decode(bytes, address) {
            Ok(cell) => {
                if let Some(rejection) = self.commit_code(database, address, cell.clone())? {
                    log::debug!("{}", rejection);
                    report.failed += 1;
                    self.mark_undecoded(database, address, rejection)?;
                    return Ok(None);
                }
                report.decoded += 1;
                if let Some(kind) = label {
                    self.ensure_label(database, address, kind)?;
                }
                Ok(Some(cell))
            }
            Err(e) => {
                log::debug!("{}", e);
                report.failed += 1;
                self.mark_undecoded(database, address, e)?;
                Ok(None)
            }
        }
    }

    /// Write a decoded cell over undecoded bytes only. Returns why the cell
    /// was rejected, if it was.
    fn commit_code(&self, database: &mut Database, address: &Address, cell: Cell) -> Result<Option<DecodeError>, DisassemblyError> {
        let length = cell.length();
        let blocked = database
            .cells_overlapping(address, length)
            .into_iter()
            .find(|(_, existing)| !existing.is_undecoded())
            .map(|(start, _)| start);
        if let Some(start) = blocked {
            let reason = format!("{} byte(s) would overlap the cell at {}", length, start);
            return Ok(Some(DecodeError::new(*address, reason)));
        }
        match database.force_cell(address, cell) {
            Ok(()) => Ok(None),
            Err(DisassemblyError::OutOfBounds { .. }) => {
                let reason = format!("{} byte(s) run past the end of the area", length);
                Ok(Some(DecodeError::new(*address, reason)))
            }
            Err(e) => Err(e),
        }
    }

    fn mark_undecoded(&self, database: &mut Database, address: &Address, error: DecodeError) -> Result<(), DisassemblyError> {
        if database.cell_covering(address).is_some() {
            return Ok(());
        }
        let byte = database.read_bytes(address, 1)?.to_vec();
        let mut cell = Cell::value(&byte, address)?;
        cell.set_comment(error.reason);
        database.set_cell(address, cell)
    }

    /// Give `address` an auto-label unless it already has one. A name with no
    /// free version left leaves the cell unlabelled.
    fn ensure_label(&self, database: &mut Database, address: &Address, kind: LabelKind) -> Result<(), DisassemblyError> {
        if database.label_for(address).is_some() {
            return Ok(());
        }
        match database.assign_label(address, Label::from_address(address, kind)) {
            Ok(_) => Ok(()),
            Err(DisassemblyError::LabelSpaceExhausted(name)) => {
                log::warn!("{}: leaving cell unlabelled, no version left for {}", address, name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Type the target of a data reference as a string or a data byte.
    fn analyse_data(&self, database: &mut Database, address: &Address, report: &mut DisassemblyReport) -> Result<(), DisassemblyError> {
        if database.memory_area(address).is_none() || database.cell_covering(address).is_some() {
            return Ok(());
        }

        let window = database.read_available(address, self.options.max_string_length.saturating_add(1))?;
        if let Some(text) = detect_string(window, self.options.min_string_length) {
            let length = text.len() + 1;
            if database.cells_overlapping(address, length).is_empty() {
                database.set_cell(address, Cell::string(text, address)?)?;
                self.ensure_label(database, address, LabelKind::String)?;
                report.strings += 1;
                return Ok(());
            }
        }

        let byte = database.read_bytes(address, 1)?[0];
        database.set_cell(address, Cell::data(1, byte as u64, address)?)?;
        self.ensure_label(database, address, LabelKind::Data)?;
        report.data += 1;
        Ok(())
    }

    /// Parallel chunked decode of every executable area, merged in address order.
    fn sweep(&self, database: &mut Database, seeds: &[Address]) -> Result<DisassemblyReport, DisassemblyError> {
        let mut report = DisassemblyReport::default();
        let mut references: Vec<(Address, Reference)> = Vec::new();

        let areas: Vec<(Address, Vec<u8>)> = database
            .memory_areas()
            .filter(|area| area.is_executable())
            .map(|area| (area.start(), area.bytes().to_vec()))
            .collect();

        'areas: for (base, bytes) in &areas {
            let decoded = self.decode_area(base, bytes);
            let end = base.offset() + bytes.len() as Offset;

            let mut cursor: Offset = base.offset();
            // A trailing sentinel lets the gap after the last cell be filled too
            let walk = decoded.into_iter().map(Some).chain(std::iter::once(None));
            for entry in walk {
                let next = entry.as_ref().map_or(end, |(address, _)| address.offset());
                // Bytes the parallel walk stepped over, after a rejected cell
                // or across a chunk seam, are decoded one by one here
                while cursor < next {
                    if self.interrupt.is_triggered() {
                        report.interrupted = true;
                        break 'areas;
                    }
                    let (address, result) = self.decode_one(base, bytes, (cursor - base.offset()) as usize);
                    cursor = self.place(database, address, result, &mut report, &mut references)?;
                }
                let Some((address, result)) = entry else {
                    break;
                };
                if self.interrupt.is_triggered() {
                    report.interrupted = true;
                    break 'areas;
                }
                if address.offset() < cursor {
                    continue;
                }
                cursor = self.place(database, address, result, &mut report, &mut references)?;
            }
        }

        if !report.interrupted {
            if let Some(kind) = self.seed_label() {
                for seed in seeds {
                    if database.cell_at(seed).is_some_and(|c| c.kind() == CellKind::Code) {
                        self.ensure_label(database, seed, kind)?;
                    }
                }
            }
            for (_, reference) in references {
                match follow(&reference) {
                    Pending::Code(target, Some(kind)) => {
                        if database.cell_at(&target).is_some_and(|c| c.kind() == CellKind::Code) {
                            self.ensure_label(database, &target, kind)?;
                        }
                    }
                    Pending::Data(target) => self.analyse_data(database, &target, &mut report)?,
                    Pending::Code(_, None) => {}
                }
            }
        }

        Ok(report)
    }

    /// Commit one linear-sweep result. Returns the offset the sweep resumes at.
    fn place(
        &self,
        database: &mut Database,
        address: Address,
        result: Result<Cell, DecodeError>,
        report: &mut DisassemblyReport,
        references: &mut Vec<(Address, Reference)>,
    ) -> Result<Offset, DisassemblyError> {
        if let Some((start, existing)) = database.cell_covering(&address) {
            if !existing.is_undecoded() {
                return Ok(start.offset() + existing.length() as Offset);
            }
        }
        let error = match result {
            Ok(cell) => {
                let length = cell.length() as Offset;
                let outbound = cell.references().to_vec();
                match self.commit_code(database, &address, cell)? {
                    None => {
                        report.decoded += 1;
                        references.extend(outbound.into_iter().map(|r| (address, r)));
                        return Ok(address.offset() + length);
                    }
                    Some(rejection) => rejection,
                }
            }
            Err(e) => e,
        };
        log::debug!("{}", error);
        report.failed += 1;
        self.mark_undecoded(database, &address, error)?;
        Ok(address.offset() + 1)
    }

    /// Decode the instruction at byte `at` of an area's backing store.
    fn decode_one(&self, base: &Address, bytes: &[u8], at: usize) -> (Address, Result<Cell, DecodeError>) {
        let window = &bytes[at..(at + self.architecture.max_instruction_size()).min(bytes.len())];
        let address = base.with_offset(base.offset() + at as Offset);
        let result = self.architecture.decode(window, &address);
        (address, result)
    }

    /// Decode every offset reachable by a linear walk of each chunk.
    fn decode_area(&self, base: &Address, bytes: &[u8]) -> Vec<(Address, Result<Cell, DecodeError>)> {
        if bytes.is_empty() {
            return Vec::new();
        }
        let num_chunks = bytes.len().div_ceil(CHUNK_SIZE);

        let chunks: Vec<Vec<(Address, Result<Cell, DecodeError>)>> = (0..num_chunks)
            .into_par_iter()
            .map(|chunk_idx| {
                let chunk_start = chunk_idx * CHUNK_SIZE;
                let chunk_end = (chunk_start + CHUNK_SIZE).min(bytes.len());
                let mut out = Vec::new();
                let mut at = chunk_start;
                // Only keep cells starting in this chunk's primary range
                while at < chunk_end {
                    let (address, result) = self.decode_one(base, bytes, at);
                    let step = match &result {
                        Ok(cell) => cell.length(),
                        Err(_) => 1,
                    };
                    out.push((address, result));
                    at += step;
                }
                out
            })
            .collect();

        log::debug!("decoded {} chunk(s) of {} at {}", num_chunks, bytes.len(), base);
        chunks.into_iter().flatten().collect()
    }
}

fn follow(reference: &Reference) -> Pending {
    if reference.kind.is_code() {
        Pending::Code(reference.target, Some(reference.kind.label_kind()))
    } else {
        Pending::Data(reference.target)
    }
}

fn pending_key(pending: &Pending) -> (Address, bool) {
    match pending {
        Pending::Code(address, _) => (*address, true),
        Pending::Data(address) => (*address, false),
    }
}

/// Printable ASCII run terminated by NUL, at least `min_length` long.
pub fn detect_string(bytes: &[u8], min_length: usize) -> Option<String> {
    let printable = |b: &u8| (0x20..=0x7e).contains(b) || matches!(b, b'\t' | b'\n' | b'\r');
    let length = bytes.iter().take_while(|b| printable(b)).count();
    if length < min_length.max(1) || bytes.get(length) != Some(&0) {
        return None;
    }
    Some(String::from_utf8_lossy(&bytes[..length]).into_owned())
}
