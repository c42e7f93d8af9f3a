//! Persistence of a whole database.
//!
//! A [`Serializer`] opens a named store and saves or loads the full entity
//! graph: areas with their bytes and cells, labels with their versions, and
//! every cross-reference pair. [`JsonSerializer`] writes one JSON document per
//! store.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Access, Address, Cell, Database, DisassemblyError, Label, MemoryArea, Offset};

/// Version written into every snapshot.
pub const FORMAT_VERSION: u32 = 1;

/// An opened store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHandle {
    path: PathBuf,
}

impl StoreHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Persistence contract.
pub trait Serializer {
    fn open(&self, store: &str) -> Result<StoreHandle, DisassemblyError>;

    /// Persist `database`. On error the previous store content is kept.
    fn save(&self, handle: &StoreHandle, database: &Database) -> Result<(), DisassemblyError>;

    fn load(&self, handle: &StoreHandle) -> Result<Database, DisassemblyError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    areas: Vec<AreaRecord>,
    labels: Vec<LabelRecord>,
    xrefs: Vec<(Address, Address)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AreaRecord {
    name: String,
    base: Address,
    access: Access,
    bytes: String,
    cells: Vec<CellRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellRecord {
    offset: Offset,
    cell: Cell,
}

#[derive(Debug, Serialize, Deserialize)]
struct LabelRecord {
    address: Address,
    label: Label,
}

impl Snapshot {
    fn capture(database: &Database) -> Self {
        let areas = database
            .memory_areas()
            .map(|area| AreaRecord {
                name: area.name().to_string(),
                base: area.start(),
                access: area.access(),
                bytes: hex::encode(area.bytes()),
                cells: area
                    .iter_cells()
                    .map(|(address, cell)| CellRecord { offset: address.offset(), cell: cell.clone() })
                    .collect(),
            })
            .collect();
        let labels = database
            .labels()
            .map(|(address, label)| LabelRecord { address: *address, label: label.clone() })
            .collect();
        Self {
            format_version: FORMAT_VERSION,
            areas,
            labels,
            xrefs: database.xrefs().all_pairs().collect(),
        }
    }

    fn restore(self) -> Result<Database, DisassemblyError> {
        if self.format_version != FORMAT_VERSION {
            return Err(DisassemblyError::CorruptInput(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        let mut database = Database::new();
        for record in self.areas {
            let bytes = hex::decode(&record.bytes).map_err(|e| {
                DisassemblyError::CorruptInput(format!("bad byte dump in area {}: {}", record.name, e))
            })?;
            let area = MemoryArea::with_bytes(record.name, record.base, record.access, bytes).map_err(corrupt)?;
            let base = area.start();
            database.add_memory_area(area).map_err(corrupt)?;
            for CellRecord { offset, cell } in record.cells {
                let address = base.with_offset(offset);
                if cell.length() == 0 {
                    return Err(DisassemblyError::CorruptInput(format!("empty cell at {}", address)));
                }
                database.set_cell(&address, cell).map_err(corrupt)?;
            }
        }
        for LabelRecord { address, label } in self.labels {
            database.restore_label(&address, label).map_err(corrupt)?;
        }
        for (from, to) in self.xrefs {
            database.restore_reference(from, to);
        }
        Ok(database)
    }
}

fn corrupt(error: DisassemblyError) -> DisassemblyError {
    match error {
        DisassemblyError::CorruptInput(_) | DisassemblyError::IoError(_) => error,
        other => DisassemblyError::CorruptInput(other.to_string()),
    }
}

/// Stores each database as a pretty-printed JSON file.
#[derive(Debug, Default, Clone)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        JsonSerializer
    }
}

impl Serializer for JsonSerializer {
    /// `store` is a file path; `.json` is appended when it has no extension.
    fn open(&self, store: &str) -> Result<StoreHandle, DisassemblyError> {
        if store.trim().is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty store name").into());
        }
        let mut path = PathBuf::from(store);
        if path.extension().is_none() {
            path.set_extension("json");
        }
        Ok(StoreHandle { path })
    }

    fn save(&self, handle: &StoreHandle, database: &Database) -> Result<(), DisassemblyError> {
        let snapshot = Snapshot::capture(database);
        let mut staging = handle.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let written = (|| -> io::Result<()> {
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, &snapshot)?;
            writer.flush()?;
            fs::rename(&staging, &handle.path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        log::debug!(
            "saved {} area(s), {} label(s), {} xref(s) to {}",
            snapshot.areas.len(),
            snapshot.labels.len(),
            snapshot.xrefs.len(),
            handle
        );
        Ok(())
    }

    fn load(&self, handle: &StoreHandle) -> Result<Database, DisassemblyError> {
        let reader = BufReader::new(File::open(&handle.path)?);
        let snapshot: Snapshot = serde_json::from_reader(reader).map_err(|e| {
            if e.is_io() {
                DisassemblyError::IoError(e.into())
            } else {
                DisassemblyError::CorruptInput(e.to_string())
            }
        })?;
        snapshot.restore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LabelAccess, LabelKind, Reference, ReferenceKind};
    use tempfile::tempdir;

    fn a(offset: u64) -> Address {
        Address::flat(offset, 16)
    }

    fn database() -> Database {
        let mut db = Database::new();
        db.add_memory_area(MemoryArea::with_bytes("code", a(0), Access::READ_EXECUTE, b"\x90\x90\x90\x90AB\0\0".to_vec()).unwrap())
            .unwrap();
        db.add_memory_area(MemoryArea::with_bytes("data", a(0x100), Access::READ_WRITE, vec![1, 2, 3, 4]).unwrap())
            .unwrap();
        let code = Cell::instruction("op", "0x4", 4, false, &a(0))
            .unwrap()
            .with_references(vec![Reference::new(a(4), ReferenceKind::Data)]);
        db.set_cell(&a(0), code).unwrap();
        db.set_cell(&a(4), Cell::string("AB", &a(4)).unwrap()).unwrap();
        db.set_cell(&a(0x100), Cell::data(4, 0x04030201, &a(0x100)).unwrap()).unwrap();
        db.set_comment(&a(0), "entry");
        db.assign_label(&a(0), Label::from_address(&a(0), LabelKind::Code)).unwrap();
        db.assign_label(&a(4), Label::new("name", LabelKind::Data, LabelAccess::Local, 0)).unwrap();
        db.assign_label(&a(0x100), Label::new("name", LabelKind::Data, LabelAccess::Global, 0)).unwrap();
        db
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let serializer = JsonSerializer::new();
        let handle = serializer.open(dir.path().join("db").to_str().unwrap()).unwrap();
        assert_eq!(handle.path().extension().unwrap(), "json");

        let original = database();
        serializer.save(&handle, &original).unwrap();
        let loaded = serializer.load(&handle).unwrap();

        assert_eq!(loaded.xrefs(), original.xrefs());
        assert_eq!(
            loaded.labels().collect::<Vec<_>>(),
            original.labels().collect::<Vec<_>>()
        );
        assert_eq!(loaded.label_for(&a(0x100)).unwrap().version(), 1);
        assert_eq!(loaded.cells().collect::<Vec<_>>(), original.cells().collect::<Vec<_>>());
        assert_eq!(loaded.cell_at(&a(0)).unwrap().comment(), Some("entry"));
        let areas: Vec<_> = loaded.memory_areas().map(|m| (m.name().to_string(), m.bytes().to_vec())).collect();
        assert_eq!(areas[0], ("code".to_string(), b"\x90\x90\x90\x90AB\0\0".to_vec()));
        assert_eq!(areas[1].1, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_no_staging_file_left() {
        let dir = tempdir().unwrap();
        let serializer = JsonSerializer::new();
        let handle = serializer.open(dir.path().join("db.json").to_str().unwrap()).unwrap();
        serializer.save(&handle, &database()).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec![std::ffi::OsString::from("db.json")]);
    }

    #[test]
    fn test_missing_store_is_io_error() {
        let dir = tempdir().unwrap();
        let serializer = JsonSerializer::new();
        let handle = serializer.open(dir.path().join("absent.json").to_str().unwrap()).unwrap();
        assert!(matches!(serializer.load(&handle), Err(DisassemblyError::IoError(_))));
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let serializer = JsonSerializer::new();
        let handle = serializer.open(dir.path().join("no/such/db.json").to_str().unwrap()).unwrap();
        assert!(matches!(serializer.save(&handle, &database()), Err(DisassemblyError::IoError(_))));
    }

    #[test]
    fn test_overlapping_cells_are_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut snapshot = Snapshot::capture(&database());
        let cell = Cell::value(&[0, 0], &a(3)).unwrap();
        snapshot.areas[0].cells.push(CellRecord { offset: 3, cell });
        fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let serializer = JsonSerializer::new();
        let handle = serializer.open(path.to_str().unwrap()).unwrap();
        assert!(matches!(serializer.load(&handle), Err(DisassemblyError::CorruptInput(_))));
    }

    #[test]
    fn test_duplicate_label_is_corrupt() {
        let mut snapshot = Snapshot::capture(&database());
        let first = snapshot.labels[0].label.clone();
        snapshot.labels.push(LabelRecord { address: a(0x101), label: first });
        assert!(matches!(snapshot.restore(), Err(DisassemblyError::CorruptInput(_))));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.json");
        fs::write(&path, "{ not json").unwrap();
        let serializer = JsonSerializer::new();
        let handle = serializer.open(path.to_str().unwrap()).unwrap();
        assert!(matches!(serializer.load(&handle), Err(DisassemblyError::CorruptInput(_))));
    }

    #[test]
    fn test_byte_dump_is_hex() {
        let mut snapshot = Snapshot::capture(&database());
        assert_eq!(snapshot.areas[1].bytes, "01020304");

        snapshot.areas[1].bytes = "0102030".into();
        assert!(matches!(snapshot.restore(), Err(DisassemblyError::CorruptInput(_))));

        let mut snapshot = Snapshot::capture(&database());
        snapshot.areas[1].bytes = "zz".into();
        assert!(matches!(snapshot.restore(), Err(DisassemblyError::CorruptInput(_))));
    }

    #[test]
    fn test_area_past_address_space_is_corrupt() {
        let mut snapshot = Snapshot::capture(&database());
        snapshot.areas[1].base = Address::flat(u64::MAX - 1, 16);
        snapshot.areas[1].cells.clear();
        snapshot.labels.retain(|record| record.address != a(0x100));
        assert!(matches!(snapshot.restore(), Err(DisassemblyError::CorruptInput(_))));
    }
}
