//! Input-format backends.
//!
//! A [`Loader`] turns raw input into a [`Mapping`]: the memory areas to
//! install, the entry points, the symbols it found and the machine it
//! detected. Mapping never touches a database; the session installs the
//! result in one step, so a failing loader leaves nothing behind.

pub mod goblin;
pub mod raw;

use crate::architecture::{Architecture, BIG_ENDIAN_OPTION, MODE_OPTION};
use crate::configuration::NamedOption;
use crate::{Address, ConfigValue, ConfigurationModel, Database, DisassemblyError, Label, Machine, MemoryArea};

pub use self::goblin::GoblinLoader;
pub use self::raw::RawLoader;

/// Result of mapping one input.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub areas: Vec<MemoryArea>,
    pub entry_points: Vec<Address>,
    pub labels: Vec<(Address, Label)>,
    pub machine: Machine,
    /// Byte order declared by the input, if it declares one
    pub big_endian: Option<bool>,
}

impl Mapping {
    pub fn new(machine: Machine) -> Self {
        Self {
            areas: Vec::new(),
            entry_points: Vec::new(),
            labels: Vec::new(),
            machine,
            big_endian: None,
        }
    }

    /// Build a fresh database holding the mapped areas and symbols.
    ///
    /// Overlapping areas are reported as `CorruptInput`. Symbols outside
    /// every area, or whose name has no free version left, are skipped.
    pub fn to_database(&self) -> Result<Database, DisassemblyError> {
        let mut database = Database::new();
        for area in &self.areas {
            database.add_memory_area(area.clone()).map_err(|e| match e {
                DisassemblyError::Overlap { address, existing, .. } => DisassemblyError::CorruptInput(format!(
                    "area {} at {} overlaps the area at {}",
                    area.name(),
                    address,
                    existing
                )),
                other => other,
            })?;
        }
        for (address, label) in &self.labels {
            if database.memory_area(address).is_none() {
                log::debug!("skipping symbol {} outside mapped areas", label);
                continue;
            }
            match database.assign_label(address, label.clone()) {
                Ok(_) => {}
                Err(DisassemblyError::LabelSpaceExhausted(name)) => {
                    log::warn!("skipping symbol at {}: no version left for {}", address, name);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(database)
    }
}

/// Loader trait: maps raw input into memory areas.
pub trait Loader: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Cheap format check.
    fn recognizes(&self, input: &[u8]) -> bool;

    /// Map the whole input.
    fn map(&self, input: &[u8]) -> Result<Mapping, DisassemblyError>;

    /// Index of the architecture to use among `available`, if one matches the
    /// detected machine.
    fn propose_architecture(&self, mapping: &Mapping, available: &[Box<dyn Architecture>]) -> Option<usize> {
        if mapping.machine == Machine::Unknown {
            return None;
        }
        available.iter().position(|arch| arch.supports(mapping.machine))
    }

    /// Adjust the architecture's options to what the input declares.
    fn configure(&self, mapping: &Mapping, model: &mut ConfigurationModel) -> Result<(), DisassemblyError> {
        if mapping.machine != Machine::Unknown && matches!(model.option(MODE_OPTION), Some(NamedOption::Enum(_))) {
            if let Err(e) = model.set_from_str(MODE_OPTION, &mapping.machine.to_string()) {
                log::debug!("{}: cannot preselect {}: {}", self.name(), mapping.machine, e);
            }
        }
        if let Some(big_endian) = mapping.big_endian {
            if matches!(model.option(BIG_ENDIAN_OPTION), Some(NamedOption::Bool(_))) {
                model.set(BIG_ENDIAN_OPTION, ConfigValue::Bool(big_endian))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::CapstoneArchitecture;
    use crate::database::MAX_LABEL_VERSION;
    use crate::{Access, LabelAccess, LabelKind};

    fn mapping() -> Mapping {
        let mut mapping = Mapping::new(Machine::Arm);
        mapping.areas.push(MemoryArea::with_bytes("a", Address::flat(0, 32), Access::READ_EXECUTE, vec![0; 8]).unwrap());
        mapping.areas.push(MemoryArea::with_bytes("b", Address::flat(0x10, 32), Access::READ, vec![0; 8]).unwrap());
        mapping
    }

    #[test]
    fn test_to_database() {
        let mut mapping = mapping();
        mapping.labels.push((Address::flat(4, 32), Label::new("f", LabelKind::Function, LabelAccess::Global, 0)));
        mapping.labels.push((Address::flat(0x40, 32), Label::new("gone", LabelKind::Data, LabelAccess::Global, 0)));
        let db = mapping.to_database().unwrap();
        assert_eq!(db.memory_areas().count(), 2);
        assert_eq!(db.address_for_name("f"), Some(Address::flat(4, 32)));
        assert!(db.address_for_name("gone").is_none());
    }

    #[test]
    fn test_exhausted_symbol_name_is_skipped() {
        let mut mapping = mapping();
        let last = Label::new("x", LabelKind::Data, LabelAccess::Global, MAX_LABEL_VERSION);
        mapping.labels.push((Address::flat(0, 32), last.clone()));
        mapping.labels.push((Address::flat(4, 32), last));
        mapping.labels.push((Address::flat(0x10, 32), Label::new("y", LabelKind::Data, LabelAccess::Global, 0)));

        let db = mapping.to_database().unwrap();
        assert_eq!(db.label_for(&Address::flat(0, 32)).unwrap().version(), MAX_LABEL_VERSION);
        assert!(db.label_for(&Address::flat(4, 32)).is_none());
        assert_eq!(db.address_for_name("y"), Some(Address::flat(0x10, 32)));
    }

    #[test]
    fn test_overlapping_areas_are_corrupt() {
        let mut mapping = mapping();
        mapping.areas.push(MemoryArea::with_bytes("c", Address::flat(4, 32), Access::READ, vec![0; 2]).unwrap());
        assert!(matches!(mapping.to_database(), Err(DisassemblyError::CorruptInput(_))));
    }

    #[test]
    fn test_default_proposal_and_configure() {
        let loader = RawLoader::default();
        let archs: Vec<Box<dyn Architecture>> = vec![Box::new(CapstoneArchitecture::default())];
        let mut mapping = mapping();
        assert_eq!(loader.propose_architecture(&mapping, &archs), Some(0));

        mapping.big_endian = Some(true);
        let mut model = ConfigurationModel::new();
        archs[0].fill_configuration_model(&mut model).unwrap();
        loader.configure(&mapping, &mut model).unwrap();
        let configuration = model.configuration();
        assert_eq!(configuration.get_bool(BIG_ENDIAN_OPTION), Some(true));
        let NamedOption::Enum(mode) = model.option(MODE_OPTION).unwrap() else {
            panic!("mode is an enum");
        };
        assert_eq!(mode.label_of(configuration.get_enum(MODE_OPTION).unwrap()), Some("ARM"));

        mapping.machine = Machine::Unknown;
        assert_eq!(loader.propose_architecture(&mapping, &archs), None);
    }
}
