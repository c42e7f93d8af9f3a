//! Flat binary loader.

use super::{Loader, Mapping};
use crate::{Access, Address, DisassemblyError, Machine, MemoryArea, Offset};

/// Maps the whole input as one executable area.
///
/// Always recognizes non-empty input, so it is registered last as the
/// fallback.
#[derive(Debug, Clone)]
pub struct RawLoader {
    base: Offset,
    bits: u8,
}

impl Default for RawLoader {
    fn default() -> Self {
        Self { base: 0, bits: 32 }
    }
}

impl RawLoader {
    pub fn new(base: Offset, bits: u8) -> Self {
        Self { base, bits }
    }
}

impl Loader for RawLoader {
    fn name(&self) -> &str {
        "raw"
    }

    fn recognizes(&self, input: &[u8]) -> bool {
        !input.is_empty()
    }

    fn map(&self, input: &[u8]) -> Result<Mapping, DisassemblyError> {
        if input.is_empty() {
            return Err(DisassemblyError::CorruptInput("empty input".into()));
        }
        let base = Address::flat(self.base, self.bits);
        let area = MemoryArea::with_bytes("raw", base, Access::READ_EXECUTE, input.to_vec()).map_err(|_| {
            DisassemblyError::CorruptInput(format!("{} bytes do not fit above {}", input.len(), base))
        })?;

        let mut mapping = Mapping::new(Machine::Unknown);
        mapping.areas.push(area);
        mapping.entry_points.push(base);
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_whole_input() {
        let loader = RawLoader::new(0x1000, 16);
        let mapping = loader.map(&[0x90, 0xc3]).unwrap();
        assert_eq!(mapping.areas.len(), 1);
        let area = &mapping.areas[0];
        assert_eq!(area.start(), Address::flat(0x1000, 16));
        assert_eq!(area.size(), 2);
        assert!(area.is_executable());
        assert_eq!(mapping.entry_points, vec![Address::flat(0x1000, 16)]);
        assert_eq!(mapping.machine, Machine::Unknown);
    }

    #[test]
    fn test_empty_input() {
        let loader = RawLoader::default();
        assert!(!loader.recognizes(&[]));
        assert!(matches!(loader.map(&[]), Err(DisassemblyError::CorruptInput(_))));
    }

    #[test]
    fn test_input_past_address_space() {
        let loader = RawLoader::new(u64::MAX, 64);
        assert!(loader.map(&[0, 0]).is_err());
    }
}
