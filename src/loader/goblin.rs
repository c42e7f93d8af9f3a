//! Goblin-based multi-format loader (ELF, PE, Mach-O).

use std::fmt;

use ::goblin::elf::{self, program_header::PT_LOAD, sym};
use ::goblin::mach::{constants::cputype, Mach, MachO, SingleArch};
use ::goblin::{pe, Object};

use super::{Loader, Mapping};
use crate::{Access, Address, DisassemblyError, Label, LabelAccess, LabelKind, Machine, MemoryArea, Offset};

/// A loader that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default, Clone)]
pub struct GoblinLoader;

impl GoblinLoader {
    pub fn new() -> Self {
        GoblinLoader
    }

    /// Map an ELF image.
    fn map_elf(&self, elf: &elf::Elf, input: &[u8]) -> Result<Mapping, DisassemblyError> {
        let machine = match elf.header.e_machine {
            elf::header::EM_386 => Machine::X86_32,
            elf::header::EM_X86_64 => Machine::X86_64,
            elf::header::EM_ARM => Machine::Arm,
            elf::header::EM_AARCH64 => Machine::AArch64,
            elf::header::EM_MIPS => Machine::Mips32,
            elf::header::EM_PPC => Machine::Ppc32,
            elf::header::EM_RISCV => {
                // Determine RISC-V bitness from ELF class
                match elf.header.e_ident[elf::header::EI_CLASS] {
                    elf::header::ELFCLASS32 => Machine::RiscV32,
                    elf::header::ELFCLASS64 => Machine::RiscV64,
                    _ => Machine::Unknown,
                }
            }
            _ => Machine::Unknown,
        };
        let bits = address_bits(machine, elf.is_64);

        let mut mapping = Mapping::new(machine);
        mapping.big_endian = Some(!elf.little_endian);

        // Allocated, file-backed sections
        for sh in &elf.section_headers {
            if !sh.is_alloc() || sh.sh_type == elf::section_header::SHT_NOBITS || sh.sh_size == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
            let access = Access { read: true, write: sh.is_writable(), execute: sh.is_executable() };
            let bytes = slice(input, sh.sh_offset, sh.sh_size, &name)?;
            mapping.areas.push(area(name, Address::flat(sh.sh_addr, bits), access, bytes)?);
        }

        // Stripped section table: fall back to loadable segments
        if mapping.areas.is_empty() {
            for (index, ph) in elf.program_headers.iter().enumerate() {
                if ph.p_type != PT_LOAD || ph.p_filesz == 0 {
                    continue;
                }
                let name = format!("LOAD{}", index);
                let access = Access { read: ph.is_read(), write: ph.is_write(), execute: ph.is_executable() };
                let bytes = slice(input, ph.p_offset, ph.p_filesz, &name)?;
                mapping.areas.push(area(name, Address::flat(ph.p_vaddr, bits), access, bytes)?);
            }
        }

        if elf.entry != 0 {
            mapping.entry_points.push(Address::flat(elf.entry, bits));
        }

        let symbols = elf
            .syms
            .iter()
            .filter_map(|s| Some((elf.strtab.get_at(s.st_name)?, s)))
            .chain(elf.dynsyms.iter().filter_map(|s| Some((elf.dynstrtab.get_at(s.st_name)?, s))));
        for (name, s) in symbols {
            if name.is_empty() || s.st_value == 0 || s.st_shndx == 0 {
                continue;
            }
            let kind = match s.st_type() {
                sym::STT_FUNC => LabelKind::Function,
                sym::STT_OBJECT | sym::STT_TLS => LabelKind::Data,
                sym::STT_NOTYPE => LabelKind::Code,
                _ => continue,
            };
            let access = match s.st_bind() {
                sym::STB_LOCAL => LabelAccess::Local,
                _ => LabelAccess::Global,
            };
            let address = Address::flat(s.st_value, bits);
            if mapping.labels.iter().any(|(a, l)| *a == address && l.name() == name.as_bytes()) {
                continue;
            }
            mapping.labels.push((address, Label::new(name, kind, access, 0)));
        }

        Ok(mapping)
    }

    /// Map a PE image.
    fn map_pe(&self, pe: &pe::PE<'_>, input: &[u8]) -> Result<Mapping, DisassemblyError> {
        let machine = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Machine::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Machine::X86_64,
            pe::header::COFF_MACHINE_ARM => Machine::Arm,
            pe::header::COFF_MACHINE_ARM64 => Machine::AArch64,
            _ => Machine::Unknown,
        };
        let bits = address_bits(machine, pe.is_64);
        let image_base = pe.image_base as Offset;

        let mut mapping = Mapping::new(machine);
        mapping.big_endian = Some(false);

        for section in &pe.sections {
            let name = section.name().unwrap_or("").to_string();
            let size = match (section.virtual_size, section.size_of_raw_data) {
                (0, raw) => raw,
                (virt, raw) => virt.min(raw),
            };
            if size == 0 {
                continue;
            }
            let characteristics = section.characteristics;
            let access = Access {
                read: characteristics & pe::section_table::IMAGE_SCN_MEM_READ != 0,
                write: characteristics & pe::section_table::IMAGE_SCN_MEM_WRITE != 0,
                execute: characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE != 0,
            };
            let bytes = slice(input, section.pointer_to_raw_data as u64, size as u64, &name)?;
            let base = image_base
                .checked_add(section.virtual_address as Offset)
                .ok_or_else(|| DisassemblyError::CorruptInput(format!("section {} lies above the address space", name)))?;
            mapping.areas.push(area(name, Address::flat(base, bits), access, bytes)?);
        }

        if pe.entry != 0 {
            match image_base.checked_add(pe.entry as Offset) {
                Some(entry) => mapping.entry_points.push(Address::flat(entry, bits)),
                None => log::warn!("ignoring entry point {:#x} above the address space", pe.entry),
            }
        }

        for export in &pe.exports {
            let Some(name) = export.name else { continue };
            let Some(offset) = image_base.checked_add(export.rva as Offset) else {
                log::warn!("ignoring export {} above the address space", name);
                continue;
            };
            let address = Address::flat(offset, bits);
            mapping.labels.push((address, Label::new(name, LabelKind::Function, LabelAccess::Exported, 0)));
        }

        Ok(mapping)
    }

    /// Map a single-architecture Mach-O image.
    fn map_macho(&self, macho: &MachO<'_>) -> Result<Mapping, DisassemblyError> {
        let machine = match macho.header.cputype {
            cputype::CPU_TYPE_I386 => Machine::X86_32,
            cputype::CPU_TYPE_X86_64 => Machine::X86_64,
            cputype::CPU_TYPE_ARM => Machine::Arm,
            cputype::CPU_TYPE_ARM64 => Machine::AArch64,
            cputype::CPU_TYPE_POWERPC => Machine::Ppc32,
            _ => Machine::Unknown,
        };
        let bits = address_bits(machine, macho.is_64);

        let mut mapping = Mapping::new(machine);
        mapping.big_endian = Some(!macho.little_endian);

        for segment in &macho.segments {
            if segment.filesize == 0 || segment.data.is_empty() {
                continue;
            }
            let name = segment.name().unwrap_or("").to_string();
            // VM_PROT_READ = 1, VM_PROT_WRITE = 2, VM_PROT_EXECUTE = 4
            let access = Access {
                read: segment.initprot & 0x1 != 0,
                write: segment.initprot & 0x2 != 0,
                execute: segment.initprot & 0x4 != 0,
            };
            let size = (segment.filesize as usize).min(segment.data.len());
            let base = Address::flat(segment.vmaddr, bits);
            mapping.areas.push(area(name, base, access, &segment.data[..size])?);
        }

        if macho.entry != 0 {
            // LC_MAIN stores a file offset, LC_UNIXTHREAD a virtual address.
            let entry = macho
                .segments
                .iter()
                .find(|s| {
                    s.fileoff <= macho.entry
                        && s.fileoff.checked_add(s.filesize).is_some_and(|end| macho.entry < end)
                        && s.filesize > 0
                })
                .filter(|_| !mapping.areas.iter().any(|a| a.contains(&Address::flat(macho.entry, bits))))
                .and_then(|s| s.vmaddr.checked_add(macho.entry - s.fileoff))
                .unwrap_or(macho.entry);
            mapping.entry_points.push(Address::flat(entry, bits));
        }

        for (name, nlist) in macho.symbols().flatten() {
            if name.is_empty() || nlist.is_undefined() || nlist.n_value == 0 {
                continue;
            }
            let address = Address::flat(nlist.n_value, bits);
            mapping.labels.push((address, Label::new(name, LabelKind::Code, LabelAccess::Global, 0)));
        }

        Ok(mapping)
    }

    fn map_mach(&self, mach: &Mach<'_>) -> Result<Mapping, DisassemblyError> {
        match mach {
            Mach::Binary(binary) => self.map_macho(binary),
            Mach::Fat(fat) => match fat.get(0) {
                Ok(SingleArch::MachO(binary)) => self.map_macho(&binary),
                Ok(SingleArch::Archive(_)) => {
                    Err(DisassemblyError::UnrecognizedFormat("archive inside fat Mach-O".into()))
                }
                Err(e) => Err(DisassemblyError::CorruptInput(e.to_string())),
            },
        }
    }
}

/// Address width for a mapped image; unknown machines fall back to the file class.
fn address_bits(machine: Machine, is_64: bool) -> u8 {
    match machine {
        Machine::Unknown if is_64 => 64,
        Machine::Unknown => 32,
        known => known.address_bits(),
    }
}

/// Area over `bytes` at `base`, rejecting ranges that wrap the address space.
fn area(name: String, base: Address, access: Access, bytes: &[u8]) -> Result<MemoryArea, DisassemblyError> {
    MemoryArea::with_bytes(name.as_str(), base, access, bytes.to_vec()).map_err(|_| {
        DisassemblyError::CorruptInput(format!("{} at {} runs past the end of the address space", name, base))
    })
}

/// Bounds-checked file slice.
fn slice<'a>(input: &'a [u8], offset: u64, size: u64, what: &str) -> Result<&'a [u8], DisassemblyError> {
    let range = usize::try_from(offset)
        .ok()
        .zip(usize::try_from(size).ok())
        .and_then(|(start, len)| Some(start..start.checked_add(len)?));
    range
        .and_then(|range| input.get(range))
        .ok_or_else(|| DisassemblyError::CorruptInput(format!("{} extends past the end of the file", what)))
}

impl fmt::Display for GoblinLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinLoader")
    }
}

impl Loader for GoblinLoader {
    fn name(&self) -> &str {
        "goblin"
    }

    fn recognizes(&self, input: &[u8]) -> bool {
        matches!(Object::parse(input), Ok(Object::Elf(_) | Object::PE(_) | Object::Mach(_)))
    }

    fn map(&self, input: &[u8]) -> Result<Mapping, DisassemblyError> {
        let mapping = match Object::parse(input) {
            Ok(Object::Elf(elf)) => self.map_elf(&elf, input)?,
            Ok(Object::PE(pe)) => self.map_pe(&pe, input)?,
            Ok(Object::Mach(mach)) => self.map_mach(&mach)?,
            Ok(_) => return Err(DisassemblyError::UnrecognizedFormat("Unsupported file format".into())),
            Err(e) => return Err(DisassemblyError::CorruptInput(e.to_string())),
        };
        if mapping.areas.is_empty() {
            return Err(DisassemblyError::CorruptInput("no loadable content".into()));
        }
        log::info!(
            "goblin mapped {} area(s) for {} with {} symbol(s)",
            mapping.areas.len(),
            mapping.machine,
            mapping.labels.len()
        );
        Ok(mapping)
    }
}
