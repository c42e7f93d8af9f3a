//! Capstone-backed architecture covering x86, ARM, MIPS, RISC-V and PowerPC.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use capstone::{Arch, Capstone, Endian, Mode, NO_EXTRA_MODE};

use super::{Architecture, DecodeError, BIG_ENDIAN_OPTION, MODE_OPTION};
use crate::{Address, Cell, Configuration, ConfigurationModel, DisassemblyError, Machine, Reference, ReferenceKind};

/// Machines selectable through the `mode` option; the option value is the index.
pub const MACHINES: [Machine; 9] = [
    Machine::X86_32,
    Machine::X86_64,
    Machine::Arm,
    Machine::Thumb,
    Machine::AArch64,
    Machine::Mips32,
    Machine::RiscV32,
    Machine::RiscV64,
    Machine::Ppc32,
];

thread_local! {
    // Simple cache for Capstone instances - key is (arch, mode, endian)
    static CS_POOL: RefCell<HashMap<(Arch, Mode, Endian), Arc<Capstone>>> =
        RefCell::new(HashMap::new());
}

fn pooled(arch: Arch, mode: Mode, endian: Endian) -> Result<Arc<Capstone>, capstone::Error> {
    CS_POOL.with(|cell| {
        let mut map = cell.borrow_mut();
        if let Some(cs) = map.get(&(arch, mode, endian)) {
            return Ok(Arc::clone(cs));
        }
        let cs = Arc::new(Capstone::new_raw(arch, mode, NO_EXTRA_MODE, Some(endian))?);
        map.insert((arch, mode, endian), Arc::clone(&cs));
        Ok(cs)
    })
}

/// Control-flow effect of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Sequential,
    Jump { conditional: bool },
    Call,
    Return,
    Stop,
}

impl Flow {
    fn falls_through(&self) -> bool {
        match self {
            Flow::Sequential | Flow::Call => true,
            Flow::Jump { conditional } => *conditional,
            Flow::Return | Flow::Stop => false,
        }
    }
}

/// Capstone decoder configured through a [`ConfigurationModel`].
#[derive(Debug, Clone)]
pub struct CapstoneArchitecture {
    machine: Machine,
    big_endian: bool,
}

impl Default for CapstoneArchitecture {
    fn default() -> Self {
        Self::new(Machine::X86_64)
    }
}

impl CapstoneArchitecture {
    pub fn new(machine: Machine) -> Self {
        Self { machine, big_endian: machine == Machine::Ppc32 }
    }

    /// Machine currently decoded.
    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Get Arch, Mode, Endian for the configured machine
    fn arch_mode_endian(&self) -> Result<(Arch, Mode, Endian), DisassemblyError> {
        let endian = if self.big_endian { Endian::Big } else { Endian::Little };
        let triple = match self.machine {
            Machine::X86_32 => (Arch::X86, Mode::Mode32, Endian::Little),
            Machine::X86_64 => (Arch::X86, Mode::Mode64, Endian::Little),
            Machine::Arm => (Arch::ARM, Mode::Arm, endian),
            Machine::Thumb => (Arch::ARM, Mode::Thumb, endian),
            Machine::AArch64 => (Arch::ARM64, Mode::Arm, endian),
            Machine::Mips32 => (Arch::MIPS, Mode::Mips32, endian),
            Machine::RiscV32 => (Arch::RISCV, Mode::RiscV32, Endian::Little),
            Machine::RiscV64 => (Arch::RISCV, Mode::RiscV64, Endian::Little),
            Machine::Ppc32 => (Arch::PPC, Mode::Mode32, endian),
            other => {
                return Err(DisassemblyError::InvalidConfiguration(format!(
                    "capstone cannot decode {}",
                    other
                )))
            }
        };
        Ok(triple)
    }

    fn is_x86(&self) -> bool {
        matches!(self.machine, Machine::X86_32 | Machine::X86_64)
    }
}

impl Architecture for CapstoneArchitecture {
    fn name(&self) -> &str {
        "capstone"
    }

    fn supports(&self, machine: Machine) -> bool {
        MACHINES.contains(&machine)
    }

    fn fill_configuration_model(&self, model: &mut ConfigurationModel) -> Result<(), DisassemblyError> {
        let default = MACHINES.iter().position(|m| *m == self.machine).unwrap_or(0) as u32;
        model.insert_enum(
            MODE_OPTION,
            MACHINES.iter().enumerate().map(|(i, m)| (m.to_string(), i as u32)),
            default,
        )?;
        model.insert_bool(BIG_ENDIAN_OPTION, self.big_endian)
    }

    fn apply_configuration(&mut self, configuration: &Configuration) -> Result<(), DisassemblyError> {
        let mut next = self.clone();
        if let Some(value) = configuration.get_enum(MODE_OPTION) {
            next.machine = *MACHINES.get(value as usize).ok_or_else(|| {
                DisassemblyError::InvalidConfiguration(format!("{} is not a valid choice for '{}'", value, MODE_OPTION))
            })?;
        }
        if let Some(big_endian) = configuration.get_bool(BIG_ENDIAN_OPTION) {
            next.big_endian = big_endian;
        }

        // Make sure capstone accepts the combination before committing to it.
        let (arch, mode, endian) = next.arch_mode_endian()?;
        pooled(arch, mode, endian).map_err(|e| {
            DisassemblyError::InvalidConfiguration(format!("capstone rejected {}: {}", next.machine, e))
        })?;

        log::info!(
            "capstone configured for {} ({} endian)",
            next.machine,
            if next.big_endian { "big" } else { "little" }
        );
        *self = next;
        Ok(())
    }

    fn decode(&self, bytes: &[u8], address: &Address) -> Result<Cell, DecodeError> {
        let (arch, mode, endian) = self
            .arch_mode_endian()
            .map_err(|e| DecodeError::new(*address, e.to_string()))?;
        let cs = pooled(arch, mode, endian).map_err(|e| DecodeError::new(*address, e.to_string()))?;

        let insns = cs
            .disasm_count(bytes, address.offset(), 1)
            .map_err(|e| DecodeError::new(*address, e.to_string()))?;
        let insn = insns
            .iter()
            .next()
            .ok_or_else(|| DecodeError::new(*address, "invalid instruction"))?;

        // Ensure instruction starts at the address we requested
        if insn.address() != address.offset() {
            return Err(DecodeError::new(*address, "decoder skipped bytes"));
        }

        let mnemonic = insn.mnemonic().unwrap_or("").to_string();
        let operands = insn.op_str().unwrap_or("").to_string();
        let length = insn.bytes().len();

        let flow = if self.is_x86() {
            classify_x86(&mnemonic)
        } else {
            classify_risc(&mnemonic, &operands)
        };

        let mut references = Vec::new();
        match flow {
            Flow::Jump { .. } | Flow::Call => {
                if let Some(target) = branch_target(&operands) {
                    let kind = if flow == Flow::Call { ReferenceKind::Call } else { ReferenceKind::Jump };
                    references.push(Reference::new(address.with_offset(target), kind));
                }
            }
            Flow::Sequential if self.is_x86() => {
                let next = address.offset().wrapping_add(length as u64);
                if let Some(target) = memory_target(&operands, next) {
                    references.push(Reference::new(address.with_offset(target), ReferenceKind::Data));
                }
            }
            _ => {}
        }

        Cell::instruction(mnemonic, operands, length, flow.falls_through(), address)
            .map(|cell| cell.with_references(references))
            .map_err(|e| DecodeError::new(*address, e.to_string()))
    }
}

fn classify_x86(mnemonic: &str) -> Flow {
    let mnemonic = mnemonic.to_lowercase();
    let mnemonic = mnemonic.trim_start_matches("bnd ").trim_start_matches("notrack ");
    match mnemonic {
        "ret" | "retf" | "retn" | "iret" | "iretd" | "iretq" | "sysret" | "sysexit" => Flow::Return,
        "jmp" | "ljmp" => Flow::Jump { conditional: false },
        "hlt" | "ud2" => Flow::Stop,
        m if m.starts_with("call") || m == "lcall" => Flow::Call,
        m if m.starts_with('j') || m.starts_with("loop") => Flow::Jump { conditional: true },
        _ => Flow::Sequential,
    }
}

const CONDITIONS: [&str; 18] = [
    "eq", "ne", "cs", "hs", "cc", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le", "al", "nv",
];

fn classify_risc(mnemonic: &str, operands: &str) -> Flow {
    let lower = mnemonic.to_lowercase();
    // Width qualifiers (`b.w`) and the compressed RISC-V prefix (`c.j`)
    let m = lower.trim_end_matches(".w").trim_end_matches(".n");
    let m = m.strip_prefix("c.").unwrap_or(m);
    let ops = operands.to_lowercase();

    if m == "ret" || m == "eret" || m == "mret" || m == "sret" || (m == "blr" && ops.is_empty()) {
        return Flow::Return;
    }
    if (m == "bx" && ops == "lr") || (m == "jr" && (ops == "ra" || ops == "$ra")) {
        return Flow::Return;
    }
    if (m == "pop" || m == "ldm" || m == "ldmia") && ops.contains("pc") {
        return Flow::Return;
    }

    match m {
        "bl" | "blx" | "blr" | "bla" | "bctrl" | "jal" | "jalr" | "bal" | "call" => return Flow::Call,
        "b" | "ba" | "j" | "jr" | "br" | "bx" | "bctr" | "tail" => return Flow::Jump { conditional: false },
        _ => {}
    }

    // `b<cond>`, `b.<cond>`, `bl<cond>` on ARM
    if let Some(rest) = m.strip_prefix("bl") {
        if CONDITIONS.contains(&rest) {
            return Flow::Call;
        }
    }
    if let Some(rest) = m.strip_prefix('b') {
        let rest = rest.trim_start_matches('.').trim_start_matches("c.");
        if CONDITIONS.contains(&rest) {
            return Flow::Jump { conditional: rest != "al" };
        }
    }

    match m {
        // ARM, AArch64
        "cbz" | "cbnz" | "tbz" | "tbnz"
        // MIPS, RISC-V
        | "beqz" | "bnez" | "bgez" | "bgtz" | "blez" | "bltz" | "bltu" | "bgeu" | "beql" | "bnel"
        // PowerPC
        | "bc" | "bdnz" | "bdz" | "bso" | "bns" => Flow::Jump { conditional: true },
        _ => Flow::Sequential,
    }
}

/// Last hexadecimal immediate of a branch operand list, if the target is direct.
fn branch_target(operands: &str) -> Option<u64> {
    let ops = operands.to_lowercase();
    if ops.contains('[') {
        return None;
    }
    let idx = ops.rfind("0x")?;
    parse_hex(&ops[idx + 2..])
}

/// Absolute or rip-relative memory operand of an x86 instruction.
fn memory_target(operands: &str, next: u64) -> Option<u64> {
    let ops = operands.to_lowercase();
    let open = ops.find('[')?;
    let close = ops[open..].find(']')? + open;
    let inner = ops[open + 1..close].trim();

    if let Some(rest) = inner.strip_prefix("rip") {
        let rest = rest.trim_start();
        let (negative, rest) = match rest.chars().next()? {
            '+' => (false, &rest[1..]),
            '-' => (true, &rest[1..]),
            _ => return None,
        };
        let disp = parse_hex(rest.trim().strip_prefix("0x")?)?;
        return Some(if negative { next.wrapping_sub(disp) } else { next.wrapping_add(disp) });
    }

    let absolute = inner.rsplit(':').next()?.trim();
    parse_hex(absolute.strip_prefix("0x")?).filter(|_| {
        absolute[2..].chars().all(|c| c.is_ascii_hexdigit())
    })
}

fn parse_hex(text: &str) -> Option<u64> {
    // Find the end of the hex value (space, comma, or end of string)
    let end = text.find(|c: char| !c.is_ascii_hexdigit()).unwrap_or(text.len());
    if end == 0 {
        return None;
    }
    u64::from_str_radix(&text[..end], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CellKind, Payload};
    use rstest::rstest;

    fn at(offset: u64) -> Address {
        Address::flat(offset, 32)
    }

    fn configured(machine: Machine) -> CapstoneArchitecture {
        let arch = CapstoneArchitecture::default();
        let mut model = ConfigurationModel::new();
        arch.fill_configuration_model(&mut model).unwrap();
        model.set_from_str(MODE_OPTION, &machine.to_string()).unwrap();
        let mut arch = arch;
        arch.apply_configuration(model.configuration()).unwrap();
        arch
    }

    #[test]
    fn test_x86_decode() {
        // mov eax, 1
        let bytes = [0xb8, 0x01, 0x00, 0x00, 0x00];
        let arch = configured(Machine::X86_32);
        let cell = arch.decode(&bytes, &at(0)).unwrap();
        assert_eq!(cell.kind(), CellKind::Code);
        assert_eq!(cell.length(), 5);
        assert!(cell.falls_through());
        assert!(cell.references().is_empty());
        match cell.payload() {
            Payload::Instruction { mnemonic, operands, .. } => {
                assert_eq!(mnemonic, "mov");
                assert_eq!(operands, "eax, 1");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_x86_jump_and_call_targets() {
        let arch = configured(Machine::X86_32);

        // jmp 0x10
        let jmp = arch.decode(&[0xeb, 0x0e], &at(0)).unwrap();
        assert!(!jmp.falls_through());
        assert_eq!(jmp.references(), &[Reference::new(at(0x10), ReferenceKind::Jump)]);

        // call 0xa
        let call = arch.decode(&[0xe8, 0x05, 0x00, 0x00, 0x00], &at(0)).unwrap();
        assert!(call.falls_through());
        assert_eq!(call.references(), &[Reference::new(at(0xa), ReferenceKind::Call)]);

        let ret = arch.decode(&[0xc3], &at(0)).unwrap();
        assert!(!ret.falls_through());
    }

    #[test]
    fn test_x86_64_rip_relative_data_reference() {
        // mov rax, qword ptr [rip + 0x10]
        let arch = configured(Machine::X86_64);
        let cell = arch.decode(&[0x48, 0x8b, 0x05, 0x10, 0x00, 0x00, 0x00], &Address::flat(0x1000, 64)).unwrap();
        assert_eq!(cell.length(), 7);
        assert_eq!(cell.references(), &[Reference::new(Address::flat(0x1017, 64), ReferenceKind::Data)]);
    }

    #[test]
    fn test_empty_input_is_decode_error() {
        let arch = configured(Machine::X86_32);
        let err = arch.decode(&[], &at(4)).unwrap_err();
        assert_eq!(err.address, at(4));
    }

    #[test]
    fn test_mode_rejection_keeps_configuration() {
        let arch = CapstoneArchitecture::default();
        let mut model = ConfigurationModel::new();
        arch.fill_configuration_model(&mut model).unwrap();
        let before = model.configuration().clone();
        assert!(matches!(
            model.set(MODE_OPTION, crate::ConfigValue::Enum(99)),
            Err(DisassemblyError::InvalidConfiguration(_))
        ));
        assert_eq!(model.configuration(), &before);
    }

    #[test]
    fn test_supports() {
        let arch = CapstoneArchitecture::default();
        assert!(arch.supports(Machine::AArch64));
        assert!(!arch.supports(Machine::Unknown));
    }

    #[rstest]
    #[case("jmp", Flow::Jump { conditional: false })]
    #[case("jne", Flow::Jump { conditional: true })]
    #[case("call", Flow::Call)]
    #[case("ret", Flow::Return)]
    #[case("bswap", Flow::Sequential)]
    #[case("hlt", Flow::Stop)]
    fn test_classify_x86(#[case] mnemonic: &str, #[case] expected: Flow) {
        assert_eq!(classify_x86(mnemonic), expected);
    }

    #[rstest]
    #[case("b", "#0x100", Flow::Jump { conditional: false })]
    #[case("bne", "#0x100", Flow::Jump { conditional: true })]
    #[case("b.eq", "#0x100", Flow::Jump { conditional: true })]
    #[case("bl", "#0x100", Flow::Call)]
    #[case("bx", "lr", Flow::Return)]
    #[case("bic", "r0, r1, #0x10", Flow::Sequential)]
    #[case("jal", "0x40", Flow::Call)]
    #[case("jr", "$ra", Flow::Return)]
    #[case("beqz", "a0, 0x20", Flow::Jump { conditional: true })]
    #[case("blr", "", Flow::Return)]
    #[case("blr", "x8", Flow::Call)]
    #[case("pop", "{r4, pc}", Flow::Return)]
    fn test_classify_risc(#[case] mnemonic: &str, #[case] operands: &str, #[case] expected: Flow) {
        assert_eq!(classify_risc(mnemonic, operands), expected);
    }

    #[rstest]
    #[case("0x1234", Some(0x1234))]
    #[case("#0x100", Some(0x100))]
    #[case("a0, zero, 0x20", Some(0x20))]
    #[case("qword ptr [rip + 0x10]", None)]
    #[case("eax", None)]
    fn test_branch_target(#[case] operands: &str, #[case] expected: Option<u64>) {
        assert_eq!(branch_target(operands), expected);
    }

    #[rstest]
    #[case("eax, dword ptr [0x4010]", Some(0x4010))]
    #[case("dword ptr ds:[0x4010], 1", Some(0x4010))]
    #[case("rax, qword ptr [rip - 0x8]", Some(0xff8))]
    #[case("eax, dword ptr [ebx + 4]", None)]
    #[case("eax, 1", None)]
    fn test_memory_target(#[case] operands: &str, #[case] expected: Option<u64>) {
        assert_eq!(memory_target(operands, 0x1000), expected);
    }
}
