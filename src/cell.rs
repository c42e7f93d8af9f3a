//! Typed units of content living inside a memory area.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Address, DisassemblyError, LabelKind};

/// What a cell holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellKind {
    /// Raw, undecoded bytes
    Value,
    /// A decoded instruction
    Code,
    /// Typed data (integers, pointers)
    Data,
    /// A NUL-terminated character string
    String,
}

/// How a reference uses its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    Jump,
    Call,
    Data,
}

impl ReferenceKind {
    /// Label kind given to the target of such a reference, when it has none.
    pub fn label_kind(&self) -> LabelKind {
        match self {
            ReferenceKind::Jump => LabelKind::Code,
            ReferenceKind::Call => LabelKind::Function,
            ReferenceKind::Data => LabelKind::Data,
        }
    }

    /// Whether the target should be decoded as code.
    pub fn is_code(&self) -> bool {
        matches!(self, ReferenceKind::Jump | ReferenceKind::Call)
    }
}

/// An outbound reference discovered while decoding a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub target: Address,
    pub kind: ReferenceKind,
}

impl Reference {
    pub fn new(target: Address, kind: ReferenceKind) -> Self {
        Self { target, kind }
    }
}

/// Semantic payload of a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Undecoded bytes, kept for rendering
    Value(Vec<u8>),
    /// Decoded instruction
    Instruction {
        mnemonic: String,
        operands: String,
        /// Whether execution continues with the next cell
        falls_through: bool,
    },
    /// Little/big endian integer of `width` bytes
    Data { width: u8, value: u64 },
    /// String content without its terminator
    String(String),
}

/// One unit of decoded or undecoded content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    kind: CellKind,
    length: usize,
    comment: Option<String>,
    payload: Payload,
    references: Vec<Reference>,
}

impl Cell {
    fn build(kind: CellKind, length: usize, payload: Payload, at: &Address) -> Result<Self, DisassemblyError> {
        if length == 0 {
            return Err(DisassemblyError::EmptyCell(*at));
        }
        Ok(Self {
            kind,
            length,
            comment: None,
            payload,
            references: Vec::new(),
        })
    }

    /// Undecoded bytes. `at` is only used for error reporting.
    pub fn value(bytes: &[u8], at: &Address) -> Result<Self, DisassemblyError> {
        Self::build(CellKind::Value, bytes.len(), Payload::Value(bytes.to_vec()), at)
    }

    /// A decoded instruction of `length` bytes.
    pub fn instruction(
        mnemonic: impl Into<String>,
        operands: impl Into<String>,
        length: usize,
        falls_through: bool,
        at: &Address,
    ) -> Result<Self, DisassemblyError> {
        let payload = Payload::Instruction {
            mnemonic: mnemonic.into(),
            operands: operands.into(),
            falls_through,
        };
        Self::build(CellKind::Code, length, payload, at)
    }

    /// An integer of `width` bytes.
    pub fn data(width: u8, value: u64, at: &Address) -> Result<Self, DisassemblyError> {
        Self::build(CellKind::Data, width as usize, Payload::Data { width, value }, at)
    }

    /// A string; the cell also covers the terminating NUL.
    pub fn string(text: impl Into<String>, at: &Address) -> Result<Self, DisassemblyError> {
        let text = text.into();
        let length = text.len() + 1;
        Self::build(CellKind::String, length, Payload::String(text), at)
    }

    /// Attach outbound references.
    pub fn with_references(mut self, references: Vec<Reference>) -> Self {
        self.references = references;
        self
    }

    /// Forget every outbound reference to `target`.
    pub(crate) fn drop_references_to(&mut self, target: &Address) {
        self.references.retain(|reference| reference.target != *target);
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    /// Length in bytes, never zero.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn set_comment(&mut self, comment: impl Into<String>) {
        let comment = comment.into();
        self.comment = if comment.is_empty() { None } else { Some(comment) };
    }

    /// Whether the pipeline should decode the next cell after this one.
    pub fn falls_through(&self) -> bool {
        matches!(self.payload, Payload::Instruction { falls_through: true, .. })
    }

    pub fn is_undecoded(&self) -> bool {
        self.kind == CellKind::Value
    }

    /// Kind of auto-label this cell carries, `None` for raw bytes.
    pub fn label_kind(&self) -> Option<LabelKind> {
        match self.kind {
            CellKind::Value => None,
            CellKind::Code => Some(LabelKind::Code),
            CellKind::Data => Some(LabelKind::Data),
            CellKind::String => Some(LabelKind::String),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Value(bytes) => {
                write!(f, "db ")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:#04x}", b)?;
                }
                Ok(())
            }
            Payload::Instruction { mnemonic, operands, .. } => {
                if operands.is_empty() {
                    write!(f, "{}", mnemonic)
                } else {
                    write!(f, "{}\t{}", mnemonic, operands)
                }
            }
            Payload::Data { width, value } => {
                let directive = match width {
                    1 => "db",
                    2 => "dw",
                    4 => "dd",
                    _ => "dq",
                };
                write!(f, "{} {:#x}", directive, value)
            }
            Payload::String(text) => write!(f, "{:?}, 0", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> Address {
        Address::flat(0, 16)
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(Cell::value(&[], &at()), Err(DisassemblyError::EmptyCell(_))));
        assert!(Cell::instruction("nop", "", 0, true, &at()).is_err());
    }

    #[test]
    fn test_string_covers_terminator() {
        let cell = Cell::string("AB", &at()).unwrap();
        assert_eq!(cell.length(), 3);
        assert_eq!(cell.kind(), CellKind::String);
        assert_eq!(cell.to_string(), "\"AB\", 0");
        assert_eq!(cell.label_kind(), Some(LabelKind::String));
    }

    #[test]
    fn test_rendering() {
        let insn = Cell::instruction("mov", "eax, 1", 5, true, &at()).unwrap();
        assert_eq!(insn.to_string(), "mov\teax, 1");
        assert!(insn.falls_through());
        let ret = Cell::instruction("ret", "", 1, false, &at()).unwrap();
        assert_eq!(ret.to_string(), "ret");
        assert!(!ret.falls_through());
        let raw = Cell::value(&[0x41, 0x00], &at()).unwrap();
        assert_eq!(raw.to_string(), "db 0x41, 0x00");
        assert!(raw.label_kind().is_none());
        let dword = Cell::data(4, 0xdead, &at()).unwrap();
        assert_eq!(dword.to_string(), "dd 0xdead");
    }

    #[test]
    fn test_comment() {
        let mut cell = Cell::value(&[0x90], &at()).unwrap();
        assert!(cell.comment().is_none());
        cell.set_comment("entry stub");
        assert_eq!(cell.comment(), Some("entry stub"));
        cell.set_comment("");
        assert!(cell.comment().is_none());
    }
}
