//! Disassembly database and backend negotiation for the Gorgon disassembler.
//!
//! Gorgon maps an executable image into [`MemoryArea`]s, lets a pluggable
//! [`Architecture`](architecture::Architecture) decode bytes into typed
//! [`Cell`]s, and records code, data, strings, [`Label`]s and cross-references
//! in a [`Database`] that can be queried, renamed and persisted.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use gorgon::{
//!     disassembler::DisassemblyOptions,
//!     format::OutputFormat,
//!     session::{Registry, Session},
//! };
//!
//! // Read binary file
//! let binary_data = fs::read("path/to/binary").unwrap();
//!
//! // Pick a loader, an architecture and a default configuration, then run
//! let mut session = Session::new(Registry::with_defaults());
//! let report = session.automatic(&binary_data, &DisassemblyOptions::default()).unwrap();
//! println!("decoded {} cells", report.decoded);
//!
//! // Render the listing
//! let listing = OutputFormat::Text.render(session.database()).unwrap();
//! println!("{}", listing);
//! ```

pub mod address;
pub mod architecture;
pub mod cell;
pub mod configuration;
pub mod database;
pub mod disassembler;
pub mod event;
pub mod format;
pub mod label;
pub mod loader;
pub mod memory_area;
pub mod serialize;
pub mod session;
pub mod xrefs;
#[cfg(feature = "extension-module")]
pub mod python;

use std::fmt;

pub use address::Address;
pub use architecture::DecodeError;
pub use cell::{Cell, CellKind, Payload, Reference, ReferenceKind};
pub use configuration::{Configuration, ConfigurationModel, ConfigValue, OptionDescriptor};
pub use database::Database;
pub use event::{EventHandler, EventScope, LogEventHandler, UpdatedCells};
pub use label::{Label, LabelAccess, LabelKind};
pub use memory_area::{Access, MemoryArea};
pub use session::SessionState;
pub use xrefs::XRefs;

/// Native offset inside an address space
pub type Offset = u64;

/// Machine types a loader can detect and an architecture can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum Machine {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// ARM Thumb mode
    Thumb,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// MIPS 32-bit
    Mips32,
    /// RISC-V 32-bit
    RiscV32,
    /// RISC-V 64-bit
    RiscV64,
    /// PowerPC 32-bit
    Ppc32,
    /// Unknown machine
    Unknown,
}

impl Machine {
    /// Natural width of an address on this machine.
    pub fn address_bits(&self) -> u8 {
        match self {
            Machine::X86_64 | Machine::AArch64 | Machine::RiscV64 => 64,
            _ => 32,
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::X86_32 => write!(f, "x86-32"),
            Machine::X86_64 => write!(f, "x86-64"),
            Machine::Arm => write!(f, "ARM"),
            Machine::Thumb => write!(f, "Thumb"),
            Machine::AArch64 => write!(f, "AArch64"),
            Machine::Mips32 => write!(f, "MIPS32"),
            Machine::RiscV32 => write!(f, "RISC-V 32"),
            Machine::RiscV64 => write!(f, "RISC-V 64"),
            Machine::Ppc32 => write!(f, "PowerPC 32"),
            Machine::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Error type for disassembly operations
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// No loader understands the input
    #[error("Unrecognized format: {0}")]
    UnrecognizedFormat(String),

    /// Input recognized but malformed
    #[error("Corrupt input: {0}")]
    CorruptInput(String),

    /// Access past the mapped range
    #[error("Out of bounds: {length} byte(s) at {address}")]
    OutOfBounds { address: Address, length: usize },

    /// A cell would intersect another one
    #[error("Overlap: {length} byte(s) at {address} intersect the cell at {existing}")]
    Overlap {
        address: Address,
        length: usize,
        existing: Address,
    },

    /// Unknown option or value outside its choices
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Decoder error
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Collision resolution ran out of versions
    #[error("Label space exhausted for {0}")]
    LabelSpaceExhausted(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A cell must cover at least one byte
    #[error("Empty cell at {0}")]
    EmptyCell(Address),

    /// Session step called out of order
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// No registered backend with this name
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// No architecture was proposed or chosen
    #[error("No architecture chosen")]
    NoArchitecture,

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
