//! Instruction-set backends.
//!
//! An [`Architecture`] declares the options it needs in a
//! [`ConfigurationModel`], consumes the finalized [`Configuration`], and then
//! decodes one cell at a time. It never touches the database itself: the
//! disassembly pipeline owns every write.

pub mod capstone;

use crate::{Address, Cell, Configuration, ConfigurationModel, Database, DisassemblyError, Machine};

pub use self::capstone::CapstoneArchitecture;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// Name of the enum option selecting the decoding mode.
///
/// Loaders preselect it by the label of the detected [`Machine`].
pub const MODE_OPTION: &str = "mode";

/// Name of the bool option selecting big-endian decoding.
pub const BIG_ENDIAN_OPTION: &str = "big_endian";

/// Failure to decode the bytes at one address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Decode error at {address}: {reason}")]
pub struct DecodeError {
    pub address: Address,
    pub reason: String,
}

impl DecodeError {
    pub fn new(address: Address, reason: impl Into<String>) -> Self {
        Self { address, reason: reason.into() }
    }
}

/// Architecture trait: decodes bytes into cells.
pub trait Architecture: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Whether this backend can decode code for `machine`.
    fn supports(&self, machine: Machine) -> bool {
        let _ = machine;
        false
    }

    /// Declare every option this backend needs.
    fn fill_configuration_model(&self, model: &mut ConfigurationModel) -> Result<(), DisassemblyError>;

    /// Consume the finalized configuration.
    fn apply_configuration(&mut self, configuration: &Configuration) -> Result<(), DisassemblyError>;

    /// Decode one cell from `bytes`, which start at `address`.
    ///
    /// `bytes` holds at most [`max_instruction_size`](Self::max_instruction_size)
    /// bytes and may be shorter at the end of an area. Outbound references
    /// are attached to the returned cell.
    fn decode(&self, bytes: &[u8], address: &Address) -> Result<Cell, DecodeError>;

    /// Upper bound of a single decoded cell.
    fn max_instruction_size(&self) -> usize {
        MAX_INSTRUCTION_SIZE
    }

    /// Extra seeds the backend knows about, e.g. reset vectors.
    fn entry_points(&self, database: &Database) -> Vec<Address> {
        let _ = database;
        Vec::new()
    }
}
