//! Listing renderers for a disassembled database

mod json;
mod csv;

pub use self::json::*;
pub use self::csv::*;

use crate::{Address, Database, DisassemblyError};
use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;
use clap::ValueEnum;

/// Number of raw bytes shown per line of the text listing
const BYTES_PER_LINE: usize = 15;

/// Supported listing formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text listing (default)
    #[default]
    Text,
    /// JSON document with cells, labels and cross references
    Json,
    /// CSV, one row per cell
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::Csv]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ListingFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }

    /// Render the whole database in this format
    pub fn render(&self, database: &Database) -> Result<String, DisassemblyError> {
        self.get_formatter().format(database)
    }
}

/// Formatter trait for database listings
pub trait ListingFormatter {
    /// Render every area, cell, label and cross reference of `database`
    fn format(&self, database: &Database) -> Result<String, DisassemblyError>;
}

/// Format the listing as plain text
pub struct TextFormatter;

/// Format the listing as JSON
pub struct JsonFormatter;

/// Format the listing as CSV
pub struct CsvFormatter;

/// Space separated lowercase hex of `bytes`
pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Raw bytes covered by the cell at `address`, clipped to what is mapped
pub(crate) fn cell_bytes<'a>(database: &'a Database, address: &Address, length: usize) -> &'a [u8] {
    database.read_available(address, length).unwrap_or(&[])
}

impl ListingFormatter for TextFormatter {
    fn format(&self, database: &Database) -> Result<String, DisassemblyError> {
        let mut output = String::new();
        // Writing into a String cannot fail; map for the signature only
        let fail = |e: fmt::Error| DisassemblyError::Generic(format!("text rendering error: {}", e));

        for area in database.memory_areas() {
            writeln!(output, "; area {}", area).map_err(fail)?;

            for (address, cell) in area.iter_cells() {
                if let Some(label) = database.label_for(&address) {
                    writeln!(output, "\n{}:{}:\t{}:", area.name(), address, label.display_name())
                        .map_err(fail)?;
                }

                let bytes = cell_bytes(database, &address, cell.length());
                let mut raw = String::new();
                for i in 0..BYTES_PER_LINE {
                    match bytes.get(i) {
                        Some(b) if i < cell.length() => write!(raw, "{:02x} ", b).map_err(fail)?,
                        _ => raw.push_str("   "),
                    }
                }

                write!(output, "{}:{}: {}\t{}", area.name(), address, raw, cell).map_err(fail)?;

                let xrefs = database.xrefs().to(&address);
                match cell.comment() {
                    Some(comment) => write!(output, " ; {}", comment).map_err(fail)?,
                    None if !xrefs.is_empty() => output.push_str(" ;"),
                    None => {}
                }
                for source in &xrefs {
                    write!(output, " xref:{}", source).map_err(fail)?;
                }
                output.push('\n');
            }
            output.push('\n');
        }

        writeln!(output, "To -- From").map_err(fail)?;
        let mut pairs: Vec<_> = database.xrefs().all_pairs().collect();
        pairs.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
        for (from, to) in pairs {
            writeln!(output, "{}-->{}", to, from).map_err(fail)?;
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Access, Cell, Label, LabelKind, MemoryArea, Reference, ReferenceKind};

    pub(crate) fn listing_database() -> Database {
        let base = Address::flat(0x1000, 32);
        let mut db = Database::new();
        db.add_memory_area(MemoryArea::with_bytes(
            ".text",
            base,
            Access::READ_EXECUTE,
            vec![0x55, 0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3, 0x41, 0x42, 0x00],
        )
        .unwrap())
        .unwrap();

        let at = |o: u64| Address::flat(0x1000 + o, 32);
        db.set_cell(&at(0), Cell::instruction("push", "ebp", 1, true, &at(0)).unwrap()).unwrap();
        db.set_cell(
            &at(1),
            Cell::instruction("call", "0x1006", 5, true, &at(1))
                .unwrap()
                .with_references(vec![Reference::new(at(6), ReferenceKind::Call)]),
        )
        .unwrap();
        db.set_cell(&at(6), Cell::instruction("ret", "", 1, false, &at(6)).unwrap()).unwrap();
        db.set_cell(&at(7), Cell::string("AB", &at(7)).unwrap()).unwrap();
        db.assign_label(&at(0), Label::from_address(&at(0), LabelKind::Function)).unwrap();
        db.assign_label(&at(6), Label::from_address(&at(6), LabelKind::Function)).unwrap();
        db.set_comment(&at(7), "greeting");
        db
    }

    #[test]
    fn test_text_listing_lines() {
        let db = listing_database();
        let result = TextFormatter.format(&db).unwrap();

        assert!(result.contains(".text:00001000:\tfcn_00001000:"));
        assert!(result.contains(".text:00001001: e8 00 00 00 00"));
        assert!(result.contains("call\t0x1006"));
        assert!(result.contains("ret ; xref:00001001"));
        assert!(result.contains("\"AB\", 0 ; greeting"));
    }

    #[test]
    fn test_text_listing_xref_section() {
        let db = listing_database();
        let result = TextFormatter.format(&db).unwrap();

        let section = result.split("To -- From\n").nth(1).unwrap();
        assert_eq!(section, "00001006-->00001001\n");
    }

    #[test]
    fn test_empty_database_renders() {
        let result = OutputFormat::Text.render(&Database::new()).unwrap();
        assert_eq!(result, "To -- From\n");
    }

    #[test]
    fn test_format_selection() {
        for format in OutputFormat::available_formats() {
            let parsed: OutputFormat = format.to_string().parse().unwrap();
            assert_eq!(parsed, *format);
            assert!(format.render(&listing_database()).is_ok());
        }
        assert!("ngram".parse::<OutputFormat>().is_err());
    }
}
