//! CSV listing formatter

use crate::{Database, DisassemblyError};
use super::{cell_bytes, hex_bytes, ListingFormatter};

const HEADER: [&str; 8] = ["area", "address", "kind", "length", "label", "text", "bytes", "comment"];

impl ListingFormatter for super::CsvFormatter {
    fn format(&self, database: &Database) -> Result<String, DisassemblyError> {
        let mut writer = ::csv::WriterBuilder::new().from_writer(Vec::new());
        let fail = |e: ::csv::Error| DisassemblyError::Generic(format!("CSV serialization error: {}", e));

        writer.write_record(HEADER).map_err(fail)?;

        for area in database.memory_areas() {
            for (address, cell) in area.iter_cells() {
                let label = database
                    .label_for(&address)
                    .map(|l| l.display_name())
                    .unwrap_or_default();
                writer
                    .write_record([
                        area.name().to_string(),
                        address.to_string(),
                        format!("{:?}", cell.kind()).to_lowercase(),
                        cell.length().to_string(),
                        label,
                        cell.to_string(),
                        hex_bytes(cell_bytes(database, &address, cell.length())),
                        cell.comment().unwrap_or_default().to_string(),
                    ])
                    .map_err(fail)?;
            }
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| DisassemblyError::Generic(format!("CSV serialization error: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| DisassemblyError::Generic(format!("CSV output is not UTF-8: {}", e)))
    }
}
