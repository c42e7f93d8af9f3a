//! JSON listing formatter

use serde::{Serialize, Deserialize};

use crate::{Database, DisassemblyError};
use super::{cell_bytes, hex_bytes, ListingFormatter};

/// Serializable cell for JSON output
#[derive(Serialize, Deserialize)]
struct CellJson {
    /// Address of the cell
    address: String,
    /// Cell kind ("code", "data", "string", "value")
    kind: String,
    /// Length in bytes
    length: usize,
    /// Rendered text of the cell
    text: String,
    /// Covered bytes as hex string
    bytes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
    /// Addresses referencing this cell
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    xrefs: Vec<String>,
}

/// Serializable memory area for JSON output
#[derive(Serialize, Deserialize)]
struct AreaJson {
    name: String,
    start: String,
    size: usize,
    access: String,
    cells: Vec<CellJson>,
}

/// Serializable cross reference
#[derive(Serialize, Deserialize)]
struct XRefJson {
    from: String,
    to: String,
}

/// Serializable listing for JSON output
#[derive(Serialize, Deserialize)]
struct ListingJson {
    areas: Vec<AreaJson>,
    xrefs: Vec<XRefJson>,
}

impl ListingFormatter for super::JsonFormatter {
    fn format(&self, database: &Database) -> Result<String, DisassemblyError> {
        let areas = database
            .memory_areas()
            .map(|area| AreaJson {
                name: area.name().to_string(),
                start: area.start().to_string(),
                size: area.size(),
                access: area.access().to_string(),
                cells: area
                    .iter_cells()
                    .map(|(address, cell)| CellJson {
                        address: address.to_string(),
                        kind: format!("{:?}", cell.kind()).to_lowercase(),
                        length: cell.length(),
                        text: cell.to_string(),
                        bytes: hex_bytes(cell_bytes(database, &address, cell.length())),
                        label: database.label_for(&address).map(|l| l.display_name()),
                        comment: cell.comment().map(str::to_string),
                        xrefs: database.xrefs().to(&address).iter().map(|a| a.to_string()).collect(),
                    })
                    .collect(),
            })
            .collect();

        let xrefs = database
            .xrefs()
            .all_pairs()
            .map(|(from, to)| XRefJson {
                from: from.to_string(),
                to: to.to_string(),
            })
            .collect();

        serde_json::to_string_pretty(&ListingJson { areas, xrefs })
            .map_err(|e| DisassemblyError::Generic(format!("JSON serialization error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{tests::listing_database, JsonFormatter};

    #[test]
    fn test_json_listing() {
        let db = listing_database();
        let result = JsonFormatter.format(&db).unwrap();
        let listing: ListingJson = serde_json::from_str(&result).unwrap();

        assert_eq!(listing.areas.len(), 1);
        let cells = &listing.areas[0].cells;
        assert_eq!(cells.len(), 4);

        assert_eq!(cells[0].label.as_deref(), Some("fcn_00001000"));
        assert_eq!(cells[1].bytes, "e8 00 00 00 00");
        assert_eq!(cells[2].xrefs, vec!["00001001".to_string()]);
        assert_eq!(cells[3].kind, "string");
        assert_eq!(cells[3].comment.as_deref(), Some("greeting"));

        assert_eq!(listing.xrefs.len(), 1);
        assert_eq!(listing.xrefs[0].from, "00001001");
        assert_eq!(listing.xrefs[0].to, "00001006");
    }
}
