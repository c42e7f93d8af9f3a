//! Python bindings for the gorgon disassembler

use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::exceptions::{PyValueError, PyIOError};
use clap::ValueEnum;
use crate::format::OutputFormat;
use crate::session::{Registry, Session};
use crate::disassembler::{DisassemblyOptions, Traversal};

/// Disassemble binary data with the given traversal and output format
#[pyfunction]
#[pyo3(signature = (binary_data, traversal="recursive", output_format="text"))]
fn disassemble(binary_data: Vec<u8>, traversal: &str, output_format: &str) -> PyResult<String> {
    let traversal = Traversal::from_str(traversal, true)
        .map_err(|_| PyValueError::new_err(format!("Unknown traversal: {}", traversal)))?;
    let output_format: OutputFormat = output_format.parse().map_err(PyValueError::new_err)?;

    let options = DisassemblyOptions {
        traversal,
        ..DisassemblyOptions::default()
    };

    let mut session = Session::new(Registry::with_defaults());
    session
        .automatic(&binary_data, &options)
        .map_err(|e| PyValueError::new_err(format!("Disassembly failed: {}", e)))?;

    output_format
        .render(session.database())
        .map_err(|e| PyValueError::new_err(format!("Failed to format output: {}", e)))
}

/// Disassemble a file with the given traversal and output format
#[pyfunction]
#[pyo3(signature = (file_path, traversal="recursive", output_format="text"))]
fn disassemble_file(file_path: &str, traversal: &str, output_format: &str) -> PyResult<String> {
    let bytes = std::fs::read(file_path)
        .map_err(|e| PyIOError::new_err(format!("Failed to read file {}: {}", file_path, e)))?;

    log::debug!("disassembling file {}", file_path);
    disassemble(bytes, traversal, output_format)
}

/// Python module initialization
#[pymodule]
fn gorgon(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(disassemble, m)?)?;
    m.add_function(wrap_pyfunction!(disassemble_file, m)?)?;

    let py = m.py();
    let output_format = PyDict::new(py);
    for format in OutputFormat::available_formats() {
        output_format.set_item(format.to_string().to_uppercase(), format.to_string())?;
    }
    m.setattr("OutputFormat", output_format)?;

    let traversal = PyDict::new(py);
    traversal.set_item("RECURSIVE", "recursive")?;
    traversal.set_item("SEEDS", "seeds")?;
    traversal.set_item("LINEAR", "linear")?;
    m.setattr("Traversal", traversal)?;

    Ok(())
}
