//! Backend registry and the per-input analysis session.
//!
//! A [`Session`] walks `Unloaded → Mapped → ArchitectureChosen → Configured →
//! Disassembled → Saved → Closed`. Every step checks the current state and
//! fails with `InvalidState` when called out of order; a failing step leaves
//! the session where it was.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::architecture::{Architecture, CapstoneArchitecture};
use crate::disassembler::{Disassembler, DisassemblyOptions, DisassemblyReport, Interrupt};
use crate::loader::{GoblinLoader, Loader, Mapping, RawLoader};
use crate::serialize::Serializer;
use crate::{Address, ConfigurationModel, Database, DisassemblyError, EventHandler};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Unloaded,
    Mapped,
    ArchitectureChosen,
    Configured,
    Disassembled,
    Saved,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Mapped => "mapped",
            SessionState::ArchitectureChosen => "architecture chosen",
            SessionState::Configured => "configured",
            SessionState::Disassembled => "disassembled",
            SessionState::Saved => "saved",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Available loaders and architectures, in priority order.
#[derive(Default)]
pub struct Registry {
    loaders: Vec<Box<dyn Loader>>,
    architectures: Vec<Box<dyn Architecture>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Goblin and raw loaders with the Capstone architecture.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_loader(GoblinLoader::new())
            .with_loader(RawLoader::default())
            .with_architecture(CapstoneArchitecture::default())
    }

    pub fn with_loader(mut self, loader: impl Loader + 'static) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }

    pub fn with_architecture(mut self, architecture: impl Architecture + 'static) -> Self {
        self.architectures.push(Box::new(architecture));
        self
    }

    pub fn loader_names(&self) -> Vec<&str> {
        self.loaders.iter().map(|l| l.name()).collect()
    }

    pub fn architecture_names(&self) -> Vec<&str> {
        self.architectures.iter().map(|a| a.name()).collect()
    }

    fn loader_index(&self, name: &str) -> Result<usize, DisassemblyError> {
        self.loaders
            .iter()
            .position(|l| l.name() == name)
            .ok_or_else(|| DisassemblyError::UnknownBackend(name.to_string()))
    }

    fn architecture_index(&self, name: &str) -> Result<usize, DisassemblyError> {
        self.architectures
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| DisassemblyError::UnknownBackend(name.to_string()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("loaders", &self.loader_names())
            .field("architectures", &self.architecture_names())
            .finish()
    }
}

/// One analysis of one input.
pub struct Session {
    registry: Registry,
    state: SessionState,
    database: Database,
    mapping: Option<Mapping>,
    loader: Option<usize>,
    architecture: Option<usize>,
    model: ConfigurationModel,
    interrupt: Interrupt,
    report: Option<DisassemblyReport>,
}

impl Session {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            state: SessionState::Unloaded,
            database: Database::new(),
            mapping: None,
            loader: None,
            architecture: None,
            model: ConfigurationModel::new(),
            interrupt: Interrupt::new(),
            report: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Mutable access for user edits (labels, comments, event subscriptions).
    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    /// Handle to stop a running pass between two cells.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Report of the last pass.
    pub fn report(&self) -> Option<&DisassemblyReport> {
        self.report.as_ref()
    }

    pub fn loader_name(&self) -> Option<&str> {
        self.loader.map(|i| self.registry.loaders[i].name())
    }

    pub fn architecture_name(&self) -> Option<&str> {
        self.architecture.map(|i| self.registry.architectures[i].name())
    }

    fn require(&self, expected: SessionState) -> Result<(), DisassemblyError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DisassemblyError::InvalidState { expected, actual: self.state })
        }
    }

    /// Names of the loaders recognizing `input`, in priority order.
    pub fn supported_loaders(&self, input: &[u8]) -> Vec<&str> {
        self.registry
            .loaders
            .iter()
            .filter(|l| l.recognizes(input))
            .map(|l| l.name())
            .collect()
    }

    /// Map `input` with the named loader, or the first one recognizing it.
    ///
    /// All or nothing: on error the database is untouched and the session
    /// stays `Unloaded`, so the driver may retry with another loader.
    pub fn map(&mut self, loader: Option<&str>, input: &[u8]) -> Result<(), DisassemblyError> {
        self.require(SessionState::Unloaded)?;
        let index = match loader {
            Some(name) => self.registry.loader_index(name)?,
            None => self
                .registry
                .loaders
                .iter()
                .position(|l| l.recognizes(input))
                .ok_or_else(|| DisassemblyError::UnrecognizedFormat("no loader recognizes the input".into()))?,
        };

        let loader = &self.registry.loaders[index];
        let mapping = loader.map(input)?;
        let database = mapping.to_database()?;
        log::info!(
            "{} mapped {} area(s), {} entry point(s)",
            loader.name(),
            mapping.areas.len(),
            mapping.entry_points.len()
        );

        self.database = database;
        self.mapping = Some(mapping);
        self.loader = Some(index);
        self.state = SessionState::Mapped;
        Ok(())
    }

    /// Architecture the loader proposes for the mapped input.
    pub fn propose_architecture(&self) -> Option<&str> {
        let mapping = self.mapping.as_ref()?;
        let loader = &self.registry.loaders[self.loader?];
        let index = loader.propose_architecture(mapping, &self.registry.architectures)?;
        self.registry.architectures.get(index).map(|a| a.name())
    }

    /// Pick the named architecture, or the proposed one, and build its
    /// configuration model.
    pub fn choose_architecture(&mut self, name: Option<&str>) -> Result<(), DisassemblyError> {
        self.require(SessionState::Mapped)?;
        let index = match name {
            Some(name) => self.registry.architecture_index(name)?,
            None => {
                let proposed = self.propose_architecture().ok_or(DisassemblyError::NoArchitecture)?;
                self.registry.architecture_index(proposed)?
            }
        };

        let mut model = ConfigurationModel::new();
        self.registry.architectures[index].fill_configuration_model(&mut model)?;
        if let (Some(mapping), Some(loader)) = (&self.mapping, self.loader) {
            self.registry.loaders[loader].configure(mapping, &mut model)?;
        }

        log::info!("architecture {} with {} option(s)", self.registry.architectures[index].name(), model.len());
        self.model = model;
        self.architecture = Some(index);
        self.state = SessionState::ArchitectureChosen;
        Ok(())
    }

    pub fn configuration_model(&self) -> &ConfigurationModel {
        &self.model
    }

    /// Model to fill before [`configure`](Self::configure).
    pub fn configuration_model_mut(&mut self) -> Result<&mut ConfigurationModel, DisassemblyError> {
        self.require(SessionState::ArchitectureChosen)?;
        Ok(&mut self.model)
    }

    /// Hand the finalized configuration to the architecture.
    pub fn configure(&mut self) -> Result<(), DisassemblyError> {
        self.require(SessionState::ArchitectureChosen)?;
        let index = self.architecture.ok_or(DisassemblyError::NoArchitecture)?;
        self.registry.architectures[index].apply_configuration(self.model.configuration())?;
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Run the pipeline from the loader's entry points.
    ///
    /// An interrupted pass still completes the transition; the report says so.
    pub fn disassemble(&mut self, options: &DisassemblyOptions) -> Result<DisassemblyReport, DisassemblyError> {
        self.run_pipeline(options, None)
    }

    /// [`disassemble`](Self::disassemble) with `handler` subscribed for the
    /// length of the pass only.
    pub fn disassemble_observed(
        &mut self,
        options: &DisassemblyOptions,
        handler: Box<dyn EventHandler>,
    ) -> Result<DisassemblyReport, DisassemblyError> {
        self.run_pipeline(options, Some(handler))
    }

    fn run_pipeline(
        &mut self,
        options: &DisassemblyOptions,
        handler: Option<Box<dyn EventHandler>>,
    ) -> Result<DisassemblyReport, DisassemblyError> {
        self.require(SessionState::Configured)?;
        let index = self.architecture.ok_or(DisassemblyError::NoArchitecture)?;

        let mut seeds: Vec<Address> = self.mapping.as_ref().map(|m| m.entry_points.clone()).unwrap_or_default();
        if seeds.is_empty() {
            seeds.extend(self.database.memory_areas().find(|a| a.is_executable()).map(|a| a.start()));
        }

        let architecture = self.registry.architectures[index].as_ref();
        let disassembler = Disassembler::new(architecture, options.clone()).with_interrupt(self.interrupt.clone());
        let report = match handler {
            Some(handler) => {
                let mut scope = self.database.subscribe(handler);
                disassembler.run(&mut scope, &seeds)?
            }
            None => disassembler.run(&mut self.database, &seeds)?,
        };

        self.report = Some(report.clone());
        self.state = SessionState::Disassembled;
        Ok(report)
    }

    /// Persist the database to `store`. May be repeated once saved.
    pub fn save(&mut self, serializer: &dyn Serializer, store: &str) -> Result<(), DisassemblyError> {
        if self.state != SessionState::Saved {
            self.require(SessionState::Disassembled)?;
        }
        let handle = serializer.open(store)?;
        serializer.save(&handle, &self.database)?;
        log::info!("saved to {}", handle);
        self.state = SessionState::Saved;
        Ok(())
    }

    /// Release everything and hand back the database.
    pub fn close(&mut self) -> Result<Database, DisassemblyError> {
        if self.state == SessionState::Closed {
            return Err(DisassemblyError::InvalidState {
                expected: SessionState::Saved,
                actual: SessionState::Closed,
            });
        }
        self.database.stop_event_handling();
        self.mapping = None;
        self.model = ConfigurationModel::new();
        self.state = SessionState::Closed;
        Ok(std::mem::take(&mut self.database))
    }

    /// Map, choose, configure with defaults and disassemble in one go.
    pub fn automatic(&mut self, input: &[u8], options: &DisassemblyOptions) -> Result<DisassemblyReport, DisassemblyError> {
        self.map(None, input)?;
        self.choose_architecture(None)?;
        self.configure()?;
        self.disassemble(options)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("loader", &self.loader_name())
            .field("architecture", &self.architecture_name())
            .finish()
    }
}
