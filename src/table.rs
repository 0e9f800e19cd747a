//! Operation table
//!
//! Caller-owned lookup from a logical `(service, method)` pair to the
//! `(command, operation_type)` numbers sent on the wire. Built once at
//! startup and passed by reference; there is no global registry.
//!
//! Tables persist as bincode so a prepared table can be shipped alongside
//! a client binary.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// Wire numbers for one logical method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub command: u32,
    pub operation_type: u32,
}

/// service → method → operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTable {
    services: BTreeMap<String, BTreeMap<String, Operation>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a method, returning the previous entry
    pub fn insert(
        &mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        operation: Operation,
    ) -> Option<Operation> {
        self.services
            .entry(service.into())
            .or_default()
            .insert(method.into(), operation)
    }

    /// Builder-style insert
    pub fn with(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        command: u32,
        operation_type: u32,
    ) -> Self {
        self.insert(
            service,
            method,
            Operation {
                command,
                operation_type,
            },
        );
        self
    }

    pub fn get(&self, service: &str, method: &str) -> Option<Operation> {
        self.services.get(service)?.get(method).copied()
    }

    /// Like `get`, but a missing entry is an error
    pub fn lookup(&self, service: &str, method: &str) -> Result<Operation> {
        self.get(service, method)
            .ok_or_else(|| MuxError::UnknownOperation {
                service: service.to_string(),
                method: method.to_string(),
            })
    }

    /// Every entry in service, method order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Operation)> {
        self.services.iter().flat_map(|(service, methods)| {
            methods
                .iter()
                .map(move |(method, op)| (service.as_str(), method.as_str(), *op))
        })
    }

    /// Number of methods across all services
    pub fn len(&self) -> usize {
        self.services.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a table written by `save`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }

    /// Write the table to `path`, replacing any existing file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}
