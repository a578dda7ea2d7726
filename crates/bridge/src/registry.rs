//! Variable Registry
//!
//! Names, types and sizes of the variables a source delivers. Built once at
//! startup and shared read-only afterwards.

use std::collections::HashMap;

use tracing::debug;
use wire_protocol::DataType;

use crate::config::VariableSpec;
use crate::BridgeError;

/// Index of a registered variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableHandle(u32);

impl VariableHandle {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredVariable {
    pub handle: VariableHandle,
    pub name: String,
    pub data_type: DataType,
    /// Value size in bytes
    pub size: usize,
}

#[derive(Debug, Default)]
pub struct VariableRegistry {
    variables: Vec<RegisteredVariable>,
    by_name: HashMap<String, VariableHandle>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register each configured variable in order
    pub fn from_specs(specs: &[VariableSpec]) -> Result<Self, BridgeError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(&spec.name, spec.data_type, spec.size)?;
        }
        Ok(registry)
    }

    /// Register a variable
    ///
    /// Fixed-width types take their size from the type; an explicit size
    /// must agree with it. String and custom types need an explicit size.
    pub fn register(
        &mut self,
        name: &str,
        data_type: DataType,
        size: Option<usize>,
    ) -> Result<VariableHandle, BridgeError> {
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(BridgeError::InvalidVariable {
                name: name.to_string(),
                reason: "name must be 1 to 65535 bytes".to_string(),
            });
        }
        if self.by_name.contains_key(name) {
            return Err(BridgeError::DuplicateVariable(name.to_string()));
        }

        let size = match (data_type.fixed_size(), size) {
            (Some(fixed), None) => fixed,
            (Some(fixed), Some(given)) if fixed == given => fixed,
            (Some(fixed), Some(given)) => {
                return Err(BridgeError::InvalidVariable {
                    name: name.to_string(),
                    reason: format!("{data_type:?} is {fixed} bytes, not {given}"),
                })
            }
            (None, Some(given)) if given > 0 => given,
            (None, _) => {
                return Err(BridgeError::InvalidVariable {
                    name: name.to_string(),
                    reason: format!("{data_type:?} needs a positive size"),
                })
            }
        };

        let handle = VariableHandle(self.variables.len() as u32);
        self.variables.push(RegisteredVariable {
            handle,
            name: name.to_string(),
            data_type,
            size,
        });
        self.by_name.insert(name.to_string(), handle);
        debug!("Registered {} as {:?} ({} bytes)", name, data_type, size);

        Ok(handle)
    }

    pub fn get(&self, handle: VariableHandle) -> Option<&RegisteredVariable> {
        self.variables.get(handle.index())
    }

    pub fn lookup(&self, name: &str) -> Option<VariableHandle> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredVariable> {
        self.variables.iter()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
