//! Configuration for sandbox creation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AbiError, Result};

/// Default callback table capacity.
pub const DEFAULT_MAX_CALLBACKS: usize = 128;

/// Configuration for creating a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Treat creation failures as fatal (default) instead of returning them
    pub infallible: bool,

    /// Maximum heap size in bytes (0 = runtime default)
    ///
    /// Non-zero values are rounded to at least one page and the next power
    /// of two, capped at 4GB.
    pub max_heap_size: u64,

    /// Module name prefixed to the runtime info symbol
    pub module_name: String,

    /// Instance arguments (capability model argc/argv)
    pub args: Vec<String>,

    /// Callback table capacity
    pub max_callbacks: usize,

    /// Require the flat heap base to be 4GB aligned on 64-bit hosts
    pub require_aligned_heap: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            infallible: true,
            max_heap_size: 0,
            module_name: String::new(),
            args: Vec::new(),
            max_callbacks: DEFAULT_MAX_CALLBACKS,
            require_aligned_heap: false,
        }
    }
}

impl SandboxConfig {
    /// Config that reports creation failures instead of aborting
    pub fn fallible() -> Self {
        Self {
            infallible: false,
            ..Default::default()
        }
    }

    /// Config for hosts relying on context-free pointer swizzling
    pub fn aligned() -> Self {
        Self {
            require_aligned_heap: true,
            ..Default::default()
        }
    }

    /// Builder: set failure mode
    pub fn infallible(mut self, infallible: bool) -> Self {
        self.infallible = infallible;
        self
    }

    /// Builder: set maximum heap size
    pub fn max_heap_size(mut self, bytes: u64) -> Self {
        self.max_heap_size = bytes;
        self
    }

    /// Builder: set module name
    pub fn module_name(mut self, name: impl Into<String>) -> Self {
        self.module_name = name.into();
        self
    }

    /// Builder: add instance argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder: set callback table capacity
    pub fn max_callbacks(mut self, capacity: usize) -> Self {
        self.max_callbacks = capacity;
        self
    }

    /// Builder: require a 4GB aligned heap
    pub fn require_aligned_heap(mut self, require: bool) -> Self {
        self.require_aligned_heap = require;
        self
    }

    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check the config for values no sandbox can be created with.
    pub fn validate(&self) -> Result<()> {
        if self.max_callbacks == 0 {
            return Err(AbiError::Config("max_callbacks must be at least 1".into()));
        }
        if u32::try_from(self.max_callbacks).is_err() {
            return Err(AbiError::Config(format!(
                "max_callbacks {} exceeds the function table index range",
                self.max_callbacks
            )));
        }
        if self.module_name.contains('\0') {
            return Err(AbiError::Config("module_name contains a NUL byte".into()));
        }
        Ok(())
    }
}
