//! Error types for the ABI boundary crate.
//!
//! Errors fall into four classes:
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | Setup | module open failure, missing symbol, heap constraint | returned in fallible mode, fatal otherwise |
//! | Exhaustion | callback table full, sandbox out of memory | always fatal |
//! | Internal consistency | unknown or duplicate callback key, signature mismatch | always fatal |
//! | Configuration | invalid config file | returned to the caller |
//!
//! Unmapped host types never reach run time: [`GuestType`](crate::abi::GuestType)
//! is only implemented for types with a sandbox representation.

use thiserror::Error;

/// ABI boundary error type
#[derive(Error, Debug)]
pub enum AbiError {
    /// The loader could not open the sandboxed library
    #[error("could not load sandboxed library {path}: {reason}")]
    LoadFailed {
        /// Path handed to the loader
        path: String,
        /// Loader-provided reason
        reason: String,
    },

    /// A required exported symbol is missing
    #[error("could not find symbol {0}")]
    MissingSymbol(String),

    /// The runtime refused to create an instance
    #[error("sandbox could not be created")]
    InstanceCreation,

    /// The runtime did not expose the sandbox linear memory
    #[error("could not get sandbox memory info")]
    MissingMemory,

    /// The heap base does not satisfy the 4GB alignment requirement
    #[error("sandbox heap not aligned to 4GB (base {0:#x})")]
    MisalignedHeap(usize),

    /// Requested heap exceeds the maximum page count
    #[error("wasm allows a max heap size of 4GB ({pages} pages requested)")]
    HeapTooLarge {
        /// Requested page count
        pages: u64,
    },

    /// Every callback slot is in use
    #[error(
        "could not find an empty slot in sandbox function table ({capacity} slots in use); \
         too many callbacks registered or too many function pointers unsandboxed"
    )]
    CallbackTableFull {
        /// Table capacity
        capacity: usize,
    },

    /// Registering a key that is already registered
    #[error("internal error: callback key {0:#x} is already registered")]
    DuplicateCallbackKey(usize),

    /// Unregistering a key that was never registered
    #[error("internal error: could not find callback to unregister")]
    UnknownCallback,

    /// A trampoline fired for a slot that holds no callback
    #[error("internal error: callback slot {0} is empty")]
    EmptyCallbackSlot(usize),

    /// A trampoline fired while no sandbox invocation is active on this thread
    #[error("internal error: callback invoked outside of a sandbox invocation")]
    NoActiveSandbox,

    /// Allocation size not representable in the sandbox pointer width
    #[error("attempting to malloc more than the heap size ({0} bytes)")]
    AllocationTooLarge(usize),

    /// The sandbox allocator returned null
    #[error("sandbox out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// Access outside the sandbox memory
    #[error("access of {len} bytes at {addr:#x} is outside sandbox memory")]
    OutOfBounds {
        /// Offending address
        addr: usize,
        /// Access length
        len: usize,
    },

    /// Values did not match the declared signature
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// The sandboxed code trapped
    #[error("sandbox trapped: {0}")]
    Trap(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config parse error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AbiError {
    /// Whether this error can be reported as a creation failure in fallible mode.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AbiError::LoadFailed { .. }
                | AbiError::MissingSymbol(_)
                | AbiError::InstanceCreation
                | AbiError::MissingMemory
                | AbiError::MisalignedHeap(_)
                | AbiError::HeapTooLarge { .. }
        )
    }
}

/// Result type alias for ABI operations
pub type Result<T> = std::result::Result<T, AbiError>;

/// Report an unrecoverable error and unwind.
///
/// Builds with `panic = "abort"` terminate the process here.
#[track_caller]
#[cold]
pub(crate) fn fatal(err: AbiError) -> ! {
    tracing::error!(error = %err, "fatal sandbox error");
    panic!("{err}");
}

/// Unwrap a result, treating the error as fatal.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => fatal(e),
        }
    }
}
