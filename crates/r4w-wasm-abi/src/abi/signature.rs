//! Logical function signatures and their ABI rewriting.

use std::fmt;

use super::types::{AbiType, Lane};

/// Host-level signature of a function crossing the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: Vec<AbiType>,
    ret: AbiType,
}

impl Signature {
    /// Create a signature.
    ///
    /// # Panics
    ///
    /// Panics if a parameter is `Void`.
    pub fn new(params: impl Into<Vec<AbiType>>, ret: AbiType) -> Self {
        let params = params.into();
        assert!(
            !params.contains(&AbiType::Void),
            "void is not a parameter type"
        );
        Self { params, ret }
    }

    /// Parameter types.
    pub fn params(&self) -> &[AbiType] {
        &self.params
    }

    /// Return type.
    pub fn ret(&self) -> AbiType {
        self.ret
    }

    /// Whether the return value must be promoted to an out-parameter.
    pub fn returns_aggregate(&self) -> bool {
        self.ret.is_aggregate()
    }

    /// Number of parameters passed through scratch memory.
    pub fn aggregate_param_count(&self) -> usize {
        self.params.iter().filter(|p| p.is_aggregate()).count()
    }

    /// Prepend a leading parameter.
    pub fn prepend_param(&self, ty: AbiType) -> Self {
        let mut params = Vec::with_capacity(self.params.len() + 1);
        params.push(ty);
        params.extend_from_slice(&self.params);
        Self::new(params, self.ret)
    }

    /// Replace the return type.
    pub fn with_return(&self, ret: AbiType) -> Self {
        Self {
            params: self.params.clone(),
            ret,
        }
    }

    /// Replace every aggregate parameter with `with`.
    pub fn replace_aggregate_params(&self, with: AbiType) -> Self {
        let params = self
            .params
            .iter()
            .map(|p| if p.is_aggregate() { with } else { *p })
            .collect::<Vec<_>>();
        Self::new(params, self.ret)
    }

    /// Turn an aggregate return into a leading out-pointer and a `void` return.
    ///
    /// Signatures that do not return an aggregate are returned unchanged.
    pub fn promote_return(&self) -> Self {
        if self.returns_aggregate() {
            self.with_return(AbiType::Void).prepend_param(AbiType::Pointer)
        } else {
            self.clone()
        }
    }

    /// The full rewritten signature of a host → sandbox call.
    ///
    /// Applied in a fixed order: return promotion, context injection,
    /// aggregate parameter replacement.
    pub fn rewrite_for_call(&self) -> Self {
        self.promote_return()
            .prepend_param(AbiType::Context)
            .replace_aggregate_params(AbiType::Pointer)
    }

    /// The function type a callback occupies in the sandbox function table.
    pub fn rewrite_for_callback(&self) -> Self {
        self.promote_return().replace_aggregate_params(AbiType::Pointer)
    }

    /// Lower every type to its lane.
    pub fn lower(&self, pointer: Lane) -> WireSignature {
        WireSignature {
            params: self.params.iter().filter_map(|p| p.lane(pointer)).collect(),
            result: self.ret.lane(pointer),
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// Lane-level function type, as the runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireSignature {
    /// Parameter lanes
    pub params: Vec<Lane>,
    /// Result lane, if any
    pub result: Option<Lane>,
}

impl WireSignature {
    /// Create a wire signature.
    pub fn new(params: impl Into<Vec<Lane>>, result: Option<Lane>) -> Self {
        Self {
            params: params.into(),
            result,
        }
    }

    /// Number of results (0 or 1).
    pub fn result_count(&self) -> usize {
        usize::from(self.result.is_some())
    }

    /// Parameter lanes followed by the result lane, the layout used by
    /// function type lookups.
    pub fn type_array(&self) -> Vec<Lane> {
        self.params.iter().copied().chain(self.result).collect()
    }
}

impl fmt::Display for WireSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", p)?;
        }
        f.write_str(")")?;
        if let Some(result) = self.result {
            write!(f, " -> {}", result)?;
        }
        Ok(())
    }
}
