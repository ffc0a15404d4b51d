use thiserror::Error;

/// Errors surfaced by the collector and the C call marshaller.
#[derive(Debug, Error)]
pub enum VmError {
    /// The pluggable allocator returned null for a non-zero request.
    #[error("not enough memory")]
    OutOfMemory,
    /// Wrong number of arguments to a non-variadic C function.
    #[error("wrong number of arguments for C function call")]
    FfiNumArgs,
    /// Unsupported ABI case: too many arguments, unclassifiable type, or a
    /// target feature this build does not handle.
    #[error("NYI: cannot convert C function call")]
    FfiNyiCall,
    /// `call_func` target cdata does not resolve to a C function.
    #[error("cdata is not callable")]
    NotFunction,
    /// A `__gc` metamethod raised; the original error is rethrown after the
    /// collector state has been restored.
    #[error("error in finalizer: {0}")]
    Finalizer(#[source] Box<VmError>),
    /// A `__gc` metamethod resolved to a value this runtime cannot invoke
    /// (e.g. a VM closure with no interpreter attached).
    #[error("finalizer is not callable")]
    BadFinalizer,
}

pub type VmResult<T> = Result<T, VmError>;
