use thiserror::Error;

/// Structural failure taxonomy shared by the decode, encode and patch passes.
///
/// Everything here is fatal to the smallest enclosing unit of work (one root's
/// decode, one structure's encode) except [PatchError::AllocationExhausted],
/// which aborts an entire patch run so that partial images are never emitted.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("address {address:#010X} out of bounds for {start:#010X}..{end:#010X}")]
    AddressOutOfBounds { address: u32, start: u32, end: u32 },
    #[error("{file}:{line}: unresolved symbol '{symbol}'")]
    UnresolvedSymbol { file: String, line: usize, symbol: String },
    #[error("malformed script at {address:#010X}: {reason}")]
    MalformedScript { address: u32, reason: String },
    #[error("call '{name}' has no unique overload for {argc} argument(s)")]
    AmbiguousSignature { name: String, argc: usize },
    #[error("allocation exhausted: image would grow to {needed:#X} bytes, limit is {limit:#X}")]
    AllocationExhausted { needed: u32, limit: u32 },
}
