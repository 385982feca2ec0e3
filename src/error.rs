/// Coarse classification shared by every error in the crate, so callers can
/// pick a response (e.g. 400 vs 404 vs 409) without matching on variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected before touching the store.
    Validation,
    /// Unknown account, entry or transfer id.
    NotFound,
    /// Business rule or constraint failure, may succeed with corrected input.
    Conflict,
    /// Lock timeout, cancellation or backend failure.
    Storage,
}
