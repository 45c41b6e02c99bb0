use crate::errno::Errno;
use crate::flags::CompletionFlags;

/// A successful completion. Which fields are meaningful depends on the
/// format the completion queue was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CqEntry {
    pub op_context: u64,
    pub flags: CompletionFlags,
    pub len: usize,
    pub buf: usize,
    pub data: u64,
    pub tag: u64,
}

/// A failed completion, read from the error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqErrEntry {
    pub op_context: u64,
    pub flags: CompletionFlags,
    pub len: usize,
    pub buf: usize,
    pub data: u64,
    pub tag: u64,
    /// Bytes that did not fit the receive buffer.
    pub olen: usize,
    pub err: Errno,
    pub prov_errno: i32,
}
