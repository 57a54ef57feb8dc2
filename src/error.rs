use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Couldn't open a backing file
    #[error("Opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file
    #[error("Failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to a backing file
    #[error("Synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize a backing file
    #[error(
        "Can't resize the backing file. Have 0x{size:x} bytes, wanted to get 0x{requested:x} bytes"
    )]
    ResizeFailed {
        size: u64,
        requested: u64,
        source: std::io::Error,
    },
    /// Couldn't map any more memory
    #[error("Can't allocate any more memory map space. Tried to get 0x{requested:x} bytes")]
    MapFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// mlock/munlock/mprotect/msync failed
    #[error("Memory control syscall `{call}` failed")]
    MemControl {
        call: &'static str,
        source: std::io::Error,
    },
    /// The database has reached its configured size cap
    #[error("Out of segments: database size cap of 0x{cap:x} bytes reached")]
    OutOfSegments { cap: u64 },
    /// All 2^32 logical addresses are in use
    #[error("Out of logical addresses")]
    OutOfAddresses,
    /// All 64 session slots are in use
    #[error("No free session slots (max 64 concurrent sessions)")]
    OutOfSessions,
    /// Key longer than the 1024-byte limit
    #[error("Key of {len} bytes exceeds the {max}-byte limit")]
    KeyTooLong { len: usize, max: usize },
    /// Value larger than half a segment
    #[error("Value of {len} bytes exceeds the {max}-byte object limit")]
    ValueTooLarge { len: usize, max: usize },
    /// The magic file didn't match this build's geometry
    #[error("Database magic mismatch: found {found:#010x}, expected {expected:#010x}")]
    MagicMismatch { found: u32, expected: u32 },
    /// On-disk state that can't be valid under any execution
    #[error("Database corruption: {0}")]
    Corruption(&'static str),
    /// A key already exists where insert demanded absence, or was missing where update demanded presence
    #[error("Key constraint violated: {0}")]
    KeyConstraint(&'static str),
    /// Other, miscellaneous errors
    #[error("Other: {0}")]
    Other(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
