//! Error Types

use std::num::TryFromIntError;

use nix::errno::Errno;

pub type AppResult<T> = Result<T, AppError>;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Errno(#[from] Errno),
}

/// Errors while pulling a typed payload out of a vhost-user message
#[derive(thiserror::Error, Clone, Debug)]
pub enum PayloadError {
    #[error("payload is missing")]
    Missing,

    #[error("not enough data for payload, got = {0}, expected = {1}")]
    NotEnoughData(usize, usize),

    #[error("ancillary / control data missing")]
    MissingControlData,

    #[error("no file descriptors found in ancillary data")]
    NoFileDescriptorsFound,

    #[error("expected {0} file descriptor(s), got {1}")]
    FileDescriptorCountMismatch(usize, usize),
}

/// Errors from the memory map / address translation component
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("no memory has been mapped")]
    NoMappedMemory,

    #[error("no translation found for address 0x{0:08x}")]
    NoTranslation(u64),

    #[error("memory region table full (max {0} regions)")]
    TableFull(usize),

    #[error("mmap: {0}")]
    Mmap(#[from] Errno),

    #[error("region has zero length")]
    EmptyRegion,
}

/// Errors while decoding/handling a single vhost-user control message.
///
/// These are all fatal for the owning session: the dispatcher reports them
/// up and the reactor tears the connection down.
#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("{0}")]
    Errno(#[from] Errno),

    #[error("payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to cast int: {0}")]
    TryFromInt(#[from] TryFromIntError),

    #[error("vhost-user header is missing or truncated")]
    HeaderMissing,

    #[error("memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("queue index {0} out of range")]
    QueueNotFound(usize),

    #[error("unknown request code: {0}")]
    UnknownRequest(u32),
}
