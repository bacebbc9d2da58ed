use kernel_objpool::OutOfMemory;

/// Errno values the character-device layer hands back to user space.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
}

/// Every way a DMA data-path operation can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    /// A page, packet, descriptor or bookkeeping allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// Malformed request; nothing was changed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The request referenced memory that is absent or inconsistent.
    #[error("bad address: {0}")]
    Fault(&'static str),
    /// The DMA engine rejected a mapping or descriptor.
    #[error("DMA submission failed: {0}")]
    Submission(&'static str),
    /// The resource is still in use.
    #[error("resource busy: {0}")]
    Busy(&'static str),
    /// A named DMA channel could not be found at probe time.
    #[error("no DMA channel named {0:?}")]
    NoChannel(String),
}

impl DmaError {
    /// The negative errno an ioctl/mmap returns for this error.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        -match self {
            Self::OutOfMemory => errno::ENOMEM,
            Self::InvalidArgument(_) => errno::EINVAL,
            Self::Fault(_) => errno::EFAULT,
            Self::Submission(_) => errno::EIO,
            Self::Busy(_) => errno::EBUSY,
            Self::NoChannel(_) => errno::ENODEV,
        }
    }
}

impl From<OutOfMemory> for DmaError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

pub type Result<T, E = DmaError> = core::result::Result<T, E>;
