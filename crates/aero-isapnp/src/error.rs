use thiserror::Error;

pub type Result<T> = std::result::Result<T, IsaPnpError>;

/// Fatal ISA PnP configuration errors.
///
/// These indicate a broken card descriptor or a guest/driver contract violation rather than a
/// transient protocol condition. Recoverable guard failures (accesses with no card or logical
/// device selected) are logged and never surface as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsaPnpError {
    #[error("CSN {csn:#04x} has no logical device {ldn:#04x}")]
    UnknownLogicalDevice { csn: u8, ldn: u8 },

    #[error("memory descriptor overflow at offset {offset:#x} (more than 4 memory ranges)")]
    MemoryDescriptorOverflow { offset: usize },

    #[error(
        "32-bit memory descriptor overflow at offset {offset:#x} (more than 4 32-bit memory ranges)"
    )]
    Memory32DescriptorOverflow { offset: usize },

    #[error("resource ROM too short: {len} bytes (need at least {min})")]
    RomTooShort { len: usize, min: usize },

    #[error("resource descriptor at offset {offset:#x} runs past the end of the ROM")]
    TruncatedResource { offset: usize },

    #[error("memory descriptor at offset {offset:#x} precedes any logical device ID")]
    ResourceOutsideLogicalDevice { offset: usize },

    #[error("logical device ID at offset {offset:#x} exceeds 256 logical devices")]
    TooManyLogicalDevices { offset: usize },
}
