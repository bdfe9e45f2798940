/// Errors surfaced by the feature store and the streaming copy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The configured maximum feature count is zero.
    NoFeatureSlots,
    /// Requested ROM size exceeds the slot payload capacity.
    RomTooLarge,
    /// Requested RAM size exceeds the RAM window pool.
    RamTooLarge,
    /// Every slot in the reserved region holds an installed feature.
    NoFreeSlot,
    /// The RAM window pool cannot fit another window.
    RamExhausted,
    /// Destination lies outside the reserved flash region.
    OutsideRegion,
    /// A single copy would cross a feature slot boundary.
    CrossesSlotBoundary,
    /// The flash driver reported an erase or program failure.
    Device,
    /// The handle does not refer to an installed feature.
    NotInstalled,
    /// Device geometry does not match the store's buffer capacities.
    GeometryMismatch,
    /// The configured RAM alignment is not a power of two.
    BadAlignment,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoFeatureSlots => write!(f, "maximum feature count is configured to zero"),
            Error::RomTooLarge => write!(f, "requested rom size exceeds the slot payload capacity"),
            Error::RamTooLarge => write!(f, "requested ram size exceeds the ram window pool"),
            Error::NoFreeSlot => write!(f, "no vacant feature slot in the reserved region"),
            Error::RamExhausted => write!(f, "ram window pool exhausted"),
            Error::OutsideRegion => write!(f, "destination outside the reserved flash region"),
            Error::CrossesSlotBoundary => write!(f, "copy crosses a feature slot boundary"),
            Error::Device => write!(f, "flash device reported an error"),
            Error::NotInstalled => write!(f, "handle does not refer to an installed feature"),
            Error::GeometryMismatch => {
                write!(f, "device geometry does not match the store configuration")
            }
            Error::BadAlignment => write!(f, "ram alignment is not a power of two"),
        }
    }
}

/// Opaque failure reported by a [`FlashDevice`](crate::features::FlashDevice)
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceError;

impl core::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "flash device error")
    }
}

impl From<DeviceError> for Error {
    fn from(_: DeviceError) -> Self {
        Error::Device
    }
}

/// Cause reported by the host when a feature fails to initialize.
///
/// Three of the codes mean the persisted content can never become usable;
/// the store reacts to those by uninstalling the feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError {
    CorruptedContent,
    IncompatibleKernelWrongUid,
    TooManyInstalled,
    AlreadyInstalled,
    IncompatibleKernelWrongAddresses,
    RomOverlap,
    RamOverlap,
    RamAddressChanged,
}

impl InitError {
    /// Human-readable name used in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            InitError::CorruptedContent => "corrupted content",
            InitError::IncompatibleKernelWrongUid => "incompatible kernel (wrong uid)",
            InitError::TooManyInstalled => "too many features installed",
            InitError::AlreadyInstalled => "already installed",
            InitError::IncompatibleKernelWrongAddresses => "incompatible kernel (wrong addresses)",
            InitError::RomOverlap => "rom overlap",
            InitError::RamOverlap => "ram overlap",
            InitError::RamAddressChanged => "ram address changed",
        }
    }

    /// Returns true if the feature content is beyond recovery and the slot
    /// should be reclaimed.
    pub fn uninstalls(&self) -> bool {
        matches!(
            self,
            InitError::CorruptedContent
                | InitError::IncompatibleKernelWrongUid
                | InitError::IncompatibleKernelWrongAddresses
        )
    }
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
