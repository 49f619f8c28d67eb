/// Error enum with all errors that can be returned by functions from this crate
///
/// Generic parameter `T` is a type of external error returned by the user provided block device
#[derive(Debug)]
#[non_exhaustive]
pub enum Error<T> {
    /// The user provided block device returned an error during an input/output operation.
    Io(T),
    /// An allocation table sector failed its stored CRC and no redundant copy was valid.
    CrcMismatch,
    /// File system internal structures are corrupted/invalid.
    CorruptedFileSystem,
    /// There is not enough free space on the flash to finish the requested operation.
    NotEnoughSpace,
    /// A requested file has not been found.
    NotFound,
    /// The allocation table area is blank; the volume has never been formatted.
    UnformattedVolume,
    /// A parameter was incorrect.
    InvalidInput,
    /// The provided file name is either too long or empty.
    InvalidFileNameLength,
    /// The provided file name contains an invalid character.
    UnsupportedFileNameCharacter,
}

impl<T: core::fmt::Display> core::fmt::Display for Error<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io(io_error) => write!(f, "IO error: {}", io_error),
            Error::CrcMismatch => write!(f, "Allocation table CRC mismatch"),
            Error::CorruptedFileSystem => write!(f, "Corrupted file system"),
            Error::NotEnoughSpace => write!(f, "Not enough space"),
            Error::NotFound => write!(f, "No such file"),
            Error::UnformattedVolume => write!(f, "Volume is not formatted"),
            Error::InvalidInput => write!(f, "Invalid input"),
            Error::InvalidFileNameLength => write!(f, "Invalid file name length"),
            Error::UnsupportedFileNameCharacter => write!(f, "Unsupported file name character"),
        }
    }
}

#[cfg(feature = "std")]
impl<T: std::error::Error + 'static> std::error::Error for Error<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::Io(io_error) = self {
            Some(io_error)
        } else {
            None
        }
    }
}
