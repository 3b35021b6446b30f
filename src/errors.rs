use core::fmt;

const EIO: i32 = 5;
const EINVAL: i32 = 22;
const EBUSY: i32 = 16;
const ENOSYS: i32 = 38;
const ENOTSUP: i32 = 95;
const ECANCELED: i32 = 125;

/// Raw status returned by the register access layer. Zero means success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HalError(pub i32);

impl HalError {
    pub const OK: HalError = HalError(0);

    pub fn into_result(self) -> Result<()> {
        Result::from(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument: area outside the overlay, bad index, bad table range
    InvalidArg,
    /// Operation not possible for this format or layer
    NotSupported,
    /// Transparency mode is not one of the recognized modes
    UnsupportedMode,
    /// Hardware reported a configuration error during a transfer
    Canceled,
    /// Resource busy: registrant table full, or a transfer is in work
    Busy,
    /// Engine used before `initialize`
    InvalidState,
    /// Register access layer failure
    Io(i32),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

impl Error {
    /// Negative errno value matching the framebuffer vtable convention.
    pub const fn errno(&self) -> i32 {
        match self {
            Error::InvalidArg => -EINVAL,
            Error::NotSupported => -ENOTSUP,
            Error::UnsupportedMode => -ENOSYS,
            Error::Canceled => -ECANCELED,
            Error::Busy => -EBUSY,
            Error::InvalidState => -EINVAL,
            Error::Io(code) if *code < 0 => *code,
            Error::Io(_) => -EIO,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArg => write!(f, "invalid argument"),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::UnsupportedMode => write!(f, "unsupported transparency mode"),
            Error::Canceled => write!(f, "transfer canceled by hardware"),
            Error::Busy => write!(f, "resource busy"),
            Error::InvalidState => write!(f, "engine not initialized"),
            Error::Io(code) => write!(f, "register access failed ({code})"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<HalError> for Result<()> {
    fn from(value: HalError) -> Self {
        match value.0 {
            0 => Ok(()),
            code => Err(Error::Io(code)),
        }
    }
}

/// Collapses a result into the C-style return code (0 or negative errno).
pub fn to_errno(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}
