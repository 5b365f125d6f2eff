//! Crate-wide error and result types.

use errno::Errno;

/// A wrapper around `Result` containing the crate `Error`.
pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "no database is loaded")]
    NoDatabase,
    #[fail(display = "the database is not open at the required level")]
    WrongLevel,
    #[fail(display = "no holder chunk matched this nickname and password")]
    TryNotFound,
    #[fail(display = "this holder's parts are already open")]
    TryAlreadyOpen,
    #[fail(display = "the holder chunk disagrees with the common section")]
    TryInconsistent,
    #[fail(display = "integrity check failed: {}", _0)]
    IntegrityFail(&'static str),
    #[fail(
        display = "only {} {} parts distributed, {} required to reopen the file",
        distributed, tier, threshold
    )]
    InsufficientShares {
        tier: &'static str,
        distributed: u32,
        threshold: u32,
    },
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] ::std::io::Error),
    #[fail(display = "invalid argument: {}", _0)]
    InvalidArg(String),
    #[fail(display = "cryptographic backend failure: {}", _0)]
    CryptoFail(&'static str),
    #[fail(display = "base64: invalid character 0x{:02x}", _0)]
    B64InvalidCode(u8),
    #[fail(display = "base64: unexpected end of input")]
    B64UnexpectedEnd,
    #[fail(display = "all {} parts are already queued", _0)]
    ManyParts(usize),
    #[fail(display = "not enough parts to recombine the secret")]
    NotEnoughShares,
    #[fail(display = "two parts carry the same abscissa")]
    DuplicateShare,
    #[fail(
        display = "mlock failed with {}: {} {} bytes",
        errno, addr, n_bytes
    )]
    MlockFailed {
        errno: Errno,
        addr: String,
        n_bytes: usize,
    },
    #[fail(
        display = "munlock failed with {}: {} {} bytes",
        errno, addr, n_bytes
    )]
    MunlockFailed {
        errno: Errno,
        addr: String,
        n_bytes: usize,
    },
}

impl From<::std::io::Error> for Error {
    fn from(e: ::std::io::Error) -> Error {
        Error::Io(e)
    }
}
