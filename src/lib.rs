//! MPM is a master password manager whose database key is never stored
//! anywhere: it only exists as a threshold secret spread over a set of human
//! holders, and is rebuilt in memory each time enough holders type their
//! password. Two independent thresholds unlock successive levels of the
//! database: the "common" level opens the metadata and the non-sensitive
//! fields, the "secret" level opens the raw secret values.
//!
//! This crate is the engine: the per-holder chunk format with blind lookup,
//! the two-stage Shamir recovery over GF(2^256), the encrypted common
//! section, the per-field secret-tier encryption and the level state
//! machine. Terminal handling stays outside and talks to the engine through
//! the callback trait in the `ui` module.

extern crate aes;
#[macro_use]
extern crate bitflags;
extern crate byteorder;
extern crate cbc;
extern crate errno;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate memsec;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate sha2;
extern crate subtle;

pub mod b64;
pub mod commands;
pub mod crypto;
pub mod database;
pub mod error;
mod gf;
pub mod holder;
pub mod msg;
pub mod secret;
pub mod sss;
pub mod ui;

use std::env;
use std::fmt;
use std::ptr::copy_nonoverlapping;

use errno::errno;
use memsec::{memzero, mlock, munlock};
use subtle::ConstantTimeEq;

use error::{Error, Result};

lazy_static! {
    // Sets whether or not `mlock`ing is enabled. Memory locking is enabled by default; it can be
    // disabled by setting the environment variable `MLOCK_SECRETS=false`. This is useful when you
    // are running on a system where you do not have the ability to increase the system's locked
    // memory limit (which can be found using the Unix command: `ulimit -l`). Disabling `mlock`ing
    // of secrets allows key material to be swapped/core-dumped to disk, resulting in unmanaged
    // copies of secrets to hang around in memory; this is significantly less secure than enabling
    // memory locking (the default). Only set `MLOCK_SECRETS=false` in development/testing.
    pub(crate) static ref SHOULD_MLOCK_SECRETS: bool = match env::var("MLOCK_SECRETS") {
        Ok(s) => s.parse().unwrap_or(true),
        _ => true,
    };
}

/// Marks a type as containing one or more secret byte regions.
pub(crate) trait ContainsSecret {
    /// Calls the `mlock` system call on the region of memory allocated for the secret. This
    /// results in that region of memory not being copied to disk, either in a swap to disk or
    /// core dump. This method is called on every created instance of a secret type.
    ///
    /// # Errors
    ///
    /// An `Error::MlockFailed` is returned if we failed to `mlock` the secret data.
    fn mlock_secret_memory(&self) -> Result<()>;

    /// Undoes the `mlock` on the secret region of memory via the `munlock` system call.
    ///
    /// # Errors
    ///
    /// An `Error::MunlockFailed` is returned if we failed to `munlock` the secret data; this
    /// method is called on each secret type when it goes out of scope.
    fn munlock_secret_memory(&self) -> Result<()>;

    /// Overwrites the secret region with zeros; this method is called on each secret type when
    /// it goes out of scope.
    fn zero_secret_memory(&self);
}

/// Wrapper for a byte array, whose `Debug` implementation outputs shortened hexadecimal strings.
pub struct HexBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Debug for HexBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.len() > 6 {
            for byte in &self.0[..3] {
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "..")?;
            for byte in &self.0[(self.0.len() - 3)..] {
                write!(f, "{:02x}", byte)?;
            }
        } else {
            for byte in self.0 {
                write!(f, "{:02x}", byte)?;
            }
        }
        Ok(())
    }
}

/// A 32-byte secret (a reconstructed tier key or a holder's derived chunk
/// key). The bytes are heap allocated to avoid any stack copying that
/// results from passing `SecretBytes` between stack frames, `mlock`ed while
/// alive, and zeroised on drop.
pub struct SecretBytes(Box<[u8; 32]>);

impl SecretBytes {
    /// Creates a new `SecretBytes` from a mutable byte array. The bytes are
    /// copied onto the heap and the source array is overwritten with zeros,
    /// so no readable copy is left behind on the caller's stack.
    ///
    /// # Errors
    ///
    /// Returns an `Error::MlockFailed` if we have reached the system's
    /// locked memory limit.
    pub fn from_mut(bytes: &mut [u8; 32]) -> Result<Self> {
        let mut boxed = Box::new([0u8; 32]);
        unsafe {
            copy_nonoverlapping(bytes.as_ptr(), boxed.as_mut_ptr(), 32);
            memzero(bytes.as_mut_ptr(), 32);
        }
        let secret = SecretBytes(boxed);
        secret.mlock_secret_memory()?;
        Ok(secret)
    }

    /// Creates a zeroed `SecretBytes`, for callers that fill it in place.
    pub fn zero() -> Result<Self> {
        let secret = SecretBytes(Box::new([0u8; 32]));
        secret.mlock_secret_memory()?;
        Ok(secret)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8; 32] {
        &mut self.0
    }
}

/// Creates a new `SecretBytes` by cloning another one's buffer.
///
/// # Panics
///
/// Panics if we have hit the system's locked memory limit when `mlock`ing
/// the new instance.
impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        let mut bytes = *self.0;
        match SecretBytes::from_mut(&mut bytes) {
            Ok(secret) => secret,
            Err(e) => panic!("Failed to clone `SecretBytes`: {}", e),
        }
    }
}

// A volatile overwrite of the secret buffer.
//
// # Panics
//
// Panics if we were unable to `munlock` the buffer after it has been cleared.
impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.zero_secret_memory();
        if let Err(e) = self.munlock_secret_memory() {
            panic!("Failed to drop `SecretBytes`: {}", e);
        }
    }
}

/// A debug statement where the secret bytes are redacted.
impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SecretBytes(...)")
    }
}

/// Constant-time comparison; key material must never be compared with a
/// short-circuiting equality.
impl PartialEq for SecretBytes {
    fn eq(&self, other: &SecretBytes) -> bool {
        self.0.ct_eq(&other.0[..]).into()
    }
}

impl Eq for SecretBytes {}

impl ContainsSecret for SecretBytes {
    fn mlock_secret_memory(&self) -> Result<()> {
        if !*SHOULD_MLOCK_SECRETS {
            return Ok(());
        }
        let ptr = self.0.as_ptr() as *mut u8;
        let n_bytes = self.0.len();
        let mlock_succeeded = unsafe { mlock(ptr, n_bytes) };
        if mlock_succeeded {
            Ok(())
        } else {
            let e = Error::MlockFailed {
                errno: errno(),
                addr: format!("{:?}", ptr),
                n_bytes,
            };
            Err(e)
        }
    }

    fn munlock_secret_memory(&self) -> Result<()> {
        if !*SHOULD_MLOCK_SECRETS {
            return Ok(());
        }
        let ptr = self.0.as_ptr() as *mut u8;
        let n_bytes = self.0.len();
        let munlock_succeeded = unsafe { munlock(ptr, n_bytes) };
        if munlock_succeeded {
            Ok(())
        } else {
            let e = Error::MunlockFailed {
                errno: errno(),
                addr: format!("{:?}", ptr),
                n_bytes,
            };
            Err(e)
        }
    }

    fn zero_secret_memory(&self) {
        let ptr = self.0.as_ptr() as *mut u8;
        let n_bytes = self.0.len();
        unsafe {
            memzero(ptr, n_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_bytes_wipes_source() {
        let mut source = [0xabu8; 32];
        let secret = SecretBytes::from_mut(&mut source).expect("mlock");
        assert_eq!(source, [0u8; 32]);
        assert_eq!(secret.as_bytes(), &[0xabu8; 32]);
    }

    #[test]
    fn test_secret_bytes_eq() {
        let mut a = [7u8; 32];
        let mut b = [7u8; 32];
        let mut c = [8u8; 32];
        let sa = SecretBytes::from_mut(&mut a).expect("mlock");
        let sb = SecretBytes::from_mut(&mut b).expect("mlock");
        let sc = SecretBytes::from_mut(&mut c).expect("mlock");
        assert_eq!(sa, sb);
        assert_ne!(sa, sc);
        assert_eq!(sa.clone(), sb);
    }

    #[test]
    fn test_hex_bytes_shortens() {
        let bytes: Vec<u8> = (0..32).collect();
        let shown = format!("{:?}", HexBytes(&bytes));
        assert_eq!(shown, "000102..1d1e1f");
        let short = [0xffu8; 3];
        assert_eq!(format!("{:?}", HexBytes(&short)), "ffffff");
    }
}
