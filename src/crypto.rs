//! Cryptographic backend behind the engine: AES-256-CBC without padding,
//! the salted SHA-256 mixes used for blind chunk lookup and key derivation,
//! and the system random source. The engine only talks to the
//! `CryptoProvider` trait so the backend stays swappable at construction
//! time.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use byteorder::{ByteOrder, LittleEndian};
use cbc::{Decryptor, Encryptor};
use memsec::memzero;
use rand::{OsRng, Rng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use error::{Error, Result};

/// Number of chained SHA-256 rounds in the iterated key derivation.
pub const SHA_ITERATIONS: usize = 65536;
/// Stride of the reordered final pass; coprime with `SHA_ITERATIONS` and
/// between one and two thirds of it.
pub const SHA_OFFSET_ITERATIONS: usize = 3 * 5 * 11 * 13 * 17;

const ERR_OS_RNG: &str = "could not initialize the OS random number generator";

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

/// The five primitives the engine needs. Key derivation constants are part
/// of the file format: two builds disagreeing on them cannot read each
/// other's databases.
pub trait CryptoProvider {
    /// Fills `buf` from a cryptographic random source.
    fn random_fill(&mut self, buf: &mut [u8]) -> Result<()>;

    /// AES-256-CBC in place, without padding. `buf` must be a multiple of
    /// 16 bytes; the caller pre-pads.
    fn aes256_cbc(&self, buf: &mut [u8], key: &[u8; 32], iv: &[u8; 16], encrypt: bool)
        -> Result<()>;

    /// SHA-256(s1 ∥ salt ∥ s2). The strings are hashed without any
    /// terminator.
    fn sha256_mix1(&self, s1: &str, salt: &[u8; 32], s2: &str) -> [u8; 32];

    /// The iterated, reordered derivation of `sha256_mix1`; this is the
    /// work factor behind holder passwords.
    fn sha256_iterated_mix1(&self, s1: &str, salt: &[u8; 32], s2: &str) -> [u8; 32];

    /// SHA-256(salt ∥ magic), magic serialised little-endian. Used for the
    /// common-marker recognition hash.
    fn sha256_mix2(&self, salt: &[u8; 32], common_magic: u64) -> [u8; 32];
}

/// Production provider: `sha2`, `aes`/`cbc` and the operating system RNG.
pub struct OsCrypto {
    rng: OsRng,
}

impl OsCrypto {
    /// # Errors
    ///
    /// `Error::CryptoFail` when the OS random source cannot be opened;
    /// there is no userland fallback.
    pub fn new() -> Result<OsCrypto> {
        let rng = OsRng::new().map_err(|e| {
            error!("{}: {}", ERR_OS_RNG, e);
            Error::CryptoFail(ERR_OS_RNG)
        })?;
        Ok(OsCrypto { rng })
    }
}

impl CryptoProvider for OsCrypto {
    fn random_fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.rng.fill_bytes(buf);
        Ok(())
    }

    fn aes256_cbc(
        &self,
        buf: &mut [u8],
        key: &[u8; 32],
        iv: &[u8; 16],
        encrypt: bool,
    ) -> Result<()> {
        if buf.len() % 16 != 0 {
            return Err(Error::CryptoFail("AES-CBC buffer is not block aligned"));
        }
        let len = buf.len();
        if encrypt {
            let cipher = Aes256CbcEnc::new(key.into(), iv.into());
            cipher
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map_err(|_| Error::CryptoFail("AES-CBC encryption failed"))?;
        } else {
            let cipher = Aes256CbcDec::new(key.into(), iv.into());
            cipher
                .decrypt_padded_mut::<NoPadding>(buf)
                .map_err(|_| Error::CryptoFail("AES-CBC decryption failed"))?;
        }
        Ok(())
    }

    fn sha256_mix1(&self, s1: &str, salt: &[u8; 32], s2: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(s1.as_bytes());
        hasher.update(&salt[..]);
        hasher.update(s2.as_bytes());
        hasher.finalize().into()
    }

    fn sha256_iterated_mix1(&self, s1: &str, salt: &[u8; 32], s2: &str) -> [u8; 32] {
        let mut r = self.sha256_mix1(s1, salt, s2);

        // Fill the table of chained digests.
        let mut table = vec![0u8; 32 * SHA_ITERATIONS];
        for i in 0..SHA_ITERATIONS {
            r = self.sha256_mix1(s1, &r, s2);
            table[32 * i..32 * (i + 1)].copy_from_slice(&r);
        }

        // Absorb the table in stride order into a fresh hash.
        let mut hasher = Sha256::new();
        let mut ofs = 0usize;
        for _ in 0..SHA_ITERATIONS {
            hasher.update(&table[32 * ofs..32 * (ofs + 1)]);
            ofs = (ofs + SHA_OFFSET_ITERATIONS) % SHA_ITERATIONS;
        }
        let result = hasher.finalize().into();
        unsafe {
            memzero(table.as_mut_ptr(), table.len());
        }
        result
    }

    fn sha256_mix2(&self, salt: &[u8; 32], common_magic: u64) -> [u8; 32] {
        let mut magic_bytes = [0u8; 8];
        LittleEndian::write_u64(&mut magic_bytes, common_magic);
        let mut hasher = Sha256::new();
        hasher.update(&salt[..]);
        hasher.update(&magic_bytes);
        hasher.finalize().into()
    }
}

/// Constant-time equality over two digests.
pub fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.ct_eq(b).into()
}

/// Generates a random password over `[a-zA-Z0-9]`.
pub fn generate_password(crypto: &mut dyn CryptoProvider, len: usize) -> Result<String> {
    let mut out = String::with_capacity(len);
    let mut raw = [0u8; 8];
    for _ in 0..len {
        crypto.random_fill(&mut raw)?;
        let b = (LittleEndian::read_u64(&raw) % 62) as u8;
        let c = if b < 26 {
            b'a' + b
        } else if b < 52 {
            b'A' + b - 26
        } else {
            b'0' + b - 52
        };
        out.push(c as char);
    }
    unsafe {
        memzero(raw.as_mut_ptr(), raw.len());
    }
    Ok(out)
}
