//! One holder: a human custodian with a nickname, a password and a set of
//! shares over the two tiers. On disk a holder is a 512-byte chunk whose
//! identity can only be established by recomputing the blind-lookup hash
//! from a candidate nickname and password; the nickname itself is never
//! stored in clear.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};
use memsec::memzero;

use crypto::{digests_equal, CryptoProvider};
use error::{Error, Result};
use sss::{share_abscissa, Shamir};
use SecretBytes;

/// Size of one holder chunk in the database file.
pub const CHUNK_SIZE: usize = 512;
/// Offset from which the chunk is AES-encrypted; everything before is in
/// clear (salts and the blind-lookup hash).
pub const CHUNK_AES_OFFSET: usize = 96;
/// Length of the encrypted region; a multiple of the AES block size.
pub const CHUNK_AES_SIZE: usize = CHUNK_SIZE - CHUNK_AES_OFFSET;
/// Share slots available in a chunk, common and secret tiers together.
pub const MAX_PARTS: usize = 8;

/// Fixed random number verifying that a chunk decryption worked; there is
/// no MAC, a wrong key shows up as a mismatched magic.
pub const CHUNK_MAGIC: u64 = 0x4425_827a_2cb0_794b;
/// File format version encoded in each chunk.
pub const CHUNK_VERSION: u64 = 1;

// Byte offsets inside the 512-byte chunk. All integers little-endian.
const OFF_SALT1: usize = 0;
const OFF_HASH: usize = 32;
const OFF_SALT2: usize = 64;
const OFF_PARTS: usize = 96;
const OFF_XPARTS: usize = 352;
const OFF_COMMON_THRESHOLD: usize = 416;
const OFF_COMMON_NB_PARTS: usize = 418;
const OFF_SECRET_THRESHOLD: usize = 420;
const OFF_SECRET_NB_PARTS: usize = 422;
const OFF_COMMON_MAGIC: usize = 424;
const OFF_ID_HOLDER: usize = 432;
const OFF_PADDING: usize = 434;
const OFF_VERSION: usize = 496;
const OFF_MAGIC: usize = 504;

/// Where this holder stands relative to its chunk in the file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkStatus {
    /// In memory only, not yet on disk; the chunk will be created at the
    /// next save. This is the state of freshly added holders.
    None,
    /// On disk and known from the common section, but not authenticated
    /// this session. Not editable; the chunk is rewritten verbatim.
    Closed,
    /// Authenticated; the chunk image is decrypted and the holder is
    /// editable.
    Open,
}

/// The decoded integer/array fields of a (decrypted) chunk.
pub struct ChunkFields {
    pub salt1: [u8; 32],
    pub hash: [u8; 32],
    pub salt2: [u8; 32],
    pub parts: [[u8; 32]; MAX_PARTS],
    pub xparts: [u64; MAX_PARTS],
    pub common_threshold: u16,
    pub common_nb_parts: u16,
    pub secret_threshold: u16,
    pub secret_nb_parts: u16,
    pub common_magic: u64,
    pub id_holder: u16,
    pub version: u64,
    pub magic: u64,
}

impl ChunkFields {
    pub fn read(buf: &[u8; CHUNK_SIZE]) -> ChunkFields {
        let mut salt1 = [0u8; 32];
        let mut hash = [0u8; 32];
        let mut salt2 = [0u8; 32];
        salt1.copy_from_slice(&buf[OFF_SALT1..OFF_SALT1 + 32]);
        hash.copy_from_slice(&buf[OFF_HASH..OFF_HASH + 32]);
        salt2.copy_from_slice(&buf[OFF_SALT2..OFF_SALT2 + 32]);
        let mut parts = [[0u8; 32]; MAX_PARTS];
        let mut xparts = [0u64; MAX_PARTS];
        for i in 0..MAX_PARTS {
            parts[i].copy_from_slice(&buf[OFF_PARTS + 32 * i..OFF_PARTS + 32 * (i + 1)]);
            xparts[i] = LittleEndian::read_u64(&buf[OFF_XPARTS + 8 * i..OFF_XPARTS + 8 * (i + 1)]);
        }
        ChunkFields {
            salt1,
            hash,
            salt2,
            parts,
            xparts,
            common_threshold: LittleEndian::read_u16(&buf[OFF_COMMON_THRESHOLD..]),
            common_nb_parts: LittleEndian::read_u16(&buf[OFF_COMMON_NB_PARTS..]),
            secret_threshold: LittleEndian::read_u16(&buf[OFF_SECRET_THRESHOLD..]),
            secret_nb_parts: LittleEndian::read_u16(&buf[OFF_SECRET_NB_PARTS..]),
            common_magic: LittleEndian::read_u64(&buf[OFF_COMMON_MAGIC..]),
            id_holder: LittleEndian::read_u16(&buf[OFF_ID_HOLDER..]),
            version: LittleEndian::read_u64(&buf[OFF_VERSION..]),
            magic: LittleEndian::read_u64(&buf[OFF_MAGIC..]),
        }
    }

    /// Serialises every field into `buf`. The padding region is left as it
    /// is; callers keep it filled with random bytes.
    pub fn write(&self, buf: &mut [u8; CHUNK_SIZE]) {
        buf[OFF_SALT1..OFF_SALT1 + 32].copy_from_slice(&self.salt1);
        buf[OFF_HASH..OFF_HASH + 32].copy_from_slice(&self.hash);
        buf[OFF_SALT2..OFF_SALT2 + 32].copy_from_slice(&self.salt2);
        for i in 0..MAX_PARTS {
            buf[OFF_PARTS + 32 * i..OFF_PARTS + 32 * (i + 1)].copy_from_slice(&self.parts[i]);
            LittleEndian::write_u64(
                &mut buf[OFF_XPARTS + 8 * i..OFF_XPARTS + 8 * (i + 1)],
                self.xparts[i],
            );
        }
        LittleEndian::write_u16(&mut buf[OFF_COMMON_THRESHOLD..OFF_COMMON_THRESHOLD + 2], self.common_threshold);
        LittleEndian::write_u16(&mut buf[OFF_COMMON_NB_PARTS..OFF_COMMON_NB_PARTS + 2], self.common_nb_parts);
        LittleEndian::write_u16(&mut buf[OFF_SECRET_THRESHOLD..OFF_SECRET_THRESHOLD + 2], self.secret_threshold);
        LittleEndian::write_u16(&mut buf[OFF_SECRET_NB_PARTS..OFF_SECRET_NB_PARTS + 2], self.secret_nb_parts);
        LittleEndian::write_u64(&mut buf[OFF_COMMON_MAGIC..OFF_COMMON_MAGIC + 8], self.common_magic);
        LittleEndian::write_u16(&mut buf[OFF_ID_HOLDER..OFF_ID_HOLDER + 2], self.id_holder);
        LittleEndian::write_u64(&mut buf[OFF_VERSION..OFF_VERSION + 8], self.version);
        LittleEndian::write_u64(&mut buf[OFF_MAGIC..OFF_MAGIC + 8], self.magic);
    }
}

/// The holder entry of the common-section JSON. The share material itself
/// never appears here; it only lives in the chunks.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HolderMeta {
    pub nickname: String,
    pub id_holder: u16,
    pub common_nb_parts: u16,
    pub secret_nb_parts: u16,
    pub file_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

pub struct Holder {
    pub nickname: String,
    pub email: Option<String>,
    pub id_holder: u16,
    pub chunk_status: ChunkStatus,
    pub salt1: [u8; 32],
    pub salt2: [u8; 32],
    pub hash: [u8; 32],
    pkey: SecretBytes,
    pub password_set: bool,
    parts: Box<[[u8; 32]; MAX_PARTS]>,
    xparts: [u64; MAX_PARTS],
    chunk: Box<[u8; CHUNK_SIZE]>,
    pub common_nb_parts: u16,
    pub secret_nb_parts: u16,
    /// Position of the chunk in the file, fixed during save; -1 before the
    /// first save.
    pub file_index: i64,
}

impl Holder {
    /// Creates a brand-new holder that does not exist on disk yet. Every
    /// slot starts as fresh random noise, then one common and one secret
    /// part are emitted.
    pub fn create(
        nickname: &str,
        id_holder: u16,
        crypto: &mut dyn CryptoProvider,
        sss_common: &mut Shamir,
        sss_secret: &mut Shamir,
    ) -> Result<Holder> {
        let mut holder = Holder {
            nickname: nickname.to_string(),
            email: None,
            id_holder,
            chunk_status: ChunkStatus::None,
            salt1: [0u8; 32],
            salt2: [0u8; 32],
            hash: [0u8; 32],
            pkey: SecretBytes::zero()?,
            password_set: false,
            parts: Box::new([[0u8; 32]; MAX_PARTS]),
            xparts: [0u64; MAX_PARTS],
            chunk: Box::new([0u8; CHUNK_SIZE]),
            common_nb_parts: 1,
            secret_nb_parts: 1,
            file_index: -1,
        };
        crypto.random_fill(&mut holder.salt1)?;
        crypto.random_fill(&mut holder.salt2)?;
        crypto.random_fill(&mut holder.chunk[..])?;
        holder.emit_parts(crypto, sss_common, sss_secret)?;
        Ok(holder)
    }

    /// Creates a holder from a chunk that matched a blind lookup before
    /// the common section was open. `chunk` is already decrypted; `pkey`
    /// is kept because it cannot be recomputed without the password.
    pub fn from_chunk(
        nickname: &str,
        chunk: &[u8; CHUNK_SIZE],
        file_index: i64,
        pkey: &mut [u8; 32],
    ) -> Result<Holder> {
        let fields = ChunkFields::read(chunk);
        Ok(Holder {
            nickname: nickname.to_string(),
            email: None,
            id_holder: fields.id_holder,
            chunk_status: ChunkStatus::Open,
            salt1: fields.salt1,
            salt2: fields.salt2,
            hash: fields.hash,
            pkey: SecretBytes::from_mut(pkey)?,
            password_set: true,
            parts: Box::new(fields.parts),
            xparts: fields.xparts,
            chunk: Box::new(*chunk),
            common_nb_parts: fields.common_nb_parts,
            secret_nb_parts: fields.secret_nb_parts,
            file_index,
        })
    }

    /// Creates a holder from its common-section entry, for holders that
    /// have not authenticated this session. `image` is the raw, still
    /// encrypted chunk read back from the file; it will be rewritten
    /// byte-for-byte at the next save.
    pub fn from_common(meta: &HolderMeta, image: &[u8; CHUNK_SIZE]) -> Result<Holder> {
        Ok(Holder {
            nickname: meta.nickname.clone(),
            email: meta.email.clone(),
            id_holder: meta.id_holder,
            chunk_status: ChunkStatus::Closed,
            salt1: [0u8; 32],
            salt2: [0u8; 32],
            hash: [0u8; 32],
            pkey: SecretBytes::zero()?,
            password_set: true,
            parts: Box::new([[0u8; 32]; MAX_PARTS]),
            xparts: [0u64; MAX_PARTS],
            chunk: Box::new(*image),
            common_nb_parts: meta.common_nb_parts,
            secret_nb_parts: meta.secret_nb_parts,
            file_index: meta.file_index,
        })
    }

    /// Merges the common-section entry into a holder that authenticated
    /// before the common level opened. The chunk remains authoritative for
    /// the share counts; a disagreeing entry is logged, not adopted.
    pub fn complete_open(&mut self, meta: &HolderMeta) {
        if meta.id_holder != self.id_holder
            || meta.common_nb_parts != self.common_nb_parts
            || meta.secret_nb_parts != self.secret_nb_parts
        {
            debug!(
                "common entry disagrees with chunk for '{}': id {}/{} parts {}+{} vs {}+{}",
                self.nickname,
                meta.id_holder,
                self.id_holder,
                meta.common_nb_parts,
                meta.secret_nb_parts,
                self.common_nb_parts,
                self.secret_nb_parts
            );
        }
        if self.chunk_status != ChunkStatus::Open {
            debug!("complete_open on '{}' which is not open", self.nickname);
        }
        if meta.email.is_some() {
            self.email = meta.email.clone();
        }
        self.file_index = meta.file_index;
    }

    pub fn is_nickname(&self, nickname: &str) -> bool {
        self.nickname == nickname
    }

    /// Authenticates a holder whose chunk was discovered through the
    /// common section. The chunk image is already in memory; no file
    /// access happens here.
    ///
    /// # Errors
    ///
    /// `Error::TryAlreadyOpen` when the holder is not closed,
    /// `Error::TryNotFound` when the password does not match or the magic
    /// stays wrong after decryption, `Error::TryInconsistent` when the
    /// decrypted counts disagree with the common section.
    pub fn try_late(&mut self, password: &str, crypto: &mut dyn CryptoProvider) -> Result<(u16, u16)> {
        if self.chunk_status != ChunkStatus::Closed {
            return Err(Error::TryAlreadyOpen);
        }

        let fields = ChunkFields::read(&self.chunk);
        let hash = crypto.sha256_iterated_mix1(&self.nickname, &fields.salt1, password);
        if !digests_equal(&fields.hash, &hash) {
            return Err(Error::TryNotFound);
        }

        let mut pkey = crypto.sha256_iterated_mix1(&self.nickname, &fields.salt2, password);
        let mut clear = *self.chunk;
        let iv = chunk_iv(&fields.salt1);
        crypto.aes256_cbc(&mut clear[CHUNK_AES_OFFSET..], &pkey, &iv, false)?;
        let fields = ChunkFields::read(&clear);
        if fields.magic != CHUNK_MAGIC {
            unsafe {
                memzero(clear.as_mut_ptr(), CHUNK_SIZE);
            }
            return Err(Error::TryNotFound);
        }
        if fields.id_holder != self.id_holder
            || fields.common_nb_parts != self.common_nb_parts
            || fields.secret_nb_parts != self.secret_nb_parts
        {
            unsafe {
                memzero(clear.as_mut_ptr(), CHUNK_SIZE);
            }
            return Err(Error::TryInconsistent);
        }

        self.pkey = SecretBytes::from_mut(&mut pkey)?;
        self.salt1 = fields.salt1;
        self.salt2 = fields.salt2;
        self.hash = fields.hash;
        *self.parts = fields.parts;
        self.xparts = fields.xparts;
        *self.chunk = clear;
        self.chunk_status = ChunkStatus::Open;
        debug!("'{}' opened late, magic ok", self.nickname);
        Ok((self.common_nb_parts, self.secret_nb_parts))
    }

    /// Recomputes the derived keys from a new password. Only holders whose
    /// chunk is open (or not yet written) can change their password, as a
    /// closed chunk would not be re-encoded.
    pub fn set_password(&mut self, password: &str, crypto: &mut dyn CryptoProvider) -> Result<()> {
        if self.chunk_status == ChunkStatus::Closed {
            return Err(Error::TryAlreadyOpen);
        }
        let mut pkey = crypto.sha256_iterated_mix1(&self.nickname, &self.salt2, password);
        self.hash = crypto.sha256_iterated_mix1(&self.nickname, &self.salt1, password);
        self.pkey = SecretBytes::from_mut(&mut pkey)?;
        self.password_set = true;
        Ok(())
    }

    /// Checks a proposed password against the stored hash; used by the
    /// password-change dialogue, not by `try`.
    pub fn test_password(&self, password: &str, crypto: &dyn CryptoProvider) -> bool {
        if self.chunk_status == ChunkStatus::Closed {
            return false;
        }
        let hash = crypto.sha256_iterated_mix1(&self.nickname, &self.salt1, password);
        digests_equal(&hash, &self.hash)
    }

    pub fn nb_common(&self) -> u16 {
        self.common_nb_parts
    }

    pub fn nb_secret(&self) -> u16 {
        self.secret_nb_parts
    }

    /// Changes the number of common-tier parts and re-emits every share.
    pub fn set_nb_common(
        &mut self,
        n: u16,
        crypto: &mut dyn CryptoProvider,
        sss_common: &mut Shamir,
        sss_secret: &mut Shamir,
    ) -> Result<()> {
        if usize::from(n) + usize::from(self.secret_nb_parts) > MAX_PARTS {
            return Err(Error::InvalidArg(format!(
                "{} common + {} secret parts exceed the {} slots",
                n, self.secret_nb_parts, MAX_PARTS
            )));
        }
        self.common_nb_parts = n;
        self.emit_parts(crypto, sss_common, sss_secret)
    }

    /// Changes the number of secret-tier parts and re-emits every share.
    pub fn set_nb_secret(
        &mut self,
        n: u16,
        crypto: &mut dyn CryptoProvider,
        sss_common: &mut Shamir,
        sss_secret: &mut Shamir,
    ) -> Result<()> {
        if usize::from(self.common_nb_parts) + usize::from(n) > MAX_PARTS {
            return Err(Error::InvalidArg(format!(
                "{} common + {} secret parts exceed the {} slots",
                self.common_nb_parts, n, MAX_PARTS
            )));
        }
        self.secret_nb_parts = n;
        self.emit_parts(crypto, sss_common, sss_secret)
    }

    /// Emits or re-emits the shares for both tiers. Common shares occupy
    /// slots 0..common_nb_parts, secret shares slots
    /// 8-secret_nb_parts..8, and every slot is first refilled with fresh
    /// random noise so used and unused slots stay indistinguishable.
    fn emit_parts(
        &mut self,
        crypto: &mut dyn CryptoProvider,
        sss_common: &mut Shamir,
        sss_secret: &mut Shamir,
    ) -> Result<()> {
        let common = usize::from(self.common_nb_parts);
        let secret = usize::from(self.secret_nb_parts);
        if common + secret > MAX_PARTS {
            return Err(Error::InvalidArg("part counts exceed the chunk slots".into()));
        }
        if self.chunk_status == ChunkStatus::Closed {
            return Err(Error::TryAlreadyOpen);
        }

        for slot in 0..MAX_PARTS {
            crypto.random_fill(&mut self.parts[slot])?;
            let mut raw = [0u8; 8];
            crypto.random_fill(&mut raw)?;
            self.xparts[slot] = LittleEndian::read_u64(&raw);
        }

        for slot in 0..common {
            let x = share_abscissa(self.id_holder, slot, crypto)?;
            sss_common.get_part(&mut self.parts[slot], x, crypto)?;
            self.xparts[slot] = x;
            debug!(
                "'{}' common share slot {} x={:x}",
                self.nickname, slot, x
            );
        }
        for slot in (MAX_PARTS - secret..MAX_PARTS).rev() {
            let x = share_abscissa(self.id_holder, slot, crypto)?;
            sss_secret.get_part(&mut self.parts[slot], x, crypto)?;
            self.xparts[slot] = x;
            debug!(
                "'{}' secret share slot {} x={:x}",
                self.nickname, slot, x
            );
        }
        Ok(())
    }

    /// The i-th common share of this holder, i < common_nb_parts.
    pub fn common_part(&self, i: usize) -> (u64, &[u8; 32]) {
        (self.xparts[i], &self.parts[i])
    }

    /// The i-th secret share of this holder, i < secret_nb_parts; secret
    /// shares are stored from the last slot downwards.
    pub fn secret_part(&self, i: usize) -> (u64, &[u8; 32]) {
        let slot = MAX_PARTS - 1 - i;
        (self.xparts[slot], &self.parts[slot])
    }

    /// Raw share slot access, for inspection.
    pub fn slot(&self, i: usize) -> (u64, &[u8; 32]) {
        (self.xparts[i], &self.parts[i])
    }

    pub fn chunk_image(&self) -> &[u8; CHUNK_SIZE] {
        &self.chunk
    }

    /// Counts the parts this holder can contribute right now: only open
    /// (or freshly created) chunks have usable share material.
    pub fn parts_available(&self) -> (u16, u16) {
        match self.chunk_status {
            ChunkStatus::Open | ChunkStatus::None => (self.common_nb_parts, self.secret_nb_parts),
            ChunkStatus::Closed => (0, 0),
        }
    }

    /// Counts the parts this holder owns, whether or not it is open.
    pub fn parts_distributed(&self) -> (u16, u16) {
        (self.common_nb_parts, self.secret_nb_parts)
    }

    /// The thresholds this holder's decrypted chunk declares. The
    /// thresholds are a database property, but the first open chunk is how
    /// the engine learns them.
    pub fn declared_thresholds(&self) -> Option<(u16, u16)> {
        if self.chunk_status != ChunkStatus::Open {
            return None;
        }
        let fields = ChunkFields::read(&self.chunk);
        Some((fields.common_threshold, fields.secret_threshold))
    }

    /// Writes the 512-byte chunk. Closed holders are rewritten verbatim;
    /// open and new holders are re-encoded and re-encrypted with the
    /// current derived key.
    pub fn save_chunk<W: Write>(
        &mut self,
        out: &mut W,
        crypto: &mut dyn CryptoProvider,
        common_threshold: u16,
        secret_threshold: u16,
        common_magic: u64,
    ) -> Result<()> {
        match self.chunk_status {
            ChunkStatus::Closed => {
                debug!("writing chunk '{}' verbatim (closed)", self.nickname);
                out.write_all(&self.chunk[..])?;
                Ok(())
            }
            ChunkStatus::None | ChunkStatus::Open => {
                if !self.password_set {
                    return Err(Error::InvalidArg(format!(
                        "holder '{}' has no password yet",
                        self.nickname
                    )));
                }
                let fields = ChunkFields {
                    salt1: self.salt1,
                    hash: self.hash,
                    salt2: self.salt2,
                    parts: *self.parts,
                    xparts: self.xparts,
                    common_threshold,
                    common_nb_parts: self.common_nb_parts,
                    secret_threshold,
                    secret_nb_parts: self.secret_nb_parts,
                    common_magic,
                    id_holder: self.id_holder,
                    version: CHUNK_VERSION,
                    magic: CHUNK_MAGIC,
                };
                fields.write(&mut self.chunk);

                // The in-memory image stays in clear; encryption happens on
                // a scratch copy.
                let mut enc = [0u8; CHUNK_AES_SIZE];
                enc.copy_from_slice(&self.chunk[CHUNK_AES_OFFSET..]);
                let iv = chunk_iv(&self.salt1);
                crypto.aes256_cbc(&mut enc, self.pkey.as_bytes(), &iv, true)?;
                out.write_all(&self.chunk[..CHUNK_AES_OFFSET])?;
                out.write_all(&enc)?;
                Ok(())
            }
        }
    }

    /// The common-section entry for this holder.
    pub fn to_meta(&self) -> HolderMeta {
        HolderMeta {
            nickname: self.nickname.clone(),
            id_holder: self.id_holder,
            common_nb_parts: self.common_nb_parts,
            secret_nb_parts: self.secret_nb_parts,
            file_index: self.file_index,
            email: self.email.clone(),
        }
    }
}

// Share material and the decrypted image are sensitive; the derived key
// wipes itself.
impl Drop for Holder {
    fn drop(&mut self) {
        unsafe {
            memzero(self.parts.as_mut_ptr() as *mut u8, MAX_PARTS * 32);
            memzero(self.xparts.as_mut_ptr() as *mut u8, MAX_PARTS * 8);
            memzero(self.chunk.as_mut_ptr(), CHUNK_SIZE);
        }
    }
}

/// The chunk IV is the first half of salt1.
pub fn chunk_iv(salt1: &[u8; 32]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&salt1[..16]);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::OsCrypto;

    fn contexts(crypto: &mut OsCrypto) -> (Shamir, Shamir) {
        let mut common = Shamir::new(256, 2).expect("ctx");
        let mut secret = Shamir::new(256, 2).expect("ctx");
        let mut key = [0u8; 32];
        crypto.random_fill(&mut key).expect("rng");
        common.set_secret(&key);
        crypto.random_fill(&mut key).expect("rng");
        secret.set_secret(&key);
        (common, secret)
    }

    #[test]
    fn test_chunk_fields_round_trip() {
        let mut crypto = OsCrypto::new().expect("rng");
        let mut buf = [0u8; CHUNK_SIZE];
        crypto.random_fill(&mut buf[..]).expect("rng");

        let fields = ChunkFields {
            salt1: [1u8; 32],
            hash: [2u8; 32],
            salt2: [3u8; 32],
            parts: [[4u8; 32]; MAX_PARTS],
            xparts: [0x1122334455667788u64; MAX_PARTS],
            common_threshold: 2,
            common_nb_parts: 1,
            secret_threshold: 3,
            secret_nb_parts: 2,
            common_magic: 0xdeadbeefcafef00d,
            id_holder: 42,
            version: CHUNK_VERSION,
            magic: CHUNK_MAGIC,
        };
        fields.write(&mut buf);
        let back = ChunkFields::read(&buf);
        assert_eq!(back.salt1, fields.salt1);
        assert_eq!(back.parts[7], fields.parts[7]);
        assert_eq!(back.xparts, fields.xparts);
        assert_eq!(back.common_threshold, 2);
        assert_eq!(back.secret_nb_parts, 2);
        assert_eq!(back.common_magic, fields.common_magic);
        assert_eq!(back.id_holder, 42);
        assert_eq!(back.version, CHUNK_VERSION);
        assert_eq!(back.magic, CHUNK_MAGIC);
        // The trailing magic really is trailing.
        assert_eq!(LittleEndian::read_u64(&buf[504..]), CHUNK_MAGIC);
    }

    #[test]
    fn test_save_and_blind_reopen() {
        let mut crypto = OsCrypto::new().expect("rng");
        let (mut sss_c, mut sss_s) = contexts(&mut crypto);
        let mut holder =
            Holder::create("alice", 1, &mut crypto, &mut sss_c, &mut sss_s).expect("create");
        holder.set_password("s3cret", &mut crypto).expect("password");

        let mut file = Vec::new();
        holder
            .save_chunk(&mut file, &mut crypto, 2, 2, 0x1234)
            .expect("save");
        assert_eq!(file.len(), CHUNK_SIZE);

        // Blind lookup: only the hash recomputed from (nickname, salt1,
        // password) identifies the chunk.
        let mut block = [0u8; CHUNK_SIZE];
        block.copy_from_slice(&file);
        let raw = ChunkFields::read(&block);
        let probe = crypto.sha256_iterated_mix1("alice", &raw.salt1, "wrong");
        assert!(!digests_equal(&raw.hash, &probe));
        let probe = crypto.sha256_iterated_mix1("alice", &raw.salt1, "s3cret");
        assert!(digests_equal(&raw.hash, &probe));

        // And the encrypted region decrypts to a valid chunk.
        let mut pkey = crypto.sha256_iterated_mix1("alice", &raw.salt2, "s3cret");
        let iv = chunk_iv(&raw.salt1);
        crypto
            .aes256_cbc(&mut block[CHUNK_AES_OFFSET..], &pkey, &iv, false)
            .expect("decrypt");
        let clear = ChunkFields::read(&block);
        assert_eq!(clear.magic, CHUNK_MAGIC);
        assert_eq!(clear.version, CHUNK_VERSION);
        assert_eq!(clear.id_holder, 1);
        assert_eq!(clear.common_nb_parts, 1);
        assert_eq!(clear.secret_nb_parts, 1);
        assert_eq!(clear.common_magic, 0x1234);

        let reopened = Holder::from_chunk("alice", &block, 0, &mut pkey).expect("reopen");
        assert_eq!(reopened.common_part(0).0, holder.common_part(0).0);
        assert_eq!(reopened.secret_part(0).1, holder.secret_part(0).1);
    }

    #[test]
    fn test_slot_separation_and_rerandomisation() {
        let mut crypto = OsCrypto::new().expect("rng");
        let (mut sss_c, mut sss_s) = contexts(&mut crypto);
        let mut holder =
            Holder::create("bob", 2, &mut crypto, &mut sss_c, &mut sss_s).expect("create");

        holder
            .set_nb_common(3, &mut crypto, &mut sss_c, &mut sss_s)
            .expect("3 common");
        holder
            .set_nb_secret(4, &mut crypto, &mut sss_c, &mut sss_s)
            .expect("4 secret");

        // Slots 0..3 common, slot 3 unused, slots 4..8 secret.
        for i in 0..3 {
            assert_eq!(holder.slot(i).0 & 0xffff, 2);
            assert_eq!((holder.slot(i).0 >> 16) & 7, i as u64);
        }
        for i in 4..8 {
            assert_eq!(holder.slot(i).0 & 0xffff, 2);
            assert_eq!((holder.slot(i).0 >> 16) & 7, i as u64);
        }

        // Re-emission regenerates the unused slot too.
        let unused_before = *holder.slot(3).1;
        holder
            .set_nb_secret(4, &mut crypto, &mut sss_c, &mut sss_s)
            .expect("re-emit");
        assert_ne!(*holder.slot(3).1, unused_before);

        // Overflowing the eight slots is rejected.
        assert!(holder
            .set_nb_common(5, &mut crypto, &mut sss_c, &mut sss_s)
            .is_err());
    }

    #[test]
    fn test_password_check() {
        let mut crypto = OsCrypto::new().expect("rng");
        let (mut sss_c, mut sss_s) = contexts(&mut crypto);
        let mut holder =
            Holder::create("carol", 3, &mut crypto, &mut sss_c, &mut sss_s).expect("create");
        assert!(!holder.password_set);
        holder.set_password("tango", &mut crypto).expect("password");
        assert!(holder.password_set);
        assert!(holder.test_password("tango", &crypto));
        assert!(!holder.test_password("tang0", &crypto));
    }
}
