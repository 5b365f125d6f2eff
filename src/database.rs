//! The root aggregate: the unlock-level state machine, the blind file scan
//! matching holder chunks, the encrypted common section, and the save
//! protocol. A database climbs the levels NONE → FIRST → COMMON → SECRET as
//! holders authenticate; it never steps back down within a session.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;

use byteorder::{ByteOrder, LittleEndian};
use memsec::memzero;
use serde_json;

use crypto::{digests_equal, CryptoProvider};
use error::{Error, Result};
use holder::{
    chunk_iv, ChunkFields, ChunkStatus, Holder, HolderMeta, CHUNK_AES_OFFSET, CHUNK_MAGIC,
    CHUNK_SIZE,
};
use secret::{self, FieldValue, SecretFolder, SecretItem};
use sss::Shamir;
use SecretBytes;

/// Marker glued between the last holder chunk and the ciphertext; the
/// first 16 salt bytes double as the CBC IV of what follows.
const COMMON_MARKER_SIZE: usize = 64;
/// Literal closing the common-section plaintext, right after its NUL
/// terminator.
const COMMON_SECTION_MAGIC: &[u8; 8] = b"MAGICCOM";

bitflags! {
    /// What changed since the last save.
    pub struct ChangedFlags: u32 {
        /// An open holder changed their password.
        const PASSWORD = 1;
        /// A secret entry was modified.
        const SECRET = 2;
        /// A holder was added, removed, or had mail/part counts edited.
        const HOLDER = 4;
        /// The database was just created and never written.
        const NEW = 8;
        /// Something else.
        const OTHER = 16;
    }
}

/// How far the database is unlocked. The order of the variants is the
/// order of the levels.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Level {
    /// Brand-new in-memory database; thresholds and keys exist but no file
    /// has been written yet.
    Init,
    /// An existing file is attached but nobody authenticated; the file
    /// cannot yet be told apart from random bytes.
    None,
    /// At least one holder was recognised, no common quorum yet.
    First,
    /// Common quorum reached; metadata and the secret tree are readable.
    Common,
    /// Secret quorum reached; everything is readable and editable.
    Secret,
}

/// The cleartext layout of the common section.
#[derive(Serialize, Deserialize)]
struct CommonSection {
    common_treshold: u16,
    secret_treshold: u16,
    next_id_holder: u16,
    holders: Vec<HolderMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_folder: Option<SecretFolder>,
}

struct FoundChunk {
    chunk: [u8; CHUNK_SIZE],
    pkey: [u8; 32],
    file_index: usize,
    marker_index: Option<usize>,
}

pub struct Database {
    filename: Option<PathBuf>,
    status: Level,
    common_threshold: Option<u16>,
    secret_threshold: Option<u16>,
    next_id_holder: u16,
    nb_holders: usize,
    changed: ChangedFlags,
    common_magic: u64,
    common_key: Option<SecretBytes>,
    secret_key: Option<SecretBytes>,
    sss_common: Option<Shamir>,
    sss_secret: Option<Shamir>,
    holders: Vec<Holder>,
    root_folder: Option<SecretFolder>,
    current_folder: u32,
    crypto: Box<dyn CryptoProvider>,
}

impl Database {
    /// Creates a new, empty database: fresh tier keys, fresh common magic,
    /// status `Init`. Nothing exists on disk until the first save.
    pub fn create(
        common_threshold: u16,
        secret_threshold: u16,
        filename: Option<&Path>,
        mut crypto: Box<dyn CryptoProvider>,
    ) -> Result<Database> {
        if common_threshold < 1 || secret_threshold < 1 {
            return Err(Error::InvalidArg("thresholds must be at least 1".into()));
        }

        let mut sss_common = Shamir::new(256, usize::from(common_threshold))?;
        let mut key = [0u8; 32];
        crypto.random_fill(&mut key)?;
        sss_common.set_secret(&key);
        let common_key = SecretBytes::from_mut(&mut key)?;
        debug!("new common key {:?}", common_key);

        let mut sss_secret = Shamir::new(256, usize::from(secret_threshold))?;
        crypto.random_fill(&mut key)?;
        sss_secret.set_secret(&key);
        let secret_key = SecretBytes::from_mut(&mut key)?;

        let mut magic_raw = [0u8; 8];
        crypto.random_fill(&mut magic_raw)?;
        let common_magic = LittleEndian::read_u64(&magic_raw);

        Ok(Database {
            filename: filename.map(Path::to_path_buf),
            status: Level::Init,
            common_threshold: Some(common_threshold),
            secret_threshold: Some(secret_threshold),
            next_id_holder: 1,
            nb_holders: 0,
            changed: ChangedFlags::NEW,
            common_magic,
            common_key: Some(common_key),
            secret_key: Some(secret_key),
            sss_common: Some(sss_common),
            sss_secret: Some(sss_secret),
            holders: Vec::new(),
            root_folder: None,
            current_folder: 1,
            crypto,
        })
    }

    /// Attaches an existing file. Thresholds and key material stay unknown
    /// until holders authenticate through `try_holder`.
    pub fn open(filename: &Path, crypto: Box<dyn CryptoProvider>) -> Result<Database> {
        fs::metadata(filename)?;
        Ok(Database {
            filename: Some(filename.to_path_buf()),
            status: Level::None,
            common_threshold: None,
            secret_threshold: None,
            next_id_holder: 1,
            nb_holders: 0,
            changed: ChangedFlags::empty(),
            common_magic: 0,
            common_key: None,
            secret_key: None,
            sss_common: None,
            sss_secret: None,
            holders: Vec::new(),
            root_folder: None,
            current_folder: 1,
            crypto,
        })
    }

    pub fn status(&self) -> Level {
        self.status
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_ref().map(PathBuf::as_path)
    }

    pub fn set_filename(&mut self, filename: &Path) {
        self.filename = Some(filename.to_path_buf());
    }

    pub fn thresholds(&self) -> (Option<u16>, Option<u16>) {
        (self.common_threshold, self.secret_threshold)
    }

    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn set_changed(&mut self, flags: ChangedFlags) {
        self.changed |= flags;
    }

    pub fn holders(&self) -> &[Holder] {
        &self.holders
    }

    pub fn nb_holders(&self) -> usize {
        self.nb_holders
    }

    pub fn find_holder(&self, nickname: &str) -> Option<usize> {
        self.holders.iter().position(|h| h.is_nickname(nickname))
    }

    fn next_holder_id(&mut self) -> Result<u16> {
        if self.next_id_holder == ::std::u16::MAX {
            return Err(Error::InvalidArg("holder ids exhausted".into()));
        }
        let id = self.next_id_holder;
        self.next_id_holder += 1;
        Ok(id)
    }

    /// Sums the parts usable right now (open and freshly created holders).
    pub fn parts_available(&self) -> (u32, u32) {
        self.holders.iter().fold((0, 0), |(c, s), h| {
            let (hc, hs) = h.parts_available();
            (c + u32::from(hc), s + u32::from(hs))
        })
    }

    /// Sums the parts distributed over all holders, open or not.
    pub fn parts_distributed(&self) -> (u32, u32) {
        self.holders.iter().fold((0, 0), |(c, s), h| {
            let (hc, hs) = h.parts_distributed();
            (c + u32::from(hc), s + u32::from(hs))
        })
    }

    /// The thresholds as declared by the open chunks; the first open chunk
    /// is how the engine learns them on an existing file.
    fn chunk_thresholds(&self) -> Option<(u16, u16)> {
        let mut result = None;
        for holder in &self.holders {
            if let Some(t) = holder.declared_thresholds() {
                match result {
                    None => result = Some(t),
                    Some(prev) => {
                        if prev != t {
                            debug!("chunks disagree on thresholds: {:?} vs {:?}", prev, t);
                        }
                    }
                }
            }
        }
        result
    }

    /// One `try` step: authenticate a holder and lift the level as far as
    /// the recovered parts allow. Returns the parts this holder brought.
    ///
    /// A failed try leaves the state machine unchanged.
    pub fn try_holder(&mut self, nickname: &str, password: &str) -> Result<(u16, u16)> {
        match self.status {
            Level::Init => Err(Error::WrongLevel),
            Level::Common | Level::Secret => {
                // Everyone is already known from the common section; work
                // in memory.
                let idx = self.find_holder(nickname).ok_or(Error::TryNotFound)?;
                if self.holders[idx].chunk_status == ChunkStatus::Open {
                    return Err(Error::TryAlreadyOpen);
                }
                let gains = self.holders[idx].try_late(password, &mut *self.crypto)?;
                if self.status != Level::Secret {
                    self.check_level()?;
                }
                Ok(gains)
            }
            Level::None | Level::First => {
                // Blind scan of the file.
                let mut found = match self.find_chunk_holder(nickname, password)? {
                    Some(found) => found,
                    None => return Err(Error::TryNotFound),
                };
                if let Some(idx) = self.find_holder(nickname) {
                    return if self.holders[idx].chunk_image()[..] == found.chunk[..] {
                        Err(Error::TryAlreadyOpen)
                    } else {
                        Err(Error::TryInconsistent)
                    };
                }
                let fields = ChunkFields::read(&found.chunk);
                if fields.magic != CHUNK_MAGIC {
                    debug!("hash matched at {} but magic is wrong", found.file_index);
                    return Err(Error::TryNotFound);
                }
                let holder = Holder::from_chunk(
                    nickname,
                    &found.chunk,
                    found.file_index as i64,
                    &mut found.pkey,
                )?;
                let gains = (holder.common_nb_parts, holder.secret_nb_parts);
                self.common_magic = fields.common_magic;
                self.holders.push(holder);
                if let Some(marker) = found.marker_index {
                    if self.nb_holders == 0 {
                        self.nb_holders = marker;
                    } else if self.nb_holders != marker {
                        debug!(
                            "marker position {} disagrees with nb_holders {}",
                            marker, self.nb_holders
                        );
                    }
                }
                self.check_level()?;
                Ok(gains)
            }
        }
    }

    /// Walks the file in 512-byte blocks: first recompute the blind-lookup
    /// hash for each block until one matches, then keep going until the
    /// common marker is recognised through the chunk's magic.
    fn find_chunk_holder(&mut self, nickname: &str, password: &str) -> Result<Option<FoundChunk>> {
        let path = self.filename.clone().ok_or(Error::NoDatabase)?;
        let mut file = File::open(&path)?;
        let mut block = [0u8; CHUNK_SIZE];
        let mut index = 0usize;
        let mut found: Option<FoundChunk> = None;

        loop {
            let read = read_up_to(&mut file, &mut block)?;
            if read == 0 {
                break;
            }
            if found.is_none() && read == CHUNK_SIZE {
                let mut salt1 = [0u8; 32];
                salt1.copy_from_slice(&block[..32]);
                let mut stored = [0u8; 32];
                stored.copy_from_slice(&block[32..64]);
                let probe = self.crypto.sha256_iterated_mix1(nickname, &salt1, password);
                if digests_equal(&stored, &probe) {
                    debug!("chunk found at position {}", index);
                    let mut salt2 = [0u8; 32];
                    salt2.copy_from_slice(&block[64..96]);
                    let pkey = self.crypto.sha256_iterated_mix1(nickname, &salt2, password);
                    let mut clear = block;
                    let iv = chunk_iv(&salt1);
                    self.crypto
                        .aes256_cbc(&mut clear[CHUNK_AES_OFFSET..], &pkey, &iv, false)?;
                    found = Some(FoundChunk {
                        chunk: clear,
                        pkey,
                        file_index: index,
                        marker_index: None,
                    });
                    index += 1;
                    continue;
                }
            }
            if let Some(ref mut fc) = found {
                if read >= COMMON_MARKER_SIZE {
                    let fields = ChunkFields::read(&fc.chunk);
                    let mut salt = [0u8; 32];
                    salt.copy_from_slice(&block[..32]);
                    let mut stored = [0u8; 32];
                    stored.copy_from_slice(&block[32..64]);
                    let probe = self.crypto.sha256_mix2(&salt, fields.common_magic);
                    if digests_equal(&stored, &probe) {
                        debug!("common marker found at position {}", index);
                        fc.marker_index = Some(index);
                        break;
                    }
                }
            }
            index += 1;
        }
        Ok(found)
    }

    /// Lifts the level as far as the currently available parts permit.
    fn check_level(&mut self) -> Result<()> {
        let (avail_c, avail_s) = self.parts_available();
        let needed = self.chunk_thresholds();
        debug!(
            "parts available {}/{}, thresholds {:?}",
            avail_c, avail_s, needed
        );

        if self.status == Level::None && avail_c > 0 {
            if let Some((c, s)) = needed {
                self.common_threshold = Some(c);
                self.secret_threshold = Some(s);
            }
            self.status = Level::First;
            debug!("level NONE -> FIRST");
        }
        if self.status == Level::First {
            if let Some(c) = self.common_threshold {
                if avail_c >= u32::from(c) {
                    self.open_common()?;
                    self.status = Level::Common;
                    debug!("level FIRST -> COMMON");
                }
            }
        }
        if self.status == Level::Common {
            if let Some(s) = self.secret_threshold {
                if avail_s >= u32::from(s) {
                    self.open_secret()?;
                    self.status = Level::Secret;
                    debug!("level COMMON -> SECRET");
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the common key from the queued common-tier shares, then
    /// reads and parses the common section.
    fn open_common(&mut self) -> Result<()> {
        let threshold = usize::from(self.common_threshold.ok_or(Error::WrongLevel)?);
        if self.sss_common.is_some() {
            debug!("sss_common context already allocated");
        }
        let mut sss = Shamir::new(256, threshold)?;
        'feed: for holder in &self.holders {
            let (avail, _) = holder.parts_available();
            for i in 0..usize::from(avail) {
                let (x, y) = holder.common_part(i);
                match sss.set_part(y, x) {
                    Ok(()) => debug!("queued common part x={:x}", x),
                    Err(Error::ManyParts(_)) => break 'feed,
                    Err(e) => return Err(e),
                }
            }
        }
        if sss.missing_parts() != 0 {
            return Err(Error::NotEnoughShares);
        }
        sss.recoef = true;
        sss.combine()?;
        let mut key = [0u8; 32];
        sss.get_secret(&mut key)?;
        self.common_key = Some(SecretBytes::from_mut(&mut key)?);
        self.sss_common = Some(sss);
        self.read_common()
    }

    /// Rebuilds the secret key from the queued secret-tier shares.
    fn open_secret(&mut self) -> Result<()> {
        let threshold = usize::from(self.secret_threshold.ok_or(Error::WrongLevel)?);
        if self.sss_secret.is_some() {
            debug!("sss_secret context already allocated");
        }
        let mut sss = Shamir::new(256, threshold)?;
        'feed: for holder in &self.holders {
            let (_, avail) = holder.parts_available();
            for i in 0..usize::from(avail) {
                let (x, y) = holder.secret_part(i);
                match sss.set_part(y, x) {
                    Ok(()) => debug!("queued secret part x={:x}", x),
                    Err(Error::ManyParts(_)) => break 'feed,
                    Err(e) => return Err(e),
                }
            }
        }
        if sss.missing_parts() != 0 {
            return Err(Error::NotEnoughShares);
        }
        sss.recoef = true;
        sss.combine()?;
        let mut key = [0u8; 32];
        sss.get_secret(&mut key)?;
        self.secret_key = Some(SecretBytes::from_mut(&mut key)?);
        self.sss_secret = Some(sss);
        Ok(())
    }

    /// Decrypts the common section and rebuilds the in-memory model:
    /// holders not yet authenticated come up CLOSED with their chunk image
    /// loaded, the secret tree is attached.
    fn read_common(&mut self) -> Result<()> {
        let path = self.filename.clone().ok_or(Error::NoDatabase)?;
        let mut file = File::open(&path)?;
        let filesize = file.metadata()?.len();
        let common_pos = (self.nb_holders * CHUNK_SIZE) as u64;
        if filesize < common_pos + COMMON_MARKER_SIZE as u64 + 16 {
            return Err(Error::IntegrityFail("file too short for a common section"));
        }

        // The first half of the marker salt is the CBC IV.
        file.seek(SeekFrom::Start(common_pos))?;
        let mut iv = [0u8; 16];
        file.read_exact(&mut iv)?;

        let cipher_pos = common_pos + COMMON_MARKER_SIZE as u64;
        let cipher_len = ((filesize - cipher_pos) & !15) as usize;
        file.seek(SeekFrom::Start(cipher_pos))?;
        let mut buf = vec![0u8; cipher_len];
        file.read_exact(&mut buf)?;

        {
            let key = self.common_key.as_ref().ok_or(Error::WrongLevel)?;
            self.crypto.aes256_cbc(&mut buf, key.as_bytes(), &iv, false)?;
        }

        // The plaintext must read JSON ‖ NUL ‖ "MAGICCOM"; anything else is
        // a wrong key or tampering.
        let check = |buf: &[u8]| -> Result<usize> {
            let nul = buf
                .iter()
                .position(|&b| b == 0)
                .ok_or(Error::IntegrityFail("common section has no terminator"))?;
            if nul <= 20 {
                return Err(Error::IntegrityFail("common section too short"));
            }
            if buf.len() < nul + 1 + COMMON_SECTION_MAGIC.len()
                || &buf[nul + 1..nul + 1 + COMMON_SECTION_MAGIC.len()] != &COMMON_SECTION_MAGIC[..]
            {
                return Err(Error::IntegrityFail("common section magic mismatch"));
            }
            Ok(nul)
        };
        let nul = match check(&buf) {
            Ok(nul) => nul,
            Err(e) => {
                unsafe {
                    memzero(buf.as_mut_ptr(), buf.len());
                }
                return Err(e);
            }
        };

        let parsed: ::std::result::Result<CommonSection, _> = serde_json::from_slice(&buf[..nul]);
        unsafe {
            memzero(buf.as_mut_ptr(), buf.len());
        }
        let section = parsed.map_err(|e| {
            debug!("common section JSON rejected: {}", e);
            Error::IntegrityFail("common section is not valid JSON")
        })?;

        self.apply_common(section, &path)
    }

    fn apply_common(&mut self, section: CommonSection, path: &Path) -> Result<()> {
        match self.common_threshold {
            Some(c) if c != section.common_treshold => {
                debug!("common threshold mismatch: chunk {} json {}", c, section.common_treshold)
            }
            None => self.common_threshold = Some(section.common_treshold),
            _ => {}
        }
        match self.secret_threshold {
            Some(s) if s != section.secret_treshold => {
                debug!("secret threshold mismatch: chunk {} json {}", s, section.secret_treshold)
            }
            None => self.secret_threshold = Some(section.secret_treshold),
            _ => {}
        }
        self.next_id_holder = section.next_id_holder;
        if self.nb_holders != 0 && self.nb_holders != section.holders.len() {
            debug!(
                "marker said {} holders, the common section lists {}",
                self.nb_holders,
                section.holders.len()
            );
        }

        let mut file = File::open(path)?;
        for meta in &section.holders {
            match self.find_holder(&meta.nickname) {
                Some(idx) => self.holders[idx].complete_open(meta),
                None => {
                    if meta.file_index < 0 {
                        return Err(Error::IntegrityFail("holder entry without a file index"));
                    }
                    let mut image = [0u8; CHUNK_SIZE];
                    file.seek(SeekFrom::Start(meta.file_index as u64 * CHUNK_SIZE as u64))?;
                    file.read_exact(&mut image)?;
                    debug!("holder '{}' loaded closed", meta.nickname);
                    self.holders.push(Holder::from_common(meta, &image)?);
                }
            }
        }

        if self.root_folder.is_some() {
            debug!("root folder was already loaded");
        }
        self.root_folder = section.root_folder;
        self.current_folder = 1;
        Ok(())
    }

    /// Persists the whole database. Writes go to a temporary sibling which
    /// replaces the destination only on success, so an interrupted save
    /// never truncates the only copy.
    ///
    /// # Errors
    ///
    /// `Error::InsufficientShares` when fewer parts than a threshold are
    /// distributed: the file would never open again.
    pub fn save(&mut self, filename: Option<&Path>) -> Result<()> {
        if let Some(f) = filename {
            self.filename = Some(f.to_path_buf());
        }
        let path = match self.filename.clone() {
            Some(p) => p,
            None => return Err(Error::InvalidArg("no file name".into())),
        };
        if self.status != Level::Init && self.status < Level::Common {
            return Err(Error::WrongLevel);
        }
        let common_threshold = self.common_threshold.ok_or(Error::WrongLevel)?;
        let secret_threshold = self.secret_threshold.ok_or(Error::WrongLevel)?;

        let (dist_c, dist_s) = self.parts_distributed();
        if dist_c < u32::from(common_threshold) {
            return Err(Error::InsufficientShares {
                tier: "common",
                distributed: dist_c,
                threshold: u32::from(common_threshold),
            });
        }
        if dist_s < u32::from(secret_threshold) {
            return Err(Error::InsufficientShares {
                tier: "secret",
                distributed: dist_s,
                threshold: u32::from(secret_threshold),
            });
        }

        let tmp_path = temp_sibling(&path);
        let write_result = self.write_file(&tmp_path, common_threshold, secret_threshold);
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &path)?;

        self.changed = ChangedFlags::empty();
        self.nb_holders = self.holders.len();
        if self.status == Level::Init {
            self.status = Level::Secret;
        }
        Ok(())
    }

    fn write_file(
        &mut self,
        path: &Path,
        common_threshold: u16,
        secret_threshold: u16,
    ) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);

        // Holder chunks, in list order; the order fixes each file_index.
        for (i, holder) in self.holders.iter_mut().enumerate() {
            holder.file_index = i as i64;
            holder.save_chunk(
                &mut out,
                &mut *self.crypto,
                common_threshold,
                secret_threshold,
                self.common_magic,
            )?;
        }

        // Fresh random marker.
        let mut salt = [0u8; 32];
        self.crypto.random_fill(&mut salt)?;
        let hash = self.crypto.sha256_mix2(&salt, self.common_magic);
        out.write_all(&salt)?;
        out.write_all(&hash)?;

        // The common section: JSON ‖ NUL ‖ MAGICCOM ‖ random, block-padded.
        let section = CommonSection {
            common_treshold: common_threshold,
            secret_treshold: secret_threshold,
            next_id_holder: self.next_id_holder,
            holders: self.holders.iter().map(Holder::to_meta).collect(),
            root_folder: self.root_folder.clone(),
        };
        let json = serde_json::to_vec(&section)
            .map_err(|_| Error::IntegrityFail("common section serialisation failed"))?;
        let len_aes = (json.len() + 24) & !15;
        let mut buf = vec![0u8; len_aes];
        self.crypto.random_fill(&mut buf)?;
        buf[..json.len()].copy_from_slice(&json);
        buf[json.len()] = 0;
        buf[json.len() + 1..json.len() + 1 + COMMON_SECTION_MAGIC.len()]
            .copy_from_slice(&COMMON_SECTION_MAGIC[..]);
        {
            let key = self.common_key.as_ref().ok_or(Error::WrongLevel)?;
            let iv = chunk_iv(&salt);
            self.crypto.aes256_cbc(&mut buf, key.as_bytes(), &iv, true)?;
        }
        out.write_all(&buf)?;

        // 0..15 random trailing bytes so the file length is not always a
        // multiple of 16; the 16th byte only supplies the count and is
        // never written.
        let mut padding = [0u8; 16];
        self.crypto.random_fill(&mut padding)?;
        out.write_all(&padding[..usize::from(padding[15] & 0xf)])?;

        out.flush()?;
        out.into_inner().map_err(|e| Error::Io(e.into()))?.sync_all()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Holder administration. Allowed on a fresh database (before the first
    // save) and at the secret level; anywhere else the share material
    // needed to re-emit parts is missing.
    // ------------------------------------------------------------------

    fn require_holder_admin(&self) -> Result<()> {
        match self.status {
            Level::Init | Level::Secret => Ok(()),
            _ => Err(Error::WrongLevel),
        }
    }

    /// Creates a holder carrying one part of each tier. The password is
    /// set separately.
    pub fn new_holder(&mut self, nickname: &str) -> Result<u16> {
        self.require_holder_admin()?;
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(Error::InvalidArg("empty nickname".into()));
        }
        if self.find_holder(nickname).is_some() {
            return Err(Error::InvalidArg(format!(
                "nickname '{}' is already used",
                nickname
            )));
        }
        let id = self.next_holder_id()?;
        let holder = {
            let sss_common = self.sss_common.as_mut().ok_or(Error::WrongLevel)?;
            let sss_secret = self.sss_secret.as_mut().ok_or(Error::WrongLevel)?;
            Holder::create(nickname, id, &mut *self.crypto, sss_common, sss_secret)?
        };
        self.holders.push(holder);
        self.changed |= ChangedFlags::HOLDER;
        Ok(id)
    }

    /// Removes a holder; refused when the remaining distributed parts
    /// would no longer reach a threshold.
    pub fn delete_holder(&mut self, nickname: &str) -> Result<()> {
        self.require_holder_admin()?;
        let idx = self.find_holder(nickname).ok_or(Error::TryNotFound)?;
        let (hc, hs) = self.holders[idx].parts_distributed();
        let (dist_c, dist_s) = self.parts_distributed();
        let common_threshold = self.common_threshold.ok_or(Error::WrongLevel)?;
        let secret_threshold = self.secret_threshold.ok_or(Error::WrongLevel)?;
        if dist_c - u32::from(hc) < u32::from(common_threshold) {
            return Err(Error::InsufficientShares {
                tier: "common",
                distributed: dist_c - u32::from(hc),
                threshold: u32::from(common_threshold),
            });
        }
        if dist_s - u32::from(hs) < u32::from(secret_threshold) {
            return Err(Error::InsufficientShares {
                tier: "secret",
                distributed: dist_s - u32::from(hs),
                threshold: u32::from(secret_threshold),
            });
        }
        self.holders.remove(idx);
        self.changed |= ChangedFlags::HOLDER;
        Ok(())
    }

    /// Recomputes a holder's derived keys from a new password. Unlike the
    /// other holder edits this also works on a brand-new database.
    pub fn set_holder_password(&mut self, nickname: &str, password: &str) -> Result<()> {
        self.require_holder_admin()?;
        let idx = self.find_holder(nickname).ok_or(Error::TryNotFound)?;
        self.holders[idx].set_password(password, &mut *self.crypto)?;
        self.changed |= ChangedFlags::PASSWORD;
        Ok(())
    }

    pub fn holder_password_matches(&self, nickname: &str, password: &str) -> Result<bool> {
        let idx = self.find_holder(nickname).ok_or(Error::TryNotFound)?;
        Ok(self.holders[idx].test_password(password, &*self.crypto))
    }

    pub fn set_holder_email(&mut self, nickname: &str, email: &str) -> Result<()> {
        self.require_holder_admin()?;
        let idx = self.find_holder(nickname).ok_or(Error::TryNotFound)?;
        self.holders[idx].email = if email.is_empty() {
            None
        } else {
            Some(email.to_string())
        };
        self.changed |= ChangedFlags::HOLDER;
        Ok(())
    }

    pub fn set_holder_nb_common(&mut self, nickname: &str, n: u16) -> Result<()> {
        self.require_holder_admin()?;
        let idx = self.find_holder(nickname).ok_or(Error::TryNotFound)?;
        {
            let sss_common = self.sss_common.as_mut().ok_or(Error::WrongLevel)?;
            let sss_secret = self.sss_secret.as_mut().ok_or(Error::WrongLevel)?;
            self.holders[idx].set_nb_common(n, &mut *self.crypto, sss_common, sss_secret)?;
        }
        self.changed |= ChangedFlags::HOLDER;
        Ok(())
    }

    pub fn set_holder_nb_secret(&mut self, nickname: &str, n: u16) -> Result<()> {
        self.require_holder_admin()?;
        let idx = self.find_holder(nickname).ok_or(Error::TryNotFound)?;
        {
            let sss_common = self.sss_common.as_mut().ok_or(Error::WrongLevel)?;
            let sss_secret = self.sss_secret.as_mut().ok_or(Error::WrongLevel)?;
            self.holders[idx].set_nb_secret(n, &mut *self.crypto, sss_common, sss_secret)?;
        }
        self.changed |= ChangedFlags::HOLDER;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Secret tree navigation and edition.
    // ------------------------------------------------------------------

    fn ensure_root(&mut self) -> &mut SecretFolder {
        if self.root_folder.is_none() {
            self.root_folder = Some(SecretFolder::new("root", 1));
        }
        self.root_folder.as_mut().unwrap()
    }

    pub fn root(&self) -> Option<&SecretFolder> {
        self.root_folder.as_ref()
    }

    /// The current folder; the root is materialised on first use.
    pub fn current_folder(&mut self) -> Result<&SecretFolder> {
        let current = self.current_folder;
        self.ensure_root()
            .find_folder(current)
            .map(|f| &*f)
            .ok_or_else(|| Error::InvalidArg(format!("no folder {}", current)))
    }

    fn current_folder_mut(&mut self) -> Result<&mut SecretFolder> {
        let current = self.current_folder;
        self.ensure_root()
            .find_folder_mut(current)
            .ok_or_else(|| Error::InvalidArg(format!("no folder {}", current)))
    }

    /// Enters a folder anywhere in the tree by id.
    pub fn cd(&mut self, id: u32) -> Result<()> {
        if self.ensure_root().find_folder(id).is_none() {
            return Err(Error::InvalidArg(format!("no folder {}", id)));
        }
        self.current_folder = id;
        Ok(())
    }

    /// Slash-separated titles from the root to the current folder.
    pub fn pwd(&mut self) -> Result<String> {
        let current = self.current_folder;
        let root = self.ensure_root();
        secret::title_path(root, current)
            .ok_or_else(|| Error::InvalidArg(format!("no folder {}", current)))
    }

    /// The smallest id not yet taken in the tree.
    pub fn free_id(&mut self) -> Result<u32> {
        let root = self.ensure_root();
        secret::free_id(root).ok_or_else(|| Error::InvalidArg("the tree is full".into()))
    }

    pub fn new_folder(&mut self, title: &str) -> Result<u32> {
        let id = self.free_id()?;
        let folder = SecretFolder::new(title, id);
        self.current_folder_mut()?.add_sub_folder(folder);
        self.changed |= ChangedFlags::SECRET;
        Ok(id)
    }

    pub fn new_secret(&mut self, title: &str) -> Result<u32> {
        let id = self.free_id()?;
        let item = SecretItem::new(title, id, &mut *self.crypto)?;
        self.current_folder_mut()?.add_secret_item(item);
        self.changed |= ChangedFlags::SECRET;
        Ok(id)
    }

    /// Looks up a direct child item of the current folder.
    pub fn secret_in_current(&mut self, id: u32) -> Result<&SecretItem> {
        self.current_folder()?
            .secret_by_id(id)
            .ok_or_else(|| Error::InvalidArg(format!("no secret {}", id)))
    }

    pub fn delete_secret(&mut self, id: u32) -> Result<()> {
        if !self.current_folder_mut()?.delete_secret_item(id) {
            return Err(Error::InvalidArg(format!("no secret {}", id)));
        }
        self.changed |= ChangedFlags::SECRET;
        Ok(())
    }

    /// Deletes a direct child folder; a non-empty folder needs `force`.
    pub fn delete_folder(&mut self, id: u32, force: bool) -> Result<()> {
        {
            let current = self.current_folder_mut()?;
            match current.sub_folder_by_id(id) {
                None => return Err(Error::InvalidArg(format!("no folder {}", id))),
                Some(folder) => {
                    if !folder.is_empty() && !force {
                        return Err(Error::InvalidArg("folder is not empty".into()));
                    }
                }
            }
            current.delete_sub_folder(id);
        }
        self.changed |= ChangedFlags::SECRET;
        Ok(())
    }

    /// Creates or updates a field of an item in the current folder.
    pub fn update_field(&mut self, item_id: u32, name: &str, value: &str) -> Result<()> {
        let current = self.current_folder;
        let Database {
            ref mut root_folder,
            ref mut crypto,
            ref secret_key,
            status,
            ..
        } = *self;
        let key = match status {
            Level::Secret | Level::Init => secret_key.as_ref().map(|k| k.as_bytes()),
            _ => None,
        };
        {
            let root = root_folder
                .as_mut()
                .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
            let folder = root
                .find_folder_mut(current)
                .ok_or_else(|| Error::InvalidArg(format!("no folder {}", current)))?;
            let item = folder
                .secret_by_id_mut(item_id)
                .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
            item.update_field(name, value, &mut **crypto, key)?;
        }
        self.changed |= ChangedFlags::SECRET;
        Ok(())
    }

    pub fn delete_field(&mut self, item_id: u32, name: &str) -> Result<()> {
        {
            let item = match self.current_folder_mut()?.secret_by_id_mut(item_id) {
                Some(item) => item,
                None => return Err(Error::InvalidArg(format!("no secret {}", item_id))),
            };
            if !item.delete_field(name) {
                return Err(Error::InvalidArg(format!("no field '{}'", name)));
            }
        }
        self.changed |= ChangedFlags::SECRET;
        Ok(())
    }

    pub fn set_secret_title(&mut self, item_id: u32, title: &str) -> Result<()> {
        {
            let item = match self.current_folder_mut()?.secret_by_id_mut(item_id) {
                Some(item) => item,
                None => return Err(Error::InvalidArg(format!("no secret {}", item_id))),
            };
            item.title = title.to_string();
        }
        self.changed |= ChangedFlags::SECRET;
        Ok(())
    }

    /// Reads one field at the current unlock level; a secret-tier field
    /// below the secret level reads as `Locked`.
    pub fn field_value(&mut self, item_id: u32, name: &str) -> Result<FieldValue> {
        let current = self.current_folder;
        let Database {
            ref root_folder,
            ref crypto,
            ref secret_key,
            status,
            ..
        } = *self;
        let key = match status {
            Level::Secret | Level::Init => secret_key.as_ref().map(|k| k.as_bytes()),
            _ => None,
        };
        let root = root_folder
            .as_ref()
            .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
        let folder = root
            .find_folder(current)
            .ok_or_else(|| Error::InvalidArg(format!("no folder {}", current)))?;
        let item = folder
            .secret_by_id(item_id)
            .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
        item.field_value(name, &**crypto, key)
    }

    /// Moves a field to the secret tier; requires the secret level.
    pub fn set_field_secret(&mut self, item_id: u32, name: &str) -> Result<()> {
        if self.status != Level::Secret {
            return Err(Error::WrongLevel);
        }
        let current = self.current_folder;
        {
            let Database {
                ref mut root_folder,
                ref mut crypto,
                ref secret_key,
                ..
            } = *self;
            let key = secret_key.as_ref().ok_or(Error::WrongLevel)?;
            let root = root_folder
                .as_mut()
                .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
            let folder = root
                .find_folder_mut(current)
                .ok_or_else(|| Error::InvalidArg(format!("no folder {}", current)))?;
            let item = folder
                .secret_by_id_mut(item_id)
                .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
            item.set_field_secret(name, &mut **crypto, key.as_bytes())?;
        }
        self.changed |= ChangedFlags::SECRET;
        Ok(())
    }

    /// Moves a field back to the common tier; requires the secret level.
    pub fn set_field_common(&mut self, item_id: u32, name: &str) -> Result<()> {
        if self.status != Level::Secret {
            return Err(Error::WrongLevel);
        }
        let current = self.current_folder;
        {
            let Database {
                ref mut root_folder,
                ref mut crypto,
                ref secret_key,
                ..
            } = *self;
            let key = secret_key.as_ref().ok_or(Error::WrongLevel)?;
            let root = root_folder
                .as_mut()
                .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
            let folder = root
                .find_folder_mut(current)
                .ok_or_else(|| Error::InvalidArg(format!("no folder {}", current)))?;
            let item = folder
                .secret_by_id_mut(item_id)
                .ok_or_else(|| Error::InvalidArg(format!("no secret {}", item_id)))?;
            item.set_field_common(name, &mut **crypto, key.as_bytes())?;
        }
        self.changed |= ChangedFlags::SECRET;
        Ok(())
    }

    /// Generates a random password into a field.
    pub fn generate_field(&mut self, item_id: u32, name: &str, len: usize) -> Result<()> {
        let password = ::crypto::generate_password(&mut *self.crypto, len)?;
        self.update_field(item_id, name, &password)
    }

    /// The prompt string: a `*` when dirty, the (possibly shortened) file
    /// name, and a marker for the unlock level.
    pub fn prompt(&self) -> String {
        const MAX_PROMPT: usize = 40;
        let accepted = MAX_PROMPT - 8;

        let mut prompt = String::new();
        if !self.changed.is_empty() {
            prompt.push('*');
        }
        match self.filename {
            Some(ref path) => {
                let full = path.to_string_lossy().into_owned();
                if full.chars().count() > accepted / 2 {
                    // Drop the directory part, then if still too long keep
                    // the tail of the name.
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or(full);
                    let count = name.chars().count();
                    if count > accepted {
                        let skip = count - accepted;
                        prompt.extend(name.chars().skip(skip));
                    } else {
                        prompt.push_str(&name);
                    }
                } else {
                    prompt.push_str(&full);
                }
            }
            None => prompt.push_str("(noname)"),
        }
        prompt.push_str(match self.status {
            Level::Init => "(init) ",
            Level::None => "? ",
            Level::First => "! ",
            Level::Common => "> ",
            Level::Secret => "# ",
        });
        prompt
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mpm".to_string());
    name.push_str(&format!(".tmp-{}", process::id()));
    path.with_file_name(name)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::OsCrypto;
    use secret::FieldValue;
    use std::env;

    fn crypto() -> Box<dyn CryptoProvider> {
        Box::new(OsCrypto::new().expect("rng"))
    }

    fn scratch_file(tag: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("mpm-{}-{}.mpm", tag, process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    fn fresh_db(tag: &str, common: u16, secret: u16, nicks: &[(&str, &str)]) -> (Database, PathBuf) {
        let path = scratch_file(tag);
        let mut db = Database::create(common, secret, Some(&path), crypto()).expect("create");
        assert_eq!(db.status(), Level::Init);
        for &(nick, password) in nicks {
            db.new_holder(nick).expect("new holder");
            db.set_holder_password(nick, password).expect("password");
        }
        (db, path)
    }

    #[test]
    fn test_round_trip_two_holders() {
        let (mut db, path) = fresh_db("s1", 2, 2, &[("A", "a"), ("B", "b")]);
        assert!(db.holder_password_matches("A", "a").expect("check"));
        assert!(!db.holder_password_matches("A", "b").expect("check"));
        db.save(None).expect("save");
        assert_eq!(db.status(), Level::Secret);
        assert!(!db.is_changed());

        // The file is exactly chunks + marker + ciphertext + short tail.
        let size = fs::metadata(&path).expect("stat").len();
        assert!(size >= (2 * CHUNK_SIZE + COMMON_MARKER_SIZE) as u64);

        let mut reopened = Database::open(&path, crypto()).expect("open");
        assert_eq!(reopened.status(), Level::None);
        assert_eq!(reopened.try_holder("A", "a").expect("try A"), (1, 1));
        assert_eq!(reopened.status(), Level::First);
        assert_eq!(reopened.try_holder("B", "b").expect("try B"), (1, 1));
        assert_eq!(reopened.status(), Level::Secret);
        assert_eq!(reopened.thresholds(), (Some(2), Some(2)));
        assert_eq!(reopened.nb_holders(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_wrong_password_leaves_state_unchanged() {
        let (mut db, path) = fresh_db("wrongpw", 2, 2, &[("A", "a"), ("B", "b")]);
        db.save(None).expect("save");

        let mut reopened = Database::open(&path, crypto()).expect("open");
        match reopened.try_holder("A", "wrong") {
            Err(Error::TryNotFound) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(reopened.status(), Level::None);
        match reopened.try_holder("nobody", "a") {
            Err(Error::TryNotFound) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        reopened.try_holder("A", "a").expect("try A");
        match reopened.try_holder("A", "a") {
            Err(Error::TryAlreadyOpen) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(reopened.status(), Level::First);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_secret_fields_lock_below_secret_level() {
        // Common opens with one holder, secret needs both.
        let (mut db, path) = fresh_db("tiers", 1, 2, &[("A", "a"), ("B", "b")]);
        db.save(None).expect("save");

        let id = db.new_secret("login").expect("new secret");
        db.update_field(id, "user", "alice").expect("field");
        db.update_field(id, "pwd", "hunter2").expect("field");
        db.set_field_secret(id, "pwd").expect("secret tier");
        db.save(None).expect("save again");

        // Reopen with A only: common level, pwd is locked.
        let mut reopened = Database::open(&path, crypto()).expect("open");
        reopened.try_holder("A", "a").expect("try A");
        assert_eq!(reopened.status(), Level::Common);
        assert_eq!(
            reopened.field_value(id, "user").expect("user"),
            FieldValue::Plain("alice".to_string())
        );
        assert_eq!(
            reopened.field_value(id, "pwd").expect("pwd"),
            FieldValue::Locked
        );
        // The secret tier is not editable either.
        match reopened.set_field_common(id, "pwd") {
            Err(Error::WrongLevel) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        // The second holder lifts the level and reveals the cleartext.
        reopened.try_holder("B", "b").expect("try B");
        assert_eq!(reopened.status(), Level::Secret);
        assert_eq!(
            reopened.field_value(id, "pwd").expect("pwd"),
            FieldValue::Plain("hunter2".to_string())
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_threshold_boundary_three_holders() {
        let (mut db, path) = fresh_db("quorum3", 2, 3, &[("A", "a"), ("B", "b"), ("C", "c")]);
        db.save(None).expect("save");
        let id = db.new_secret("login").expect("new secret");
        db.update_field(id, "pwd", "hunter2").expect("field");
        db.set_field_secret(id, "pwd").expect("secret tier");
        db.save(None).expect("save again");

        let mut reopened = Database::open(&path, crypto()).expect("open");
        reopened.try_holder("B", "b").expect("try B");
        assert_eq!(reopened.status(), Level::First);
        reopened.try_holder("C", "c").expect("try C");
        assert_eq!(reopened.status(), Level::Common);
        reopened.try_holder("A", "a").expect("try A");
        assert_eq!(reopened.status(), Level::Secret);
        assert_eq!(
            reopened.field_value(id, "pwd").expect("pwd"),
            FieldValue::Plain("hunter2".to_string())
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_save_refused_below_distribution() {
        let path = scratch_file("underdist");
        let mut db = Database::create(3, 2, Some(&path), crypto()).expect("create");
        db.new_holder("A").expect("holder");
        db.set_holder_password("A", "a").expect("password");
        db.new_holder("B").expect("holder");
        db.set_holder_password("B", "b").expect("password");

        // Two common parts distributed, three needed.
        match db.save(None) {
            Err(Error::InsufficientShares { tier: "common", distributed: 2, threshold: 3 }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(db.is_changed());
        assert!(fs::metadata(&path).is_err());

        // Raising one holder's count makes the save legal.
        db.set_holder_nb_common("A", 2).expect("more parts");
        db.save(None).expect("save");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_delete_holder_guard() {
        let (mut db, path) = fresh_db("delguard", 2, 2, &[("A", "a"), ("B", "b")]);
        db.save(None).expect("save");

        match db.delete_holder("B") {
            Err(Error::InsufficientShares { tier: "common", .. }) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(db.holders().len(), 2);

        // With spare parts on A the removal goes through.
        db.set_holder_nb_common("A", 2).expect("parts");
        db.set_holder_nb_secret("A", 2).expect("parts");
        db.delete_holder("B").expect("delete");
        assert_eq!(db.holders().len(), 1);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupted_common_section_is_rejected() {
        let (mut db, path) = fresh_db("corrupt", 2, 2, &[("A", "a"), ("B", "b")]);
        db.save(None).expect("save");

        // Flip one byte inside the encrypted common section.
        let mut raw = fs::read(&path).expect("read");
        let target = 2 * CHUNK_SIZE + COMMON_MARKER_SIZE + 5;
        raw[target] ^= 0x01;
        fs::write(&path, &raw).expect("write");

        let mut reopened = Database::open(&path, crypto()).expect("open");
        reopened.try_holder("A", "a").expect("try A");
        match reopened.try_holder("B", "b") {
            Err(Error::IntegrityFail(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_holder_edits_survive_a_round_trip() {
        let (mut db, path) = fresh_db("edits", 2, 2, &[("A", "a"), ("B", "b")]);
        db.set_holder_email("A", "a@example.org").expect("email");
        db.set_holder_nb_common("A", 3).expect("parts");
        db.save(None).expect("save");

        let mut reopened = Database::open(&path, crypto()).expect("open");
        reopened.try_holder("B", "b").expect("try B");
        reopened.try_holder("A", "a").expect("try A");
        assert_eq!(reopened.status(), Level::Secret);
        let idx = reopened.find_holder("A").expect("holder A");
        assert_eq!(reopened.holders()[idx].email.as_ref().unwrap(), "a@example.org");
        assert_eq!(reopened.holders()[idx].nb_common(), 3);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_tree_navigation_and_ids() {
        let (mut db, path) = fresh_db("tree", 1, 1, &[("A", "a")]);
        let folder_id = db.new_folder("mail").expect("folder");
        assert_eq!(folder_id, 2);
        db.cd(folder_id).expect("cd");
        let item_id = db.new_secret("imap").expect("item");
        assert_eq!(item_id, 3);
        assert_eq!(db.pwd().expect("pwd"), "root/mail");

        db.cd(1).expect("cd up");
        // Non-empty folder needs force.
        match db.delete_folder(folder_id, false) {
            Err(Error::InvalidArg(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        db.delete_folder(folder_id, true).expect("force delete");
        assert_eq!(db.free_id().expect("free"), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_prompt_shapes() {
        let (db, path) = fresh_db("prompt", 1, 1, &[]);
        let prompt = db.prompt();
        assert!(prompt.starts_with('*'));
        assert!(prompt.ends_with("(init) "));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let path = scratch_file("missing");
        match Database::open(&path, crypto()) {
            Err(Error::Io(_)) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
