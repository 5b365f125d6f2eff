//! Shamir secret sharing over GF(2^256): a 256-bit secret is the constant
//! term of a random polynomial of degree `threshold - 1`; a share is one
//! point (X, Y = P(X)); `threshold` distinct points rebuild the constant
//! term by Lagrange interpolation at zero.

use byteorder::{ByteOrder, LittleEndian};
use memsec::memzero;

use crypto::CryptoProvider;
use error::{Error, Result};
use gf::{self, Fe};

/// Width of the shared secrets in bits. Only 256 is supported; the value is
/// part of the context construction so a mismatch fails loudly rather than
/// truncating.
pub const SECRET_WIDTH: usize = 256;

const X_SLOT_SHIFT: u32 = 16;
const X_RANDOM_MASK: u64 = 0xffff_ffff_fff8_0000;

/// One secret-sharing context, used in both directions: loaded with a
/// secret it emits shares, loaded with shares it recombines the secret.
pub struct Shamir {
    threshold: usize,
    secret: Option<Fe>,
    coeffs: Vec<Fe>,
    parts: Vec<(u64, Fe)>,
    /// When set, the non-constant coefficients are re-sampled before the
    /// next share emission. The engine sets it after a recombination so
    /// that later holder edits never reuse a polynomial whose points have
    /// already been distributed.
    pub recoef: bool,
}

impl Shamir {
    /// # Errors
    ///
    /// `Error::InvalidArg` unless `width` is 256 and `threshold` at least 1.
    pub fn new(width: usize, threshold: usize) -> Result<Shamir> {
        if width != SECRET_WIDTH {
            return Err(Error::InvalidArg(format!(
                "unsupported secret width {}",
                width
            )));
        }
        if threshold < 1 {
            return Err(Error::InvalidArg("threshold must be at least 1".into()));
        }
        Ok(Shamir {
            threshold,
            secret: None,
            coeffs: Vec::new(),
            parts: Vec::new(),
            recoef: false,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Installs the secret for share emission.
    pub fn set_secret(&mut self, bytes: &[u8; 32]) {
        self.secret = Some(Fe::from_bytes(bytes));
    }

    /// Emits the share for abscissa `x`, drawing fresh non-constant
    /// coefficients on the first emission and after `recoef` was raised.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArg` when no secret is installed or `x` is zero
    /// (P(0) is the secret itself and must never leave the context).
    pub fn get_part(
        &mut self,
        out: &mut [u8; 32],
        x: u64,
        crypto: &mut dyn CryptoProvider,
    ) -> Result<()> {
        if x == 0 {
            return Err(Error::InvalidArg("share abscissa 0 is forbidden".into()));
        }
        let secret = match self.secret {
            Some(s) => s,
            None => return Err(Error::InvalidArg("no secret installed".into())),
        };
        if self.coeffs.len() + 1 != self.threshold || self.recoef {
            self.wipe_coeffs();
            let mut raw = [0u8; 32];
            for _ in 1..self.threshold {
                crypto.random_fill(&mut raw)?;
                self.coeffs.push(Fe::from_bytes(&raw));
            }
            unsafe {
                memzero(raw.as_mut_ptr(), raw.len());
            }
            self.recoef = false;
        }

        // Horner from the highest-degree coefficient down to the secret.
        let xe = Fe::from_u64(x);
        let mut acc = gf::ZERO;
        for coeff in self.coeffs.iter().rev() {
            acc = acc.add(coeff).mul(&xe);
        }
        acc = acc.add(&secret);
        out.copy_from_slice(&acc.to_bytes());
        Ok(())
    }

    /// Queues one share for recombination.
    ///
    /// # Errors
    ///
    /// `Error::ManyParts` once `threshold` shares are queued,
    /// `Error::DuplicateShare` for an abscissa already queued,
    /// `Error::InvalidArg` for X = 0.
    pub fn set_part(&mut self, y: &[u8; 32], x: u64) -> Result<()> {
        if self.parts.len() >= self.threshold {
            return Err(Error::ManyParts(self.threshold));
        }
        if x == 0 {
            return Err(Error::InvalidArg("share abscissa 0 is forbidden".into()));
        }
        if self.parts.iter().any(|&(xq, _)| xq == x) {
            return Err(Error::DuplicateShare);
        }
        self.parts.push((x, Fe::from_bytes(y)));
        Ok(())
    }

    /// How many more shares are needed before `combine` can run.
    pub fn missing_parts(&self) -> usize {
        self.threshold.saturating_sub(self.parts.len())
    }

    /// Rebuilds the polynomial's constant term from the queued shares.
    ///
    /// # Errors
    ///
    /// `Error::NotEnoughShares` below the threshold.
    pub fn combine(&mut self) -> Result<()> {
        if self.parts.len() < self.threshold {
            return Err(Error::NotEnoughShares);
        }
        let mut secret = gf::ZERO;
        for i in 0..self.threshold {
            let (xi, yi) = self.parts[i];
            let xi = Fe::from_u64(xi);
            // Value at 0 of the Lagrange basis polynomial that is 1 at xi
            // and 0 at the other queued abscissae.
            let mut l0 = gf::ONE;
            for j in 0..self.threshold {
                if i == j {
                    continue;
                }
                let xj = Fe::from_u64(self.parts[j].0);
                let denom = xi.add(&xj);
                let denom_inv = denom.inverse().ok_or(Error::DuplicateShare)?;
                l0 = l0.mul(&xj).mul(&denom_inv);
            }
            secret = secret.add(&yi.mul(&l0));
        }
        self.secret = Some(secret);
        Ok(())
    }

    /// Copies out the recovered (or installed) secret.
    ///
    /// # Errors
    ///
    /// `Error::NotEnoughShares` when no secret is present.
    pub fn get_secret(&self, out: &mut [u8; 32]) -> Result<()> {
        match self.secret {
            Some(ref s) => {
                out.copy_from_slice(&s.to_bytes());
                Ok(())
            }
            None => Err(Error::NotEnoughShares),
        }
    }

    fn wipe_coeffs(&mut self) {
        for coeff in self.coeffs.iter_mut() {
            unsafe {
                memzero(coeff.0.as_mut_ptr() as *mut u8, 32);
            }
        }
        self.coeffs.clear();
    }
}

// The context holds the shared secret, its polynomial and queued shares.
impl Drop for Shamir {
    fn drop(&mut self) {
        if let Some(ref mut s) = self.secret {
            unsafe {
                memzero(s.0.as_mut_ptr() as *mut u8, 32);
            }
        }
        self.wipe_coeffs();
        for &mut (_, ref mut y) in self.parts.iter_mut() {
            unsafe {
                memzero(y.0.as_mut_ptr() as *mut u8, 32);
            }
        }
    }
}

/// Builds a share abscissa with provenance: bits 0..15 carry the holder id,
/// bits 16..18 the slot index, bits 19..63 are random. Two distributed
/// shares can therefore never collide on X.
pub fn share_abscissa(
    id_holder: u16,
    slot: usize,
    crypto: &mut dyn CryptoProvider,
) -> Result<u64> {
    debug_assert!(slot < 8);
    let mut raw = [0u8; 8];
    crypto.random_fill(&mut raw)?;
    let mut x = LittleEndian::read_u64(&raw);
    x &= X_RANDOM_MASK;
    x |= u64::from(id_holder);
    x |= (slot as u64) << X_SLOT_SHIFT;
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::OsCrypto;
    use error::Error;

    fn secret_bytes() -> [u8; 32] {
        let mut s = [0u8; 32];
        for (i, byte) in s.iter_mut().enumerate() {
            *byte = (i * 11 + 5) as u8;
        }
        s
    }

    #[test]
    fn test_share_and_recombine() {
        let mut crypto = OsCrypto::new().expect("rng");
        let secret = secret_bytes();
        let mut dealer = Shamir::new(256, 3).expect("ctx");
        dealer.set_secret(&secret);

        let mut shares = Vec::new();
        for x in 1..6u64 {
            let mut y = [0u8; 32];
            dealer.get_part(&mut y, x, &mut crypto).expect("emit");
            shares.push((x, y));
        }

        // Any 3 of the 5 shares rebuild the secret.
        for subset in &[[0usize, 1, 2], [0, 2, 4], [1, 3, 4]] {
            let mut joiner = Shamir::new(256, 3).expect("ctx");
            for &i in subset.iter() {
                let (x, y) = shares[i];
                joiner.set_part(&y, x).expect("queue");
            }
            assert_eq!(joiner.missing_parts(), 0);
            joiner.combine().expect("combine");
            let mut out = [0u8; 32];
            joiner.get_secret(&mut out).expect("secret");
            assert_eq!(out, secret);
        }
    }

    #[test]
    fn test_two_shares_are_not_enough() {
        let mut crypto = OsCrypto::new().expect("rng");
        let secret = secret_bytes();
        let mut dealer = Shamir::new(256, 3).expect("ctx");
        dealer.set_secret(&secret);

        let mut joiner = Shamir::new(256, 3).expect("ctx");
        for x in 1..3u64 {
            let mut y = [0u8; 32];
            dealer.get_part(&mut y, x, &mut crypto).expect("emit");
            joiner.set_part(&y, x).expect("queue");
        }
        assert_eq!(joiner.missing_parts(), 1);
        match joiner.combine() {
            Err(Error::NotEnoughShares) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_part_queue_rules() {
        let mut joiner = Shamir::new(256, 2).expect("ctx");
        let y = [1u8; 32];
        assert!(joiner.set_part(&y, 0).is_err());
        joiner.set_part(&y, 7).expect("first");
        match joiner.set_part(&y, 7) {
            Err(Error::DuplicateShare) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        joiner.set_part(&y, 8).expect("second");
        match joiner.set_part(&y, 9) {
            Err(Error::ManyParts(2)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_x_zero_never_emitted() {
        let mut crypto = OsCrypto::new().expect("rng");
        let mut dealer = Shamir::new(256, 2).expect("ctx");
        dealer.set_secret(&secret_bytes());
        let mut y = [0u8; 32];
        assert!(dealer.get_part(&mut y, 0, &mut crypto).is_err());
    }

    #[test]
    fn test_recoef_redraws_polynomial() {
        let mut crypto = OsCrypto::new().expect("rng");
        let secret = secret_bytes();
        let mut dealer = Shamir::new(256, 2).expect("ctx");
        dealer.set_secret(&secret);

        let mut y1 = [0u8; 32];
        dealer.get_part(&mut y1, 42, &mut crypto).expect("emit");
        dealer.recoef = true;
        let mut y2 = [0u8; 32];
        dealer.get_part(&mut y2, 42, &mut crypto).expect("emit");
        // Same X, new polynomial: the share changes but still encodes the
        // same constant term.
        assert_ne!(y1, y2);

        let mut y3 = [0u8; 32];
        dealer.get_part(&mut y3, 43, &mut crypto).expect("emit");
        let mut joiner = Shamir::new(256, 2).expect("ctx");
        joiner.set_part(&y2, 42).expect("queue");
        joiner.set_part(&y3, 43).expect("queue");
        joiner.combine().expect("combine");
        let mut out = [0u8; 32];
        joiner.get_secret(&mut out).expect("secret");
        assert_eq!(out, secret);
    }

    #[test]
    fn test_threshold_one_is_the_secret() {
        let mut crypto = OsCrypto::new().expect("rng");
        let secret = secret_bytes();
        let mut dealer = Shamir::new(256, 1).expect("ctx");
        dealer.set_secret(&secret);
        let mut y = [0u8; 32];
        dealer.get_part(&mut y, 5, &mut crypto).expect("emit");
        assert_eq!(y, secret);
    }

    #[test]
    fn test_share_abscissa_provenance() {
        let mut crypto = OsCrypto::new().expect("rng");
        let x = share_abscissa(513, 6, &mut crypto).expect("x");
        assert_eq!(x & 0xffff, 513);
        assert_eq!((x >> 16) & 7, 6);
        assert_ne!(x, 0);
    }

    #[test]
    fn test_rejects_wrong_width() {
        assert!(Shamir::new(128, 2).is_err());
        assert!(Shamir::new(256, 0).is_err());
    }
}
