//! Base-64 codec for the common-section payloads (item IVs, enciphered
//! field values). Standard alphabet with `=` padding; the decoder tolerates
//! interspersed spaces and line breaks, and is bounded by the caller's
//! output buffer.

use error::{Error, Result};

const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const INVALID_CODE: u8 = 0xff;
const PADDING_CHAR: u8 = 0xfe;
const SPACE_CHAR: u8 = 0xfd;

const fn build_reverse() -> [u8; 256] {
    let mut table = [INVALID_CODE; 256];
    let mut i = 0;
    while i < 64 {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table[b'=' as usize] = PADDING_CHAR;
    table[b' ' as usize] = SPACE_CHAR;
    table[b'\n' as usize] = SPACE_CHAR;
    table[b'\r' as usize] = SPACE_CHAR;
    table
}

static REVERSE: [u8; 256] = build_reverse();

/// Encodes a binary buffer into a base-64 string, three input bytes per
/// four output characters, `=`-padded.
pub fn encode(source: &[u8]) -> String {
    let nb_triplets = (source.len() + 2) / 3;
    let mut dest = String::with_capacity(nb_triplets * 4);

    for i in 0..nb_triplets {
        let a = source[3 * i];
        let b = if 3 * i + 1 < source.len() { source[3 * i + 1] } else { 0 };
        let c = if 3 * i + 2 < source.len() { source[3 * i + 2] } else { 0 };

        let w = a >> 2;
        let x = ((a & 3) << 4) | (b >> 4);
        let y = ((b & 15) << 2) | ((c & 192) >> 6);
        let z = c & 63;

        dest.push(ALPHABET[w as usize] as char);
        dest.push(ALPHABET[x as usize] as char);
        dest.push(if 3 * i + 1 < source.len() { ALPHABET[y as usize] as char } else { '=' });
        dest.push(if 3 * i + 2 < source.len() { ALPHABET[z as usize] as char } else { '=' });
    }
    dest
}

/// Decodes a base-64 string into `dest` and returns the number of bytes
/// produced. ASCII space, CR and LF between characters are skipped; any
/// other byte outside the alphabet is an error. Decoding stops once `dest`
/// is full.
///
/// # Errors
///
/// `Error::B64InvalidCode` for a byte outside the alphabet,
/// `Error::B64UnexpectedEnd` when the input stops mid-quartet without `=`
/// padding.
pub fn decode(dest: &mut [u8], source: &str) -> Result<usize> {
    let mut bytes = source.bytes();
    let mut decoded_len = 0usize;

    // Pulls the next significant symbol, skipping whitespace.
    fn next_symbol<I: Iterator<Item = u8>>(bytes: &mut I) -> Option<Result<u8>> {
        for raw in bytes {
            let code = REVERSE[raw as usize];
            if code == SPACE_CHAR {
                continue;
            }
            if code == INVALID_CODE {
                return Some(Err(Error::B64InvalidCode(raw)));
            }
            return Some(Ok(code));
        }
        None
    }

    loop {
        let w = match next_symbol(&mut bytes) {
            None => break,
            Some(code) => code?,
        };
        let x = match next_symbol(&mut bytes) {
            None => return Err(Error::B64UnexpectedEnd),
            Some(code) => code?,
        };
        let mut y = match next_symbol(&mut bytes) {
            None => return Err(Error::B64UnexpectedEnd),
            Some(code) => code?,
        };
        let mut z = match next_symbol(&mut bytes) {
            None => return Err(Error::B64UnexpectedEnd),
            Some(code) => code?,
        };

        if w == PADDING_CHAR || x == PADDING_CHAR {
            return Err(Error::B64InvalidCode(b'='));
        }

        // nout: bytes carried by this quartet; '=' in third or fourth
        // position shortens it and ends the stream.
        let mut last = false;
        let nout;
        if y == PADDING_CHAR {
            nout = 1;
            y = 0;
            z = 0;
            last = true;
        } else if z == PADDING_CHAR {
            nout = 2;
            z = 0;
            last = true;
        } else {
            nout = 3;
        }

        let decoded = [
            (w << 2) | (x >> 4),
            ((x & 15) << 4) | (y >> 2),
            ((y & 3) << 6) | z,
        ];
        for &byte in decoded.iter().take(nout) {
            if decoded_len == dest.len() {
                return Ok(decoded_len);
            }
            dest[decoded_len] = byte;
            decoded_len += 1;
        }
        if last {
            break;
        }
    }
    Ok(decoded_len)
}

/// Convenience wrapper allocating the output buffer.
pub fn decode_vec(source: &str) -> Result<Vec<u8>> {
    let mut dest = vec![0u8; (source.len() + 3) / 4 * 3];
    let len = decode(&mut dest, source)?;
    dest.truncate(len);
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use error::Error;

    #[test]
    fn test_round_trip() {
        for len in 0..70 {
            let buf: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let text = encode(&buf);
            assert_eq!(text.len() % 4, 0);
            assert_eq!(decode_vec(&text).expect("decode"), buf);
        }
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(b"f"), "Zg==");
        assert_eq!(encode(b"fo"), "Zm8=");
        assert_eq!(encode(b"foo"), "Zm9v");
        assert_eq!(encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_all_ones_buffers() {
        let text32 = encode(&[0xffu8; 32]);
        assert_eq!(text32.len(), 44);
        assert_eq!(text32, format!("{}8=", "/".repeat(42)));
        assert_eq!(decode_vec(&text32).expect("decode"), vec![0xffu8; 32]);

        let text31 = encode(&[0xffu8; 31]);
        assert_eq!(text31, format!("{}w==", "/".repeat(41)));
        assert_eq!(decode_vec(&text31).expect("decode"), vec![0xffu8; 31]);
    }

    #[test]
    fn test_whitespace_is_skipped() {
        let buf: Vec<u8> = (0..33).map(|i| (i * 7 + 3) as u8).collect();
        let text = encode(&buf);
        let mut sprinkled = String::new();
        for (i, c) in text.chars().enumerate() {
            sprinkled.push(c);
            match i % 3 {
                0 => sprinkled.push(' '),
                1 => sprinkled.push('\n'),
                _ => sprinkled.push('\r'),
            }
        }
        assert_eq!(decode_vec(&sprinkled).expect("decode"), buf);
    }

    #[test]
    fn test_invalid_code() {
        match decode_vec("Zm9*") {
            Err(Error::B64InvalidCode(b'*')) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unexpected_end() {
        match decode_vec("Zm9vYm") {
            Err(Error::B64UnexpectedEnd) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_bounded_output() {
        let text = encode(&[0x55u8; 30]);
        let mut small = [0u8; 7];
        let produced = decode(&mut small, &text).expect("decode");
        assert_eq!(produced, 7);
        assert_eq!(small, [0x55u8; 7]);
    }
}
