use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

/// Errors writing or managing the NLA SAM file.
#[derive(Debug, thiserror::Error)]
pub enum NlaSamError {
    #[error("failed to create SAM directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to create SAM file: {0}")]
    CreateFile(std::io::Error),
    #[error("failed to write SAM file: {0}")]
    Write(std::io::Error),
    #[error("failed to fsync SAM file: {0}")]
    Sync(std::io::Error),
}

/// A temporary SAM file holding a single `username:::<NTLMv1 hash>:::` line,
/// used to seed static NLA credentials (§4.10/§6). Deletes itself on drop.
pub struct NlaSamFile {
    path: PathBuf,
}

impl NlaSamFile {
    /// Write a new SAM file for `username`/`password` under
    /// `$XDG_RUNTIME_DIR/grdc` (falling back to `/tmp/grdc`), mode 0600.
    pub fn create(username: &str, password: &str) -> Result<Self, NlaSamError> {
        let dir = runtime_dir();
        std::fs::create_dir_all(&dir).map_err(|e| NlaSamError::CreateDir(dir.clone(), e))?;

        let file_name = format!("nla-sam-{:06x}", std::process::id() ^ line_entropy());
        let path = dir.join(file_name);

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(NlaSamError::CreateFile)?;

        let hash_hex = ntlmv1_hash_hex(password);
        let mut line = format!("{username}:::{hash_hex}:::\n");
        let result = file.write_all(line.as_bytes()).map_err(NlaSamError::Write);
        line.zeroize_in_place();
        result?;
        file.sync_all().map_err(NlaSamError::Sync)?;

        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NlaSamFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn runtime_dir() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("grdc")
}

/// A little jitter so concurrent handovers on the same PID don't collide;
/// not a security boundary (the file is 0600 and short-lived either way).
fn line_entropy() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0)
}

trait ZeroizeInPlace {
    fn zeroize_in_place(&mut self);
}

impl ZeroizeInPlace for String {
    fn zeroize_in_place(&mut self) {
        // SAFETY: overwriting UTF-8 bytes with zero keeps the buffer valid
        // UTF-8 (all zero bytes), and we never read it again afterward.
        unsafe {
            for b in self.as_bytes_mut() {
                *b = 0;
            }
        }
        self.clear();
    }
}

/// NTOWFv1: MD4 of the password in UTF-16LE, 16 bytes, hex-encoded
/// uppercase-free (lowercase hex, matching the reference `winpr` output).
#[must_use]
pub fn ntlmv1_hash_hex(password: &str) -> String {
    let utf16le: Vec<u8> = password
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    let digest = md4(&utf16le);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// --- MD4 (RFC 1320) ---------------------------------------------------
//
// Used only to compute the legacy NTLMv1 hash for the SAM file; not a
// general-purpose crypto primitive and not exposed outside this module.

const S: [[u32; 4]; 3] = [[3, 7, 11, 19], [3, 5, 9, 13], [3, 9, 11, 15]];

fn md4(message: &[u8]) -> [u8; 16] {
    let mut a0: u32 = 0x6745_2301;
    let mut b0: u32 = 0xefcd_ab89;
    let mut c0: u32 = 0x98ba_dcfe;
    let mut d0: u32 = 0x1032_5476;

    let mut data = message.to_vec();
    let bit_len = (message.len() as u64).wrapping_mul(8);
    data.push(0x80);
    while data.len() % 64 != 56 {
        data.push(0);
    }
    data.extend_from_slice(&bit_len.to_le_bytes());

    for chunk in data.chunks_exact(64) {
        let mut m = [0u32; 16];
        for (i, word) in chunk.chunks_exact(4).enumerate() {
            m[i] = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        }

        let (mut a, mut b, mut c, mut d) = (a0, b0, c0, d0);

        // Round 1
        for i in 0..16 {
            let f = (b & c) | (!b & d);
            let k = i;
            a = a
                .wrapping_add(f)
                .wrapping_add(m[k])
                .rotate_left(S[0][i % 4]);
            let t = d;
            d = c;
            c = b;
            b = a;
            a = t;
        }

        // Round 2
        const ORDER2: [usize; 16] = [0, 4, 8, 12, 1, 5, 9, 13, 2, 6, 10, 14, 3, 7, 11, 15];
        for (i, &k) in ORDER2.iter().enumerate() {
            let f = (b & c) | (b & d) | (c & d);
            a = a
                .wrapping_add(f)
                .wrapping_add(m[k])
                .wrapping_add(0x5a82_7999)
                .rotate_left(S[1][i % 4]);
            let t = d;
            d = c;
            c = b;
            b = a;
            a = t;
        }

        // Round 3
        const ORDER3: [usize; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];
        for (i, &k) in ORDER3.iter().enumerate() {
            let f = b ^ c ^ d;
            a = a
                .wrapping_add(f)
                .wrapping_add(m[k])
                .wrapping_add(0x6ed9_eba1)
                .rotate_left(S[2][i % 4]);
            let t = d;
            d = c;
            c = b;
            b = a;
            a = t;
        }

        a0 = a0.wrapping_add(a);
        b0 = b0.wrapping_add(b);
        c0 = c0.wrapping_add(c);
        d0 = d0.wrapping_add(d);
    }

    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&a0.to_le_bytes());
    out[4..8].copy_from_slice(&b0.to_le_bytes());
    out[8..12].copy_from_slice(&c0.to_le_bytes());
    out[12..16].copy_from_slice(&d0.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md4_empty_string() {
        // RFC 1320 test vector.
        assert_eq!(
            md4(b"")
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
            "31d6cfe0d16ae931b73c59d7e0c089c0"
        );
    }

    #[test]
    fn md4_abc() {
        assert_eq!(
            md4(b"abc")
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>(),
            "a448017aaf21d8525fc10ae87aa6729d"
        );
    }

    #[test]
    fn ntlmv1_hash_is_32_hex_chars() {
        let hash = ntlmv1_hash_hex("password");
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
