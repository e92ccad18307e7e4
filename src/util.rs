use std::{
    fs::File,
    io::{self, ErrorKind, Read},
    path::Path,
};

use sha2::{Digest, Sha256};

/// Reads until `buf` is full or the reader hits EOF, retrying on EINTR.
///
/// Unlike `Read::read_exact()`, a short read is not an error: the number of bytes actually read is
/// returned, and it is less than `buf.len()` only at EOF.
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

/// A utility type representing a SHA-256 digest in binary.
pub type Sha256Digest = [u8; 32];

/// Computes the SHA-256 digest of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<Sha256Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// Computes the SHA-256 digest of an in-memory image.
pub fn sha256(data: &[u8]) -> Sha256Digest {
    Sha256::digest(data).into()
}
