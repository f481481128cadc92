//! Sampled content hashing for executables and shim binaries.
//!
//! Reinstalling the same toolchain version must not invalidate the agent's
//! executable cache, and hashing a multi-hundred-megabyte binary on every
//! cache miss is too slow. Small files are hashed whole; large files are
//! identified by their length plus three sampled blocks.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Files at or below this size are hashed in full.
const WHOLE_FILE_THRESHOLD: u64 = 128 * 1024;

/// Block size sampled from the start, middle, and end of large files.
const SAMPLE_BLOCK: usize = 16 * 1024;

/// Hash the file at `path`, returning an uppercase hex digest.
pub fn sample_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut hasher = Sha256::new();
    hasher.update(len.to_be_bytes());

    if len <= WHOLE_FILE_THRESHOLD {
        let mut buf = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buf)?;
        hasher.update(&buf);
    } else {
        let mut block = vec![0u8; SAMPLE_BLOCK];
        for offset in [0, len / 2, len - SAMPLE_BLOCK as u64] {
            file.seek(SeekFrom::Start(offset))?;
            let read = read_up_to(&mut file, &mut block)?;
            hasher.update(&block[..read]);
        }
    }

    Ok(format!("{:X}", hasher.finalize()))
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
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
