use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub const BUFFER_SIZE: usize = 1024 * 1024;
pub const RANDOM_SEED: u64 = 123;

/// Write-source and read-scratch buffers shared by every operation.
///
/// The source is filled once from a fixed-seed generator, so the payload of a
/// `write(offset, size)` is identical across runs. The scratch is overwritten
/// by each read and only its hash survives into the trace.
pub struct Buffers {
    source: Vec<u8>,
    scratch: Vec<u8>,
}

impl Buffers {
    pub fn new() -> Buffers {
        let mut source = vec![0u8; BUFFER_SIZE];
        StdRng::seed_from_u64(RANDOM_SEED).fill_bytes(&mut source);
        Buffers {
            source,
            scratch: vec![0u8; BUFFER_SIZE],
        }
    }

    pub fn source(&self) -> &[u8] {
        &self.source
    }

    pub(crate) fn source_range(&self, offset: usize, size: usize) -> &[u8] {
        match offset.checked_add(size) {
            Some(end) if end <= BUFFER_SIZE => &self.source[offset..end],
            _ => crate::fatal(format!(
                "offset {offset} + {size} is too big to write from (buffer size is {BUFFER_SIZE})"
            )),
        }
    }

    pub(crate) fn scratch_range(&mut self, size: usize) -> &mut [u8] {
        if size > BUFFER_SIZE {
            crate::fatal(format!(
                "size {size} is too big to read to (buffer size is {BUFFER_SIZE})"
            ));
        }
        &mut self.scratch[..size]
    }

    pub(crate) fn scratch(&self) -> &[u8] {
        &self.scratch
    }
}

impl Default for Buffers {
    fn default() -> Buffers {
        Buffers::new()
    }
}

/// Polynomial rolling hash over exactly the bytes a read returned: reapplying
/// it to the same bytes reproduces the same digest, so two traces can be
/// compared for content equality without storing payloads.
pub fn content_hash(bytes: &[u8]) -> u64 {
    let mut h: u64 = 1;
    for &b in bytes {
        h = h.wrapping_mul(31).wrapping_add(u64::from(b));
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_of_empty_input_is_one() {
        assert_eq!(1, content_hash(&[]));
    }

    #[test]
    fn hash_reference_values() {
        assert_eq!(32, content_hash(&[1]));
        assert_eq!(3042, content_hash(b"AB"));
    }

    #[test]
    fn hash_is_deterministic() {
        let buffers = Buffers::new();
        let bytes = &buffers.source()[100..200];
        assert_eq!(content_hash(bytes), content_hash(bytes));
    }

    #[test]
    fn source_is_reproducible_across_instances() {
        assert_eq!(Buffers::new().source(), Buffers::new().source());
    }

    #[test]
    fn source_range_spans_requested_window() {
        let buffers = Buffers::new();
        let range = buffers.source_range(999, 1024);
        assert_eq!(1024, range.len());
        assert_eq!(&buffers.source()[999..999 + 1024], range);
    }
}
