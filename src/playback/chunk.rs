//! Fixed-size audio chunking
//!
//! Devices have a small receive buffer, so synthesized audio is streamed as
//! a sequence of bounded slices. Slicing [`Bytes`] shares the underlying
//! buffer; no chunk copies audio.

use bytes::Bytes;

/// Default bytes per chunk message
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Number of chunks `len` bytes split into
///
/// When `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
#[must_use]
pub const fn chunk_count(len: usize, chunk_size: usize) -> usize {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    len.div_ceil(chunk_size)
}

/// Split `audio` into consecutive chunks of `chunk_size` bytes
///
/// Every chunk but the last is exactly `chunk_size` bytes. Empty input
/// yields no chunks. When `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
#[must_use]
pub fn split_chunks(audio: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    (0..audio.len())
        .step_by(chunk_size)
        .map(|start| audio.slice(start..audio.len().min(start + chunk_size)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(len: usize) -> Bytes {
        #[allow(clippy::cast_possible_truncation)]
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Bytes::from(data)
    }

    #[test]
    fn reassembles_exactly() {
        for (len, size) in [(10_000, 4096), (8192, 4096), (1, 4096), (4097, 4096), (999, 7)] {
            let input = audio(len);
            let chunks = split_chunks(&input, size);

            assert_eq!(chunks.len(), chunk_count(len, size), "len {len} size {size}");
            assert_eq!(chunks.len(), len.div_ceil(size));
            for chunk in &chunks[..chunks.len() - 1] {
                assert_eq!(chunk.len(), size);
            }
            assert!(chunks.last().is_some_and(|c| !c.is_empty() && c.len() <= size));

            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            assert_eq!(joined, input.to_vec());
        }
    }

    #[test]
    fn empty_audio_has_no_chunks() {
        assert!(split_chunks(&Bytes::new(), 4096).is_empty());
        assert_eq!(chunk_count(0, 4096), 0);
    }

    #[test]
    fn zero_size_uses_default() {
        let chunks = split_chunks(&audio(DEFAULT_CHUNK_SIZE + 1), 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), DEFAULT_CHUNK_SIZE);
    }
}
