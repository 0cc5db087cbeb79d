//! LZF block decompression.

use crate::core::{ConvertError, Result};

/// Largest decompressed block the record stream uses.
pub const BLOCK_CAPACITY: usize = 0x40000;

pub fn decompress(input: &[u8], capacity: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(capacity);
    let mut i = 0;

    while i < input.len() {
        let ctrl = input[i] as usize;
        i += 1;

        if ctrl < 32 {
            let end = i + ctrl + 1;
            let literal = input.get(i..end).ok_or_else(|| corrupt("literal run past end of block"))?;
            out.extend_from_slice(literal);
            i = end;
        } else {
            let mut len = ctrl >> 5;
            if len == 7 {
                len += *input.get(i).ok_or_else(|| corrupt("truncated length byte"))? as usize;
                i += 1;
            }
            let low = *input.get(i).ok_or_else(|| corrupt("truncated back-reference"))? as usize;
            i += 1;

            let distance = ((ctrl & 0x1f) << 8) + low + 1;
            if distance > out.len() {
                return Err(corrupt("back-reference before start of block"));
            }
            let start = out.len() - distance;
            // Copies may overlap their own output.
            for k in 0..len + 2 {
                let byte = out[start + k];
                out.push(byte);
            }
        }

        if out.len() > capacity {
            return Err(corrupt("block expands past its capacity"));
        }
    }

    Ok(out)
}

fn corrupt(detail: &str) -> ConvertError {
    ConvertError::malformed(format!("corrupt compressed block: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_literals_and_overlapping_references() {
        // "abc" literal, then copy 6 bytes starting 3 back.
        let input = [2, b'a', b'b', b'c', 4 << 5, 2];
        assert_eq!(decompress(&input, 64).unwrap(), b"abcabcabc");
    }

    #[test]
    fn long_references_use_extra_length_byte() {
        let input = [0, b'x', 7 << 5, 1, 0];
        assert_eq!(decompress(&input, 64).unwrap(), vec![b'x'; 11]);
    }

    #[test]
    fn rejects_corrupt_input() {
        assert!(decompress(&[5, b'a'], 64).is_err());
        assert!(decompress(&[1 << 5, 9], 64).is_err());
        assert!(decompress(&[3, 1, 2, 3, 4], 2).is_err());
    }
}
