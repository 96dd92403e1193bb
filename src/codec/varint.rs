use crate::core::error::{Error, ErrorKind, Result};

/// Variable byte encoding for integers (best for small integers)
pub struct VByteEncoder;

impl VByteEncoder {
    /// Values < 128 use 1 byte, < 16384 use 2 bytes, etc.
    pub fn encode_u64(output: &mut Vec<u8>, mut value: u64) {
        while value >= 128 {
            output.push((value & 127) as u8 | 128);  // Set continuation bit
            value >>= 7;
        }
        output.push(value as u8);  // Last byte without continuation bit
    }

    /// Decode single value, returns (value, bytes_consumed)
    pub fn decode_u64(input: &[u8]) -> Result<(u64, usize)> {
        let mut value = 0u64;
        let mut shift = 0;
        let mut consumed = 0;

        for &byte in input {
            consumed += 1;
            value |= ((byte & 127) as u64) << shift;

            if byte & 128 == 0 {  // No continuation bit
                return Ok((value, consumed));
            }

            shift += 7;
            if shift > 63 {  // Max 10 bytes for u64
                return Err(Error::new(ErrorKind::Parse, "VByte overflow".to_string()));
            }
        }

        Err(Error::new(ErrorKind::Parse, "Incomplete VByte".to_string()))
    }
}

/// Delta encoding for sorted integers
pub struct DeltaEncoder;

impl DeltaEncoder {
    pub fn encode_sorted(output: &mut Vec<u8>, nums: impl IntoIterator<Item = u64>) {
        let mut prev = 0u64;
        for num in nums {
            VByteEncoder::encode_u64(output, num.wrapping_sub(prev));
            prev = num;
        }
    }

    pub fn decode_sorted(data: &[u8]) -> Result<Vec<u64>> {
        let mut nums = Vec::new();
        let mut pos = 0;
        let mut prev = 0u64;

        while pos < data.len() {
            let (delta, consumed) = VByteEncoder::decode_u64(&data[pos..])?;
            let val = prev.wrapping_add(delta);
            nums.push(val);
            prev = val;
            pos += consumed;
        }

        Ok(nums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vbyte_sizes() {
        let mut out = Vec::new();
        VByteEncoder::encode_u64(&mut out, 127);
        assert_eq!(out.len(), 1);
        out.clear();
        VByteEncoder::encode_u64(&mut out, 16384);
        assert_eq!(out.len(), 3);
        assert_eq!(VByteEncoder::decode_u64(&out).unwrap(), (16384, 3));
        assert!(VByteEncoder::decode_u64(&[0x80]).is_err());
    }

    #[test]
    fn delta_keeps_sorted_ids() {
        let ids = vec![1, 2, 3, 1000, 1_000_000, u64::MAX - 1];
        let mut out = Vec::new();
        DeltaEncoder::encode_sorted(&mut out, ids.iter().copied());
        assert_eq!(DeltaEncoder::decode_sorted(&out).unwrap(), ids);
    }
}
