//! PalmDOC LZ77 decompression.
//!
//! Control bytes:
//! - `0x01..=0x08`: copy the next n bytes verbatim
//! - `0x00`, `0x09..=0x7F`: literal byte
//! - `0x80..=0xBF`: back-reference; with the next byte, distance is
//!   `(pair & 0x3FFF) >> 3` and length `(pair & 7) + 3`
//! - `0xC0..=0xFF`: a space followed by `byte ^ 0x80`

pub(crate) fn decompress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut i = 0;

    while i < input.len() {
        let c = input[i];
        i += 1;

        match c {
            0x01..=0x08 => {
                let end = (i + c as usize).min(input.len());
                out.extend_from_slice(&input[i..end]);
                i = end;
            }
            0x00 | 0x09..=0x7F => out.push(c),
            0xC0..=0xFF => {
                out.push(b' ');
                out.push(c ^ 0x80);
            }
            _ => {
                let Some(&next) = input.get(i) else {
                    break;
                };
                i += 1;
                let pair = u16::from_be_bytes([c, next]);
                let distance = ((pair & 0x3FFF) >> 3) as usize;
                let length = ((pair & 7) + 3) as usize;
                if distance == 0 || distance > out.len() {
                    continue;
                }
                for _ in 0..length {
                    let byte = out[out.len() - distance];
                    out.push(byte);
                }
            }
        }
    }

    out
}
