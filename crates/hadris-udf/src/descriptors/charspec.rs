//! Character set specifications and the compressed-Unicode `dstring`/textual
//! identifier encoding UDF layers on top of ECMA-167 (OSTA-UDF §2.1.2,
//! ECMA-167 §1.7.2). Follows the same raw/decoded split other fixed-width
//! on-disk text types in this workspace use.

/// `charspec` (ECMA-167 §1.7.2): 64 bytes, a 1-byte character set type plus
/// 63 bytes naming the character set information. UDF always uses CS0, the
/// OSTA compressed-Unicode set, so only that constructor is exposed.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CharSpec {
    character_set_type: u8,
    character_set_info: [u8; 63],
}

const CS0_INFO: &[u8] = b"OSTA Compressed Unicode";

impl CharSpec {
    /// The OSTA CS0 compressed-Unicode character set, used for every string
    /// field this crate writes.
    pub fn cs0() -> Self {
        let mut character_set_info = [0u8; 63];
        character_set_info[..CS0_INFO.len()].copy_from_slice(CS0_INFO);
        Self {
            character_set_type: 0,
            character_set_info,
        }
    }

    pub fn is_cs0(&self) -> bool {
        self.character_set_type == 0
    }
}

/// Decodes an OSTA compressed-Unicode `dstring`/`d-characters` byte range
/// into a native `String`. The first byte is a compression ID (8 = one byte
/// per character / Latin-1 subset, 16 = two bytes per character / UCS-2),
/// `len - 1` payload bytes follow (OSTA-UDF §2.1.2).
#[cfg(feature = "alloc")]
pub fn decode_dstring(bytes: &[u8]) -> Result<alloc::string::String, DStringError> {
    use alloc::string::String;

    let Some((&comp_id, payload)) = bytes.split_first() else {
        return Ok(String::new());
    };
    match comp_id {
        8 => Ok(payload.iter().map(|&b| b as char).collect()),
        16 => {
            if payload.len() % 2 != 0 {
                return Err(DStringError::OddLength);
            }
            let mut out = String::with_capacity(payload.len() / 2);
            for chunk in payload.chunks_exact(2) {
                let code = u16::from_be_bytes([chunk[0], chunk[1]]);
                out.push(char::from_u32(code as u32).unwrap_or('\u{FFFD}'));
            }
            Ok(out)
        }
        other => Err(DStringError::UnknownCompressionId(other)),
    }
}

/// Encodes a `&str` as an OSTA compressed-Unicode `dstring` body (without
/// the length-prefix byte UDF's fixed-width `dstring` fields additionally
/// reserve; FIDs use the plain form this function returns).
#[cfg(feature = "alloc")]
pub fn encode_dstring(value: &str) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;

    if value.chars().all(|c| (c as u32) < 0x100) {
        let mut out = Vec::with_capacity(1 + value.chars().count());
        out.push(8u8);
        out.extend(value.chars().map(|c| c as u8));
        out
    } else {
        let mut out = Vec::with_capacity(1 + value.chars().count() * 2);
        out.push(16u8);
        for c in value.chars() {
            out.extend_from_slice(&(c as u32 as u16).to_be_bytes());
        }
        out
    }
}

/// Encodes `value` into a fixed-width `dstring` field (ECMA-167 §1.7.7):
/// compression id, then as many encoded characters as fit, then a trailing
/// length byte giving the number of significant bytes (compression id
/// included) that precede it. Used for `PrimaryVolumeDescriptor`'s/
/// `LogicalVolumeDescriptorHeader`'s/`FileSetDescriptorHeader`'s identifier
/// fields, which are fixed-size byte arrays rather than length-prefixed like
/// a `FileIdentifierDescriptor`'s name.
#[cfg(feature = "alloc")]
pub fn encode_dstring_fixed(field: &mut [u8], value: &str) {
    field.fill(0);
    if field.is_empty() {
        return;
    }
    let body = encode_dstring(value);
    let max_body = field.len() - 1;
    let len = body.len().min(max_body);
    field[..len].copy_from_slice(&body[..len]);
    field[field.len() - 1] = len as u8;
}

/// `dstring` decode failures. Kept independent of `thiserror` (which this
/// crate only pulls in under the `std` feature) since decoding only needs
/// `alloc`.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DStringError {
    OddLength,
    UnknownCompressionId(u8),
}

#[cfg(feature = "alloc")]
impl core::fmt::Display for DStringError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OddLength => write!(
                f,
                "compressed-unicode payload has an odd number of bytes for a 2-byte-per-char string"
            ),
            Self::UnknownCompressionId(id) => write!(f, "unknown dstring compression id {id}"),
        }
    }
}

#[cfg(all(feature = "alloc", feature = "std"))]
impl std::error::Error for DStringError {}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trips_through_8_bit_form() {
        let encoded = encode_dstring("disk1");
        assert_eq!(encoded[0], 8);
        let decoded = decode_dstring(&encoded).unwrap();
        assert_eq!(decoded, "disk1");
    }

    #[test]
    fn non_latin1_uses_16_bit_form() {
        let encoded = encode_dstring("日本語");
        assert_eq!(encoded[0], 16);
        let decoded = decode_dstring(&encoded).unwrap();
        assert_eq!(decoded, "日本語");
    }

    #[test]
    fn empty_input_decodes_to_empty_string() {
        assert_eq!(decode_dstring(&[]).unwrap(), "");
    }

    #[test]
    fn fixed_dstring_round_trips_through_decode() {
        let mut field = [0u8; 32];
        encode_dstring_fixed(&mut field, "hadris-udf");
        let len = field[31] as usize;
        assert_eq!(decode_dstring(&field[..len]).unwrap(), "hadris-udf");
    }
}
