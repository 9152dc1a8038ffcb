//! Display sanitization for received bytes.

/// Byte written in place of anything that is not safe to display.
pub const PLACEHOLDER: u8 = b'.';

/// Returns true if `byte` is written to the echo sink unchanged.
///
/// Newline and the range from space up to and including DEL pass through.
/// Everything else, including bytes with the high bit set, is replaced.
#[inline]
pub fn is_displayable(byte: u8) -> bool {
    byte == b'\n' || (b' '..0x80).contains(&byte)
}

/// Replace non-displayable bytes with [`PLACEHOLDER`] in place.
pub fn sanitize(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        if !is_displayable(*byte) {
            *byte = PLACEHOLDER;
        }
    }
}
