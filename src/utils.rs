use std::fmt::Write;

/// Space separated hex of the first `count` bytes, e.g. `"0c 10 08 10"`
pub fn hex_preview(bytes: &[u8], count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for (i, b) in bytes.iter().take(count).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}
