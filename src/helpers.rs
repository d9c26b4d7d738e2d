//! When presenting ECU response data from raw bytes,
//! Some functions in here can be useful with data transformation

/// Formats bytes as space separated upper case hex, EG: `"70 0F 1C"`
pub fn hex_string(input: &[u8]) -> String {
    let mut res = String::with_capacity(input.len() * 3);
    for (pos, x) in input.iter().enumerate() {
        if pos != 0 {
            res.push(' ');
        }
        res.push_str(&format!("{x:02X}"));
    }
    res
}

/// Converts a payload to an ASCII string.
///
/// The string ends at the first NUL byte, or at the end of the payload.
/// Bytes which are not printable ASCII are replaced with `'.'`
pub fn ascii_from_payload(input: &[u8]) -> String {
    input
        .iter()
        .take_while(|b| **b != 0x00)
        .map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                '.'
            }
        })
        .collect()
}
