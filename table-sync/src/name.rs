//! Ledger account-name codec.
//!
//! Names are up to 13 characters from `.12345abcdefghijklmnopqrstuvwxyz`,
//! packed 5 bits per character into a `u64`, with the 13th character taking
//! the low 4 bits.

const CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

fn char_to_symbol(c: u8) -> u64 {
    match c {
        b'a'..=b'z' => (c - b'a') as u64 + 6,
        b'1'..=b'5' => (c - b'1') as u64 + 1,
        _ => 0,
    }
}

pub fn string_to_u64(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut n = 0u64;
    let mut i = 0;
    while i < bytes.len() && i < 12 {
        n |= (char_to_symbol(bytes[i]) & 0x1f) << (64 - 5 * (i + 1));
        i += 1;
    }
    if i == 12 && bytes.len() > 12 {
        n |= char_to_symbol(bytes[12]) & 0x0f;
    }
    n
}

pub fn u64_to_string(value: u64) -> String {
    let mut out = [b'.'; 13];
    let mut tmp = value;
    for i in 0..=12 {
        let mask = if i == 0 { 0x0f } else { 0x1f };
        out[12 - i] = CHARMAP[(tmp & mask) as usize];
        tmp >>= if i == 0 { 4 } else { 5 };
    }
    let end = out.iter().rposition(|&c| c != b'.').map_or(0, |p| p + 1);
    String::from_utf8_lossy(&out[..end]).into_owned()
}
