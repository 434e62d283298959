use getrandom::getrandom;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_WIDTH: usize = 5;
const SUFFIX_SPACE: u32 = 60_466_176; // 36^5

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

/// Builds `<prefix>-<base36 millis>-<5 random base36 chars>`.
pub fn compact_id(prefix: &str, now_ms: i64) -> String {
    let mut bytes = [0_u8; 4];
    // Entropy failure only weakens uniqueness; the timestamp part still orders ids.
    let _ = getrandom(&mut bytes);
    let sample = u32::from_le_bytes(bytes) % SUFFIX_SPACE;
    let ts = base36_encode_u64(u64::try_from(now_ms).unwrap_or(0));
    format!(
        "{prefix}-{ts}-{}",
        base36_encode_fixed_u32(sample, SUFFIX_WIDTH)
    )
}
