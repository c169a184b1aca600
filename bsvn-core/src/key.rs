//! Base-36 keys for strings, representations, transactions and copies

/// The key handed out first by a fresh counter
pub const FIRST_KEY: &str = "0";

/// Return the key following `key` in base-36 (`0-9a-z`) order.
///
/// Returns `None` for keys that are empty or contain other bytes.
pub fn next_key(key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let mut digits: Vec<u8> = key.bytes().collect();
    if !digits.iter().all(|b| b.is_ascii_digit() || b.is_ascii_lowercase()) {
        return None;
    }
    let mut carry = true;
    for d in digits.iter_mut().rev() {
        if !carry {
            break;
        }
        *d = match *d {
            b'9' => {
                carry = false;
                b'a'
            }
            b'z' => b'0',
            other => {
                carry = false;
                other + 1
            }
        };
    }
    if carry {
        digits.insert(0, b'1');
    }
    String::from_utf8(digits).ok()
}
