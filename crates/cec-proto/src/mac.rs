//! MAC address and small text codecs shared by both ends of the protocol.

pub type Mac = [u8; 6];

/// Render a MAC the way the selection table shows it: 12 uppercase hex
/// digits, no separators (`003048865F1E`).
pub fn format_mac(mac: &Mac) -> String {
    let mut s = String::with_capacity(12);
    for b in mac {
        s.push_str(&format!("{:02X}", b));
    }
    s
}

/// Parse a MAC from either the bare 12-digit form or the `:`-separated
/// form. Case-insensitive.
pub fn parse_mac(s: &str) -> Option<Mac> {
    let hex: String = s.chars().filter(|c| *c != ':').collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, out) in mac.iter_mut().enumerate() {
        *out = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(mac)
}

/// Whitespace tokenization for prompt replies like `"5 003048865F1E"`.
pub fn tokenize(s: &str) -> Vec<&str> {
    s.split_whitespace().collect()
}

/// Hex dump for debug logging, 16 bytes per line.
pub fn hexdump(buf: &[u8]) -> String {
    let mut out = String::new();
    for (i, b) in buf.iter().enumerate() {
        out.push_str(&format!("{:02X}", b));
        out.push(if (i + 1) % 16 == 0 { '\n' } else { ' ' });
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(&[0x00, 0x30, 0x48, 0x86, 0x5f, 0x1e]), "003048865F1E");
        assert_eq!(format_mac(&[0xff; 6]), "FFFFFFFFFFFF");
    }

    #[test]
    fn test_parse_mac_bare() {
        assert_eq!(
            parse_mac("003048865f1e"),
            Some([0x00, 0x30, 0x48, 0x86, 0x5f, 0x1e])
        );
    }

    #[test]
    fn test_parse_mac_colons() {
        assert_eq!(
            parse_mac("00:30:48:86:5F:1E"),
            Some([0x00, 0x30, 0x48, 0x86, 0x5f, 0x1e])
        );
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!(parse_mac("").is_none());
        assert!(parse_mac("0030").is_none());
        assert!(parse_mac("zz3048865f1e").is_none());
        assert!(parse_mac("003048865f1e00").is_none());
    }

    #[test]
    fn test_parse_format_round_trip() {
        let mac = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        assert_eq!(parse_mac(&format_mac(&mac)), Some(mac));
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("5 003048865F1E"), vec!["5", "003048865F1E"]);
        assert_eq!(tokenize("  q \r\n"), vec!["q"]);
        assert!(tokenize(" \t\r\n").is_empty());
    }

    #[test]
    fn test_hexdump_lines() {
        let dump = hexdump(&[0xAB; 20]);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("AB AB"));
    }
}
