//! Shelf discovery and shelf-number allocation.
//!
//! One broadcast `Discover` goes out, then `Offer` replies are collected
//! until the wall-clock deadline. The same probe backs the client's
//! selection table and the server's startup shelf claim.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::trace;

use crate::frame::{Frame, FrameType, BROADCAST};
use crate::link::LinkIo;
use crate::mac::{format_mac, Mac};

/// One discovered console endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shelf {
    pub mac: Mac,
    pub shelf: i32,
    pub desc: String,
}

/// Narrowing applied while collecting offers. A narrowed probe returns as
/// soon as the first match arrives.
#[derive(Debug, Clone, Copy, Default)]
pub struct Filter {
    pub shelf: Option<i32>,
    pub mac: Option<Mac>,
}

impl Filter {
    pub fn any() -> Filter {
        Filter::default()
    }

    pub fn is_narrowed(&self) -> bool {
        self.shelf.is_some() || self.mac.is_some()
    }
}

/// Broadcast a `Discover` and collect matching offers until `wait` runs
/// out. The result is sorted ascending by shelf number; entries for the
/// same shelf keep arrival order.
pub fn discover<L: LinkIo + ?Sized>(
    link: &mut L,
    wait: Duration,
    filter: &Filter,
) -> Result<Vec<Shelf>> {
    let mut tab: Vec<Shelf> = Vec::new();
    link.send(&Frame::control(FrameType::Discover, BROADCAST, 0).encode())?;

    let deadline = Instant::now() + wait;
    while let Some(raw) = link.recv_deadline(Some(deadline))? {
        let frame = match Frame::decode(&raw) {
            Ok(f) => f,
            Err(e) => {
                trace!("probe drop: {}", e);
                continue;
            }
        };
        if frame.ftype != FrameType::Offer || frame.payload.is_empty() {
            continue;
        }
        // offers are unicast replies; a broadcast destination is someone
        // else's probe echoing around
        if frame.is_broadcast() {
            trace!("probe drop: broadcast offer from {}", format_mac(&frame.src));
            continue;
        }
        let Some((shelf, desc)) = parse_offer(&frame.payload) else {
            trace!("probe drop: unparseable offer from {}", format_mac(&frame.src));
            continue;
        };
        if filter.shelf.is_some_and(|want| want != shelf) {
            continue;
        }
        if filter.mac.is_some_and(|want| want != frame.src) {
            continue;
        }
        insert_sorted(&mut tab, Shelf { mac: frame.src, shelf, desc });
        if filter.is_narrowed() {
            break;
        }
    }
    Ok(tab)
}

/// Parse an offer payload: `"<decimal-shelf>\t<description>"`. A `\x01`
/// byte is tolerated as an additional separator before or inside the
/// description (everything past it is a secondary field and is dropped).
pub fn parse_offer(payload: &[u8]) -> Option<(i32, String)> {
    let text = String::from_utf8_lossy(payload);
    let rest = text.trim_start_matches([' ', '\t']);
    let end = rest.find([' ', '\t']).unwrap_or(rest.len());
    let shelf = leading_int(&rest[..end])?;
    let desc = rest[end..]
        .trim_start_matches([' ', '\t'])
        .trim_start_matches('\x01');
    let desc = desc.split('\x01').next().unwrap_or("");
    Some((shelf, desc.trim_end_matches('\0').to_string()))
}

// atoi-style: accept a decimal prefix, require at least one digit
fn leading_int(s: &str) -> Option<i32> {
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s),
    };
    let end = digits.find(|c: char| !c.is_ascii_digit()).unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let v: i64 = digits[..end].parse().ok()?;
    i32::try_from(sign * v).ok()
}

fn insert_sorted(tab: &mut Vec<Shelf>, s: Shelf) {
    let at = tab.iter().position(|t| t.shelf > s.shelf).unwrap_or(tab.len());
    tab.insert(at, s);
}

/// Find the entry for `shelf`, optionally narrowed to a specific MAC.
/// Without a MAC the first listed entry for the shelf wins.
pub fn find<'a>(tab: &'a [Shelf], shelf: i32, mac: Option<Mac>) -> Option<&'a Shelf> {
    tab.iter()
        .find(|s| s.shelf == shelf && mac.map_or(true, |m| s.mac == m))
}

/// Render the discovery table. One row per shelf; multiple MACs serving
/// the same shelf are comma-joined in arrival order.
pub fn render_table(tab: &[Shelf], header: bool) -> String {
    let mut out = String::new();
    if header {
        out.push_str("SHELF | EA\n");
    }
    let mut i = 0;
    while i < tab.len() {
        let shelf = tab[i].shelf;
        let mut macs = format_mac(&tab[i].mac);
        let desc = tab[i].desc.clone();
        let mut j = i + 1;
        while j < tab.len() && tab[j].shelf == shelf {
            macs.push(',');
            macs.push_str(&format_mac(&tab[j].mac));
            j += 1;
        }
        out.push_str(&format!("{:<5}   {}    {}\n", shelf, macs, desc));
        i = j;
    }
    out
}

/// Pick an unused shelf number from a discovery snapshot.
///
/// With `max` the highest occupied number and `count` the snapshot size:
/// gaps are filled (lowest first) only when `max < count`; otherwise the
/// next number past the highest is taken.
pub fn pick_free_shelf(tab: &[Shelf]) -> i32 {
    let max = tab.iter().map(|s| s.shelf).max().unwrap_or(-1);
    let count = tab.len() as i32;
    if max < count {
        let mut n = 0;
        while tab.iter().any(|s| s.shelf == n) {
            n += 1;
        }
        n
    } else {
        max + 1
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;

    const MAC_A: Mac = [0x00, 0x30, 0x48, 0x86, 0x5f, 0x1e];
    const MAC_B: Mac = [0x00, 0x30, 0x48, 0x86, 0x5f, 0x1f];
    const LOCAL: Mac = [0x02, 0, 0, 0, 0, 0x01];

    fn offer(src: Mac, payload: &[u8]) -> Frame {
        let mut f = Frame::data(LOCAL, 0, 0, payload);
        f.ftype = FrameType::Offer;
        f.src = src;
        f
    }

    fn shelves(nums: &[i32]) -> Vec<Shelf> {
        nums.iter()
            .map(|&n| Shelf { mac: MAC_A, shelf: n, desc: String::new() })
            .collect()
    }

    #[test]
    fn test_parse_offer_tab_separated() {
        assert_eq!(
            parse_offer(b"5\thost linux 5.10 x86_64"),
            Some((5, "host linux 5.10 x86_64".to_string()))
        );
    }

    #[test]
    fn test_parse_offer_ctrl_a_separator() {
        assert_eq!(
            parse_offer(b"7\t\x01extra desc\x01ignored"),
            Some((7, "extra desc".to_string()))
        );
    }

    #[test]
    fn test_parse_offer_no_description() {
        assert_eq!(parse_offer(b"12"), Some((12, String::new())));
    }

    #[test]
    fn test_parse_offer_rejects_non_numeric() {
        assert_eq!(parse_offer(b"shelf five"), None);
    }

    #[test]
    fn test_discover_collects_sorted() {
        let mut link = MockLink::new(LOCAL);
        link.queue(&offer(MAC_A, b"5\talpha"));
        link.queue(&offer(MAC_B, b"2\tbeta"));
        let tab = discover(&mut link, Duration::from_secs(2), &Filter::any()).unwrap();
        assert_eq!(tab.len(), 2);
        assert_eq!(tab[0].shelf, 2);
        assert_eq!(tab[1].shelf, 5);
        // the probe itself went out as a broadcast Discover
        let sent = link.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ftype, FrameType::Discover);
        assert_eq!(sent[0].dst, BROADCAST);
        assert!(sent[0].payload.is_empty());
    }

    #[test]
    fn test_discover_same_shelf_keeps_arrival_order() {
        let mut link = MockLink::new(LOCAL);
        link.queue(&offer(MAC_A, b"5\tfirst"));
        link.queue(&offer(MAC_B, b"5\tsecond"));
        let tab = discover(&mut link, Duration::from_secs(2), &Filter::any()).unwrap();
        assert_eq!(tab[0].mac, MAC_A);
        assert_eq!(tab[1].mac, MAC_B);
    }

    #[test]
    fn test_discover_drops_broadcast_offers_and_runts() {
        let mut link = MockLink::new(LOCAL);
        let mut bcast = offer(MAC_A, b"1\tx");
        bcast.dst = BROADCAST;
        link.queue(&bcast);
        link.rx.push_back(vec![0u8; 30]); // runt
        link.queue(&offer(MAC_B, b"3\tok"));
        let tab = discover(&mut link, Duration::from_secs(2), &Filter::any()).unwrap();
        assert_eq!(tab.len(), 1);
        assert_eq!(tab[0].shelf, 3);
    }

    #[test]
    fn test_discover_shelf_filter_returns_first_match() {
        let mut link = MockLink::new(LOCAL);
        link.queue(&offer(MAC_A, b"2\tnope"));
        link.queue(&offer(MAC_B, b"5\tyes"));
        link.queue(&offer(MAC_A, b"5\tlater")); // never reached
        let filter = Filter { shelf: Some(5), mac: None };
        let tab = discover(&mut link, Duration::from_secs(2), &filter).unwrap();
        assert_eq!(tab.len(), 1);
        assert_eq!(tab[0].mac, MAC_B);
    }

    #[test]
    fn test_discover_mac_filter() {
        let mut link = MockLink::new(LOCAL);
        link.queue(&offer(MAC_A, b"2\tnope"));
        link.queue(&offer(MAC_B, b"9\tyes"));
        let filter = Filter { shelf: None, mac: Some(MAC_B) };
        let tab = discover(&mut link, Duration::from_secs(2), &filter).unwrap();
        assert_eq!(tab.len(), 1);
        assert_eq!(tab[0].shelf, 9);
    }

    #[test]
    fn test_render_table_groups_macs() {
        let tab = vec![
            Shelf { mac: MAC_A, shelf: 5, desc: "host linux".into() },
            Shelf { mac: MAC_B, shelf: 5, desc: "host linux".into() },
            Shelf { mac: MAC_A, shelf: 7, desc: "other".into() },
        ];
        let text = render_table(&tab, true);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "SHELF | EA");
        assert!(lines[1].starts_with("5"));
        assert!(lines[1].contains("003048865F1E,003048865F1F"));
        assert!(lines[1].ends_with("host linux"));
        assert!(lines[2].starts_with("7"));
    }

    #[test]
    fn test_find_prefers_first_mac() {
        let tab = vec![
            Shelf { mac: MAC_A, shelf: 5, desc: String::new() },
            Shelf { mac: MAC_B, shelf: 5, desc: String::new() },
        ];
        assert_eq!(find(&tab, 5, None).unwrap().mac, MAC_A);
        assert_eq!(find(&tab, 5, Some(MAC_B)).unwrap().mac, MAC_B);
        assert!(find(&tab, 6, None).is_none());
    }

    #[test]
    fn test_allocator_gap_rule() {
        assert_eq!(pick_free_shelf(&shelves(&[0, 2, 3])), 4);
        assert_eq!(pick_free_shelf(&shelves(&[1, 2])), 3);
        assert_eq!(pick_free_shelf(&shelves(&[0, 2])), 3);
        assert_eq!(pick_free_shelf(&shelves(&[1])), 2);
        assert_eq!(pick_free_shelf(&shelves(&[2, 3])), 4);
    }

    #[test]
    fn test_allocator_empty_and_duplicates() {
        assert_eq!(pick_free_shelf(&[]), 0);
        // duplicate shelf numbers push count past max: gap scan kicks in
        assert_eq!(pick_free_shelf(&shelves(&[2, 2, 2])), 0);
        assert_eq!(pick_free_shelf(&shelves(&[0, 0, 1, 1])), 2);
    }
}
