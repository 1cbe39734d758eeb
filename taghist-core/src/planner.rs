//! Pure read-window planning: groups requested tag addresses per source and
//! memory block, then coalesces adjacent byte ranges into bounded windows so
//! one device transaction covers many tags. No I/O happens here.

use crate::address::TagAddress;
use std::collections::HashMap;

/// One (session, tag) request inside a window.
#[derive(Debug, Clone)]
pub struct WindowMember {
    pub session_id: String,
    pub tag_name: String,
    pub address: TagAddress,
}

/// A merged, bounded, contiguous byte range read from one device block in a
/// single transaction. Rebuilt every poll cycle.
#[derive(Debug, Clone)]
pub struct ReadWindow {
    pub source_key: String,
    pub block: u16,
    pub start: u32,
    pub length: u32,
    pub members: Vec<WindowMember>,
}

impl ReadWindow {
    #[inline]
    pub fn end(&self) -> u32 {
        self.start + self.length
    }
}

/// Plan windows for an arbitrary mix of members.
///
/// Members are grouped by (source, block) and sorted by byte offset; within
/// a group the current window is greedily extended as long as the merged
/// span stays within `max_window_bytes`. A member whose own size already
/// exceeds the bound is accepted as a window of its own.
pub fn plan_windows(members: Vec<WindowMember>, max_window_bytes: u32) -> Vec<ReadWindow> {
    let mut groups: HashMap<(String, u16), Vec<WindowMember>> = HashMap::new();
    for member in members {
        groups
            .entry((member.address.source_key.clone(), member.address.block))
            .or_default()
            .push(member);
    }

    let mut windows = Vec::new();
    for ((source_key, block), mut group) in groups {
        group.sort_by_key(|m| m.address.byte_offset);

        let mut current: Option<ReadWindow> = None;
        for member in group {
            let m_start = member.address.byte_offset;
            let m_end = member.address.end_offset();

            if let Some(window) = current.as_mut() {
                let merged_end = window.end().max(m_end);
                if merged_end - window.start <= max_window_bytes {
                    window.length = merged_end - window.start;
                    window.members.push(member);
                    continue;
                }
            }
            if let Some(window) = current.take() {
                windows.push(window);
            }
            current = Some(open_window(&source_key, block, m_start, m_end, member));
        }
        if let Some(window) = current {
            windows.push(window);
        }
    }
    windows
}

fn open_window(
    source_key: &str,
    block: u16,
    start: u32,
    end: u32,
    member: WindowMember,
) -> ReadWindow {
    ReadWindow {
        source_key: source_key.to_string(),
        block,
        start,
        length: end - start,
        members: vec![member],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressKind;

    fn member(offset: u32, kind: AddressKind) -> WindowMember {
        WindowMember {
            session_id: "S".into(),
            tag_name: format!("A01_DB1.{:?}{offset}", kind),
            address: TagAddress {
                source_key: "A01".into(),
                block: 1,
                byte_offset: offset,
                kind,
                bit_index: if kind == AddressKind::Bit { Some(0) } else { None },
            },
        }
    }

    fn check_invariants(windows: &[ReadWindow], members: &[(u32, u32)], max: u32) {
        // (1) every request's full byte range is covered by some window
        for &(start, end) in members {
            assert!(
                windows.iter().any(|w| w.start <= start && end <= w.end()),
                "range [{start},{end}) not covered"
            );
        }
        // (2) bound respected unless a single member exceeds it
        for w in windows {
            assert!(
                w.length <= max || w.members.len() == 1,
                "window of {} bytes exceeds bound {max}",
                w.length
            );
        }
        // (3) pairwise non-overlapping
        let mut sorted: Vec<_> = windows.iter().collect();
        sorted.sort_by_key(|w| w.start);
        for pair in sorted.windows(2) {
            assert!(pair[0].end() <= pair[1].start, "windows overlap");
        }
        // (4) minimal: no two adjacent windows could merge within the bound
        for pair in sorted.windows(2) {
            assert!(
                pair[1].end() - pair[0].start > max,
                "adjacent windows could have been merged"
            );
        }
    }

    #[test]
    fn adjacent_tags_share_one_window() {
        let windows = plan_windows(
            vec![
                member(0, AddressKind::Int16),
                member(2, AddressKind::Int16),
                member(4, AddressKind::Int32),
            ],
            2000,
        );
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start, 0);
        assert_eq!(windows[0].length, 8);
        assert_eq!(windows[0].members.len(), 3);
    }

    #[test]
    fn capacity_bound_splits_windows() {
        // Two int16 tags 10 bytes apart with a 8-byte bound cannot merge.
        let windows = plan_windows(
            vec![member(0, AddressKind::Int16), member(10, AddressKind::Int16)],
            8,
        );
        assert_eq!(windows.len(), 2);
        check_invariants(&windows, &[(0, 2), (10, 12)], 8);
    }

    #[test]
    fn gap_within_bound_is_bridged() {
        // 10 bytes apart but bound 2000: one window spanning the gap.
        let windows = plan_windows(
            vec![member(0, AddressKind::Int16), member(10, AddressKind::Int16)],
            2000,
        );
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].length, 12);
    }

    #[test]
    fn scattered_requests_satisfy_all_planner_invariants() {
        let offsets = [0u32, 2, 4, 40, 41, 100, 900, 1998, 2100, 4000];
        let members: Vec<_> = offsets
            .iter()
            .map(|&o| member(o, AddressKind::Int16))
            .collect();
        let ranges: Vec<_> = members
            .iter()
            .map(|m| (m.address.byte_offset, m.address.end_offset()))
            .collect();
        let windows = plan_windows(members, 2000);
        check_invariants(&windows, &ranges, 2000);
    }

    #[test]
    fn groups_by_source_and_block() {
        let mut m1 = member(0, AddressKind::Int16);
        let mut m2 = member(0, AddressKind::Int16);
        m2.address.block = 2;
        let mut m3 = member(0, AddressKind::Int16);
        m3.address.source_key = "B02".into();
        m1.address.block = 1;

        let windows = plan_windows(vec![m1, m2, m3], 2000);
        assert_eq!(windows.len(), 3);
    }

    #[test]
    fn duplicate_offsets_merge_into_one_window() {
        // The same tag subscribed by two sessions appears twice.
        let windows = plan_windows(
            vec![member(2, AddressKind::Int16), member(2, AddressKind::Int16)],
            2000,
        );
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].members.len(), 2);
        assert_eq!(windows[0].length, 2);
    }
}
