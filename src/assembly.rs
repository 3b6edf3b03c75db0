//! Fragment reassembly: the assembly table and the merge algorithm.

use crate::address::Ipv4Address;
use crate::buf::PacketBuf;
use crate::header::Ipv4Header;
use crate::packet::{Packet, RxStatus};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Number of hash buckets in an assembly table.
pub const ASSEMBLE_HASH_SIZE: usize = 127;

/// Seconds an in-progress datagram may wait for its missing fragments.
pub const FRAGMENT_LIFE: u32 = 120;

/// The four header fields that associate fragments of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssembleKey {
    pub dst: Ipv4Address,
    pub src: Ipv4Address,
    pub id: u16,
    pub protocol: u8,
}

impl AssembleKey {
    fn of(head: &Ipv4Header) -> Self {
        Self {
            dst: head.destination,
            src: head.source,
            id: head.identification,
            protocol: head.protocol,
        }
    }
}

/// The in-progress reassembly state for one datagram.
#[derive(Debug)]
struct AssembleEntry {
    key: AssembleKey,
    /// Fragments in ascending `start` order; no two overlap
    fragments: Vec<Packet>,
    /// Zero until the MF=0 fragment arrives, then that fragment's `end`
    total_len: u32,
    /// Bytes covered by `fragments`
    cur_len: u32,
    /// The header of the `start == 0` fragment, captured once
    head: Option<Ipv4Header>,
    /// The clip info of the `start == 0` fragment
    info: Option<crate::packet::ClipInfo>,
    /// Seconds until the entry is evicted
    life: u32,
}

impl AssembleEntry {
    fn new(key: AssembleKey) -> Self {
        Self {
            key,
            fragments: Vec::new(),
            total_len: 0,
            cur_len: 0,
            head: None,
            info: None,
            life: FRAGMENT_LIFE,
        }
    }

    /// Consumes the entry into the finished datagram. All fragments are
    /// present; the fragment list becomes the datagram's backing storage.
    fn finish(self) -> Option<Packet> {
        let last_end = self.fragments.last().map(|f| f.clip.end)?;
        if last_end != self.total_len {
            // Coverage can't leave a hole here, but a forged fragment can
            // run past the advertised total. Not a real datagram.
            tracing::debug!("fragment chain runs past its total length, dropping");
            return None;
        }

        debug_assert!(self.head.is_some(), "complete datagram with no first fragment");
        let head = self.head?;
        let mut clip = self.info?;

        let mut body = PacketBuf::default();
        for fragment in self.fragments {
            body.append(fragment.body);
        }

        clip.start = 0;
        clip.end = self.total_len;
        clip.length = self.total_len;
        clip.status = RxStatus::Success;
        Some(Packet { head, clip, body })
    }
}

/// A fixed-size hash table of in-progress datagrams keyed by
/// `(dst, src, id, protocol)`.
#[derive(Debug)]
pub struct AssembleTable {
    buckets: Vec<Vec<AssembleEntry>>,
}

impl Default for AssembleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AssembleTable {
    pub fn new() -> Self {
        Self {
            buckets: (0..ASSEMBLE_HASH_SIZE).map(|_| Vec::new()).collect(),
        }
    }

    /// Removes every entry and all of their fragments.
    pub fn clean(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// The number of datagrams currently awaiting fragments.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_index(key: &AssembleKey) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % ASSEMBLE_HASH_SIZE as u64) as usize
    }

    /// Ages every entry by one second, destroying the ones whose time is up.
    pub(crate) fn tick(&mut self) {
        for bucket in &mut self.buckets {
            bucket.retain_mut(|entry| {
                if entry.life > 0 {
                    entry.life -= 1;
                    entry.life > 0
                } else {
                    true
                }
            });
        }
    }

    /// Merges one fragment into the table. Returns the finished datagram
    /// once every byte of it has been received, `None` otherwise. Fragments
    /// that duplicate already-covered bytes are dropped.
    pub fn reassemble(&mut self, mut packet: Packet) -> Option<Packet> {
        let key = AssembleKey::of(&packet.head);
        let entries = &mut self.buckets[Self::bucket_index(&key)];

        let pos = match entries.iter().position(|entry| entry.key == key) {
            Some(pos) => pos,
            None => {
                entries.insert(0, AssembleEntry::new(key));
                0
            }
        };
        let entry = &mut entries[pos];

        // Insertion point: before the first fragment whose start is past
        // ours, so the one before it has prev.start <= packet.start.
        let idx = entry
            .fragments
            .iter()
            .position(|f| f.clip.start > packet.clip.start)
            .unwrap_or(entry.fragments.len());

        // Overlap with the predecessor. prev.start <= packet.start holds, so
        // the ranges overlap iff packet.start < prev.end; the overlapped
        // part comes off the new fragment.
        if idx > 0 {
            let prev = &entry.fragments[idx - 1];
            if packet.clip.start < prev.clip.end {
                if packet.clip.end <= prev.clip.end {
                    return None;
                }
                let from = prev.clip.end;
                let to = packet.clip.end;
                packet.trim(from, to);
            }
        }

        entry.fragments.insert(idx, packet);

        // Sweep the fragments after the insertion point. Every one of them
        // has node.start >= this.start; the new fragment may fill several
        // holes at once.
        let this_start = entry.fragments[idx].clip.start;
        let this_end = entry.fragments[idx].clip.end;
        let next = idx + 1;
        while next < entry.fragments.len() {
            let node = &entry.fragments[next].clip;
            let (node_start, node_end, node_length) = (node.start, node.end, node.length);

            if node_end <= this_end {
                entry.cur_len -= node_length;
                entry.fragments.remove(next);
                continue;
            }

            if node_start < this_end {
                if this_start == node_start {
                    // Equal starts with node_end > this_end: the new
                    // fragment is a strict prefix of one we already have.
                    entry.fragments.remove(idx);
                    return None;
                }
                entry.fragments[idx].trim(this_start, node_start);
            }
            break;
        }

        let (this_length, this_final_end, this_is_last) = {
            let this = &entry.fragments[idx];
            (
                this.clip.length,
                this.clip.end,
                !this.head.flags.more_fragments,
            )
        };
        entry.cur_len += this_length;

        if this_start == 0 {
            // The first fragment can never be displaced from the list once
            // enqueued, so the captured header stays valid.
            debug_assert!(entry.head.is_none());
            entry.head = Some(entry.fragments[idx].head.clone());
            entry.info = Some(entry.fragments[idx].clip.clone());
        }

        if this_is_last && entry.total_len == 0 {
            entry.total_len = this_final_end;
        }

        // All fragments received once the total is known and every byte up
        // to it is covered.
        if entry.total_len != 0 && entry.cur_len >= entry.total_len {
            let entry = entries.remove(pos);
            return entry.finish();
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ControlFlags;
    use crate::link::LinkFlags;
    use crate::packet::{CastType, ClipInfo};

    const DST: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);
    const SRC: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);

    fn frag_for(id: u16, start: u32, more: bool, len: u32, fill: u8) -> Packet {
        assert_eq!(start % 8, 0);
        let head = Ipv4Header {
            ihl: 5,
            type_of_service: 0,
            total_length: (20 + len) as u16,
            identification: id,
            flags: ControlFlags {
                dont_fragment: false,
                more_fragments: more,
            },
            fragment_offset: (start / 8) as u16,
            time_to_live: 64,
            protocol: 17,
            checksum: 0,
            source: SRC,
            destination: DST,
            options: vec![],
        };
        Packet {
            head,
            clip: ClipInfo {
                start,
                end: start + len,
                length: len,
                cast: CastType::LocalHost,
                link_flags: LinkFlags::default(),
                status: RxStatus::Success,
                life: 0,
            },
            body: PacketBuf::new(vec![fill; len as usize]),
        }
    }

    fn frag(start: u32, more: bool, len: u32, fill: u8) -> Packet {
        frag_for(7, start, more, len, fill)
    }

    fn pattern(runs: &[(u8, usize)]) -> Vec<u8> {
        runs.iter()
            .flat_map(|&(fill, count)| std::iter::repeat(fill).take(count))
            .collect()
    }

    #[test]
    fn ordered_fragments() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 1480, b'a')).is_none());
        assert!(table.reassemble(frag(1480, true, 1480, b'b')).is_none());
        let datagram = table.reassemble(frag(2960, false, 40, b'c')).unwrap();

        assert_eq!(datagram.clip.length, 4480);
        assert_eq!(datagram.clip.start, 0);
        assert_eq!(datagram.clip.end, 4480);
        assert_eq!(datagram.body.len(), 4480);
        assert_eq!(
            datagram.body.to_vec(),
            pattern(&[(b'a', 1480), (b'b', 1480), (b'c', 40)])
        );
        // The header is the first fragment's header
        assert_eq!(datagram.head.fragment_offset, 0);
        assert!(datagram.head.flags.more_fragments);
        assert!(table.is_empty());
    }

    #[test]
    fn out_of_order_fragments() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(2960, false, 40, b'c')).is_none());
        assert!(table.reassemble(frag(0, true, 1480, b'a')).is_none());
        let datagram = table.reassemble(frag(1480, true, 1480, b'b')).unwrap();

        assert_eq!(datagram.body.len(), 4480);
        assert_eq!(
            datagram.body.to_vec(),
            pattern(&[(b'a', 1480), (b'b', 1480), (b'c', 40)])
        );
        assert!(table.is_empty());
    }

    #[test]
    fn covered_fragment_is_dropped() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 1000, b'a')).is_none());
        // Entirely within the first fragment's range
        assert!(table.reassemble(frag(504, true, 200, b'b')).is_none());
        let datagram = table.reassemble(frag(1000, false, 500, b'c')).unwrap();

        assert_eq!(datagram.body.len(), 1500);
        assert_eq!(datagram.body.to_vec(), pattern(&[(b'a', 1000), (b'c', 500)]));
    }

    #[test]
    fn wide_fragment_removes_covered_successor() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(504, true, 200, b'b')).is_none());
        // Covers the queued fragment entirely; it is removed on insert
        assert!(table.reassemble(frag(0, true, 1000, b'a')).is_none());
        let datagram = table.reassemble(frag(1000, false, 500, b'c')).unwrap();

        assert_eq!(datagram.body.len(), 1500);
        assert_eq!(datagram.body.to_vec(), pattern(&[(b'a', 1000), (b'c', 500)]));
    }

    #[test]
    fn partial_overlap_head_trims() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 600, b'a')).is_none());
        assert!(table.reassemble(frag(400, true, 600, b'b')).is_none());
        let datagram = table.reassemble(frag(1000, false, 200, b'c')).unwrap();

        // The second fragment was trimmed to [600, 1000)
        assert_eq!(datagram.body.len(), 1200);
        assert_eq!(
            datagram.body.to_vec(),
            pattern(&[(b'a', 600), (b'b', 400), (b'c', 200)])
        );
    }

    #[test]
    fn strict_prefix_of_queued_fragment_is_dropped() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 16, b'a')).is_none());
        assert!(table.reassemble(frag(16, true, 32, b'b')).is_none());
        // Head-trims to [16, 24), which is a strict prefix of the second
        // fragment; the newcomer loses
        assert!(table.reassemble(frag(8, true, 16, b'c')).is_none());
        let datagram = table.reassemble(frag(48, false, 8, b'd')).unwrap();

        assert_eq!(datagram.body.len(), 56);
        assert_eq!(
            datagram.body.to_vec(),
            pattern(&[(b'a', 16), (b'b', 32), (b'd', 8)])
        );
    }

    #[test]
    fn tail_trim_against_successor() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(96, false, 8, b'b')).is_none());
        // Overlaps the queued tail fragment; trimmed to [0, 96)
        let datagram = table.reassemble(frag(0, true, 100, b'a'));
        let datagram = datagram.expect("all bytes covered");

        assert_eq!(datagram.body.len(), 104);
        assert_eq!(datagram.body.to_vec(), pattern(&[(b'a', 96), (b'b', 8)]));
    }

    #[test]
    fn forged_total_length_destroys_entry() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(96, false, 8, b'b')).is_none());
        // Runs past the advertised total and swallows the last fragment;
        // completion notices the mismatch and drops the whole entry
        assert!(table.reassemble(frag(0, true, 112, b'a')).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn short_last_fragment() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 1480, b'a')).is_none());
        let datagram = table.reassemble(frag(1480, false, 99, b'b')).unwrap();
        assert_eq!(datagram.body.len(), 1579);
    }

    #[test]
    fn resent_fragment_after_completion_starts_fresh() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 1480, b'a')).is_none());
        assert!(table.reassemble(frag(1480, false, 40, b'b')).is_some());
        assert!(table.is_empty());

        // A late duplicate opens a new entry that can only age out
        assert!(table.reassemble(frag(1480, false, 40, b'b')).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn keys_are_independent() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag_for(1, 0, true, 64, b'a')).is_none());
        assert!(table.reassemble(frag_for(2, 0, true, 64, b'x')).is_none());
        assert_eq!(table.len(), 2);

        let datagram = table.reassemble(frag_for(1, 64, false, 8, b'b')).unwrap();
        assert_eq!(datagram.body.to_vec(), pattern(&[(b'a', 64), (b'b', 8)]));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn entries_age_out_at_fragment_life() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 1480, b'a')).is_none());
        for _ in 0..FRAGMENT_LIFE - 1 {
            table.tick();
        }
        assert_eq!(table.len(), 1);
        table.tick();
        assert!(table.is_empty());

        // A fragment arriving afterwards starts over
        assert!(table.reassemble(frag(1480, false, 20, b'b')).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn clean_removes_everything() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag_for(1, 0, true, 64, b'a')).is_none());
        assert!(table.reassemble(frag_for(2, 0, true, 64, b'b')).is_none());
        table.clean();
        assert!(table.is_empty());
    }

    #[test]
    fn covered_bytes_accounting() {
        let mut table = AssembleTable::new();
        assert!(table.reassemble(frag(0, true, 600, b'a')).is_none());
        assert!(table.reassemble(frag(400, true, 600, b'b')).is_none());

        let entry = table
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .next()
            .unwrap();
        let covered: u32 = entry.fragments.iter().map(|f| f.clip.length).sum();
        assert_eq!(entry.cur_len, covered);
        assert_eq!(entry.cur_len, 1000);
        // Strictly ordered and non-overlapping after every mutation
        for pair in entry.fragments.windows(2) {
            assert!(pair[0].clip.end <= pair[1].clip.start);
        }
    }
}
