use crate::message::Tag;

/// Maximum number of tags a single event carries. Bulk-coalesced tasks
/// (e.g. the FFT of a block of antennas) arrive as one event with up to
/// this many tags.
pub const MAX_EVENT_TAGS: usize = 7;

/// Number of task lanes per parity bucket, one per worker event kind.
pub const NUM_WORK_LANES: usize = 8;

/// The fixed order in which workers poll their task lanes.
pub const WORK_LANE_ORDER: [EventKind; NUM_WORK_LANES] = [
    EventKind::Beam,
    EventKind::Fft,
    EventKind::Decode,
    EventKind::Demul,
    EventKind::Ifft,
    EventKind::Precode,
    EventKind::Encode,
    EventKind::Broadcast,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    PacketRx,
    PacketTx,
    Fft,
    Ifft,
    Beam,
    Demul,
    Decode,
    Encode,
    Precode,
    Broadcast,
    PacketToMac,
    PacketFromMac,
    SnrReport,
    RanUpdate,
}

impl EventKind {
    /// Task-lane index for kinds executed by workers; `None` for
    /// boundary events handled by the master, streamers, or MAC.
    pub fn work_lane(self) -> Option<usize> {
        WORK_LANE_ORDER.iter().position(|k| *k == self)
    }
}

/// A (kind, tags) pair flowing through the fabric by value.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub kind: EventKind,
    num_tags: u8,
    tags: [Tag; MAX_EVENT_TAGS],
}

impl Event {
    pub fn new(kind: EventKind, tag: Tag) -> Event {
        let mut ev = Event::empty(kind);
        ev.push(tag);
        ev
    }

    pub fn empty(kind: EventKind) -> Event {
        Event {
            kind,
            num_tags: 0,
            tags: [Tag::from_raw(0); MAX_EVENT_TAGS],
        }
    }

    pub fn push(&mut self, tag: Tag) {
        assert!((self.num_tags as usize) < MAX_EVENT_TAGS);
        self.tags[self.num_tags as usize] = tag;
        self.num_tags += 1;
    }

    pub fn is_full(&self) -> bool {
        self.num_tags as usize == MAX_EVENT_TAGS
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags[..self.num_tags as usize]
    }

    pub fn tag(&self) -> Tag {
        debug_assert!(self.num_tags > 0);
        self.tags[0]
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesced_tags() {
        let mut ev = Event::empty(EventKind::Fft);
        for ant in 0..4 {
            ev.push(Tag::frm_sym_ant(0, 1, ant));
        }
        assert_eq!(ev.num_tags(), 4);
        assert_eq!(ev.tags()[3].ant(), 3);
        assert!(!ev.is_full());
    }

    #[test]
    fn work_lane_mapping() {
        assert!(EventKind::Fft.work_lane().is_some());
        assert!(EventKind::PacketRx.work_lane().is_none());
        assert!(EventKind::PacketToMac.work_lane().is_none());
        // every lane index is unique and in range
        for (i, kind) in WORK_LANE_ORDER.iter().enumerate() {
            assert_eq!(kind.work_lane(), Some(i));
        }
    }
}
