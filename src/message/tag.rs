use std::fmt;

/// Discriminates the inner id of a [`Tag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TagType {
    /// Inner id is an antenna index.
    Antenna = 0,
    /// Inner id is a subcarrier base index.
    Subcarrier = 1,
    /// Inner id is a code-block index.
    CodeBlock = 2,
    /// Inner id is a user (spatial stream) index.
    User = 3,
    /// The tag addresses an RX ring slot: the frame field carries the slot
    /// index and the inner id carries the streamer thread that filled it.
    RxSlot = 4,
    /// No inner id.
    None = 5,
}

/// Compact task descriptor flowing through the fabric by value.
///
/// Bit layout of the packed `u64`:
/// `[0,32)` frame id, `[32,45)` symbol id, `[45,48)` tag type,
/// `[48,64)` inner id (antenna, subcarrier base, code block, or user).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u64);

const SYMBOL_SHIFT: u64 = 32;
const TYPE_SHIFT: u64 = 45;
const INNER_SHIFT: u64 = 48;
const FRAME_MASK: u64 = (1 << SYMBOL_SHIFT) - 1;
const SYMBOL_MASK: u64 = (1 << 13) - 1;
const TYPE_MASK: u64 = (1 << 3) - 1;

impl Tag {
    fn pack(frame: u64, symbol: usize, ty: TagType, inner: usize) -> Tag {
        debug_assert!(frame <= FRAME_MASK);
        debug_assert!((symbol as u64) <= SYMBOL_MASK);
        debug_assert!(inner <= u16::MAX as usize);
        Tag((frame & FRAME_MASK)
            | ((symbol as u64 & SYMBOL_MASK) << SYMBOL_SHIFT)
            | ((ty as u64) << TYPE_SHIFT)
            | ((inner as u64) << INNER_SHIFT))
    }

    pub fn frm_sym(frame: u64, symbol: usize) -> Tag {
        Tag::pack(frame, symbol, TagType::None, 0)
    }

    pub fn frm_sym_ant(frame: u64, symbol: usize, ant: usize) -> Tag {
        Tag::pack(frame, symbol, TagType::Antenna, ant)
    }

    pub fn frm_sym_sc(frame: u64, symbol: usize, sc: usize) -> Tag {
        Tag::pack(frame, symbol, TagType::Subcarrier, sc)
    }

    pub fn frm_sym_cb(frame: u64, symbol: usize, cb: usize) -> Tag {
        Tag::pack(frame, symbol, TagType::CodeBlock, cb)
    }

    pub fn frm_sym_ue(frame: u64, symbol: usize, ue: usize) -> Tag {
        Tag::pack(frame, symbol, TagType::User, ue)
    }

    pub fn rx_slot(tid: usize, slot: usize) -> Tag {
        Tag::pack(slot as u64, 0, TagType::RxSlot, tid)
    }

    pub fn from_raw(raw: u64) -> Tag {
        Tag(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn frame(self) -> u64 {
        self.0 & FRAME_MASK
    }

    pub fn symbol(self) -> usize {
        ((self.0 >> SYMBOL_SHIFT) & SYMBOL_MASK) as usize
    }

    pub fn tag_type(self) -> TagType {
        match (self.0 >> TYPE_SHIFT) & TYPE_MASK {
            0 => TagType::Antenna,
            1 => TagType::Subcarrier,
            2 => TagType::CodeBlock,
            3 => TagType::User,
            4 => TagType::RxSlot,
            _ => TagType::None,
        }
    }

    pub fn inner(self) -> usize {
        (self.0 >> INNER_SHIFT) as usize
    }

    pub fn ant(self) -> usize {
        debug_assert_eq!(self.tag_type(), TagType::Antenna);
        self.inner()
    }

    pub fn sc(self) -> usize {
        debug_assert_eq!(self.tag_type(), TagType::Subcarrier);
        self.inner()
    }

    pub fn cb(self) -> usize {
        debug_assert_eq!(self.tag_type(), TagType::CodeBlock);
        self.inner()
    }

    pub fn ue(self) -> usize {
        debug_assert_eq!(self.tag_type(), TagType::User);
        self.inner()
    }

    /// RX ring slot index. Valid only for [`TagType::RxSlot`] tags.
    pub fn slot(self) -> usize {
        debug_assert_eq!(self.tag_type(), TagType::RxSlot);
        self.frame() as usize
    }

    /// Streamer thread id. Valid only for [`TagType::RxSlot`] tags.
    pub fn tid(self) -> usize {
        debug_assert_eq!(self.tag_type(), TagType::RxSlot);
        self.inner()
    }

    /// Advance the inner id, keeping frame, symbol, and type.
    pub fn with_inner(self, inner: usize) -> Tag {
        Tag::pack(self.frame(), self.symbol(), self.tag_type(), inner)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tag_type() == TagType::RxSlot {
            write!(f, "Tag(rx tid {} slot {})", self.tid(), self.slot())
        } else {
            write!(
                f,
                "Tag(frame {} sym {} {:?} {})",
                self.frame(),
                self.symbol(),
                self.tag_type(),
                self.inner()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let t = Tag::frm_sym_ant(1234, 17, 63);
        assert_eq!(t.frame(), 1234);
        assert_eq!(t.symbol(), 17);
        assert_eq!(t.tag_type(), TagType::Antenna);
        assert_eq!(t.ant(), 63);
    }

    #[test]
    fn field_limits() {
        let t = Tag::frm_sym_sc(u32::MAX as u64, 8191, u16::MAX as usize);
        assert_eq!(t.frame(), u32::MAX as u64);
        assert_eq!(t.symbol(), 8191);
        assert_eq!(t.sc(), u16::MAX as usize);
    }

    #[test]
    fn rx_slot_fields() {
        let t = Tag::rx_slot(3, 4096);
        assert_eq!(t.tag_type(), TagType::RxSlot);
        assert_eq!(t.tid(), 3);
        assert_eq!(t.slot(), 4096);
    }

    #[test]
    fn with_inner_keeps_frame_and_symbol() {
        let t = Tag::frm_sym_cb(9, 3, 0).with_inner(5);
        assert_eq!(t.frame(), 9);
        assert_eq!(t.symbol(), 3);
        assert_eq!(t.cb(), 5);
    }
}
