//! Uniform header prepended to every collectable heap object.
//!
//! The header carries the type tag, the packed mark byte and two intrusive
//! links: `next` threads the object through the global root list (or a hash
//! chain for strings, or a thread's open-upvalue list), `gclist` threads it
//! through whichever worklist (gray, gray-again, weak) it is currently
//! queued on.

use modular_bitfield::prelude::*;
use std::mem::size_of;
use std::ptr::null_mut;

// Mark byte layout:
//
// +-----------+------+----------------------------------------------+
// | name      | bits |                                              |
// +-----------+------+----------------------------------------------+
// | white0    |    1 | Object carries white of parity 0.            |
// | white1    |    1 | Object carries white of parity 1.            |
// | black     |    1 | Fully traversed this cycle.                  |
// | fixed     |    1 | Never collected (reserved strings).          |
// | sfixed    |    1 | Not collected even at shutdown (main thread).|
// | finalized |    1 | Userdata: __gc already separated/ran.        |
// | weak_key  |    1 | Table: keys are weak.                        |
// | weak_val  |    1 | Table: values are weak.                      |
// +-----------+------+----------------------------------------------+
//
// No color bit set means gray. The two whites alternate between cycles:
// only objects still carrying the *other* white are dead at sweep time.
#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
pub struct Marked {
    pub white0: bool,
    pub white1: bool,
    pub black: bool,
    pub fixed: bool,
    pub sfixed: bool,
    pub finalized: bool,
    pub weak_key: bool,
    pub weak_val: bool,
}

static_assertions::const_assert_eq!(size_of::<Marked>(), 1);

/// Identity of the current white. Flipped in the atomic phase.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum White {
    W0,
    W1,
}

impl White {
    #[inline]
    pub fn other(self) -> White {
        match self {
            White::W0 => White::W1,
            White::W1 => White::W0,
        }
    }
}

impl Marked {
    #[inline]
    pub fn has_white(self, w: White) -> bool {
        match w {
            White::W0 => self.white0(),
            White::W1 => self.white1(),
        }
    }

    #[inline]
    pub fn is_white(self) -> bool {
        self.white0() || self.white1()
    }

    #[inline]
    pub fn is_gray(self) -> bool {
        !self.is_white() && !self.black()
    }

    #[inline]
    pub fn is_weak(self) -> bool {
        self.weak_key() || self.weak_val()
    }
}

/// Object type tags. The order indexes the per-type free dispatch table.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tag {
    Str = 0,
    Upval = 1,
    Thread = 2,
    Proto = 3,
    Func = 4,
    Table = 5,
    Udata = 6,
    Cdata = 7,
    Trace = 8,
}

pub const TAG_COUNT: usize = 9;

/// Header prefix shared by all collectable objects. Every object struct is
/// `repr(C)` with this as its first field, so a `*mut GcHeader` can be cast
/// to the concrete type after inspecting `tag`.
#[repr(C)]
pub struct GcHeader {
    pub next: *mut GcHeader,
    pub gclist: *mut GcHeader,
    pub marked: Marked,
    pub tag: Tag,
}

impl GcHeader {
    /// Fresh header stamped with the current white of the collector.
    pub fn new(tag: Tag, cur: White) -> GcHeader {
        let mut marked = Marked::new();
        match cur {
            White::W0 => marked.set_white0(true),
            White::W1 => marked.set_white1(true),
        }
        GcHeader {
            next: null_mut(),
            gclist: null_mut(),
            marked,
            tag,
        }
    }

    /// White -> gray: clear both white bits, leave black unset.
    #[inline]
    pub fn white_to_gray(&mut self) {
        self.marked.set_white0(false);
        self.marked.set_white1(false);
    }

    #[inline]
    pub fn gray_to_black(&mut self) {
        self.marked.set_black(true);
    }

    #[inline]
    pub fn black_to_gray(&mut self) {
        self.marked.set_black(false);
    }

    /// Recolor to the current white, clearing black. Used by the sweep for
    /// surviving objects and by barriers that re-whiten a source.
    #[inline]
    pub fn make_white(&mut self, cur: White) {
        self.marked.set_white0(cur == White::W0);
        self.marked.set_white1(cur == White::W1);
        self.marked.set_black(false);
    }

    /// Dead means: still carrying the other white (and not resurrected).
    #[inline]
    pub fn is_dead(&self, cur: White) -> bool {
        self.marked.has_white(cur.other())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_transitions() {
        let mut h = GcHeader::new(Tag::Table, White::W0);
        assert!(h.marked.is_white());
        assert!(!h.is_dead(White::W0));
        assert!(h.is_dead(White::W1));

        h.white_to_gray();
        assert!(h.marked.is_gray());

        h.gray_to_black();
        assert!(h.marked.black());

        h.make_white(White::W1);
        assert!(h.marked.has_white(White::W1));
        assert!(!h.marked.black());
    }

    #[test]
    fn weak_bits_do_not_affect_color() {
        let mut h = GcHeader::new(Tag::Table, White::W0);
        h.marked.set_weak_key(true);
        h.marked.set_weak_val(true);
        assert!(h.marked.is_white());
        h.white_to_gray();
        assert!(h.marked.is_gray());
        assert!(h.marked.is_weak());
    }
}
