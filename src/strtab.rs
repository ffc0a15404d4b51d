//! Interned string objects and the global string hash table.
//!
//! Strings are immutable and interned: equal byte sequences share one
//! object, so value equality is pointer identity. A string lives only in
//! its hash chain (threaded through the header link), never on the root
//! list; the sweep phase walks the chains one bucket per step.

use std::hash::Hasher;
use std::mem::size_of;
use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};
use std::slice;

use rustc_hash::FxHasher;

use crate::error::VmResult;
use crate::global::{GcPhase, GlobalState};
use crate::header::{GcHeader, Tag};
use crate::mem;

/// Minimum number of hash chains.
pub const MIN_STRTAB: usize = 16;

/// Interned string. The bytes follow the struct inline, NUL-terminated so
/// the FFI can hand out `const char *` pointers directly.
#[repr(C)]
pub struct Str {
    pub head: GcHeader,
    pub hash: u64,
    pub len: usize,
}

impl Str {
    #[inline]
    pub fn data(&self) -> *const u8 {
        unsafe { (self as *const Str as *const u8).add(size_of::<Str>()) }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data(), self.len) }
    }

    #[inline]
    pub fn total_size(len: usize) -> usize {
        size_of::<Str>() + len + 1
    }
}

/// The global string hash table: an array of intrusive chains.
pub struct StrTab {
    pub chains: *mut *mut GcHeader,
    pub mask: usize,
    pub num: usize,
}

impl StrTab {
    pub const fn empty() -> StrTab {
        StrTab {
            chains: null_mut(),
            mask: 0,
            num: 0,
        }
    }

    #[inline]
    pub unsafe fn chain(&self, i: usize) -> *mut *mut GcHeader {
        debug_assert!(i <= self.mask);
        self.chains.add(i)
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = FxHasher::default();
    h.write(bytes);
    h.finish()
}

/// Allocate the initial chain array.
pub unsafe fn init(g: &mut GlobalState, size: usize) -> VmResult<()> {
    debug_assert!(size.is_power_of_two());
    let chains =
        mem::realloc(g, null_mut(), 0, size * size_of::<*mut GcHeader>())? as *mut *mut GcHeader;
    for i in 0..size {
        chains.add(i).write(null_mut());
    }
    g.strtab.chains = chains;
    g.strtab.mask = size - 1;
    g.strtab.num = 0;
    Ok(())
}

/// Intern a byte string, resurrecting a dead-but-not-yet-swept duplicate if
/// one is found in the chain.
pub unsafe fn new_str(g: &mut GlobalState, bytes: &[u8]) -> VmResult<NonNull<Str>> {
    let h = hash_bytes(bytes);
    let i = (h as usize) & g.strtab.mask;
    let mut o = *g.strtab.chain(i);
    while !o.is_null() {
        let s = o as *mut Str;
        if (*s).hash == h && (*s).as_bytes() == bytes {
            if (*o).is_dead(g.gc.currentwhite) {
                (*o).make_white(g.gc.currentwhite);
            }
            return Ok(NonNull::new_unchecked(s));
        }
        o = (*o).next;
    }

    let o = mem::new_obj(g, Str::total_size(bytes.len()), Tag::Str)?;
    let s = o as *mut Str;
    (*s).hash = h;
    (*s).len = bytes.len();
    let data = (*s).data() as *mut u8;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
    data.add(bytes.len()).write(0);

    (*o).next = *g.strtab.chain(i);
    *g.strtab.chain(i) = o;
    g.strtab.num += 1;
    if g.strtab.num > g.strtab.mask && g.strtab.mask + 1 < (1 << 26) {
        resize(g, ((g.strtab.mask + 1) << 1) - 1)?;
    }
    Ok(NonNull::new_unchecked(s))
}

/// Pin a string so it is never collected (reserved words, event names).
pub unsafe fn fix_str(s: NonNull<Str>) {
    (*s.as_ptr()).head.marked.set_fixed(true);
}

/// Rehash all chains into a table of `newmask + 1` buckets. A resize while
/// the sweep is inside the string table would invalidate the chain cursor,
/// so it is deferred to the next intern in that case.
pub unsafe fn resize(g: &mut GlobalState, newmask: usize) -> VmResult<()> {
    if g.gc.state == GcPhase::SweepString {
        return Ok(());
    }
    debug_assert!((newmask + 1).is_power_of_two());
    let newsize = newmask + 1;
    let newchains =
        mem::realloc(g, null_mut(), 0, newsize * size_of::<*mut GcHeader>())? as *mut *mut GcHeader;
    for i in 0..newsize {
        newchains.add(i).write(null_mut());
    }
    for i in 0..=g.strtab.mask {
        let mut o = *g.strtab.chain(i);
        while !o.is_null() {
            let next = (*o).next;
            let ni = ((*(o as *mut Str)).hash as usize) & newmask;
            (*o).next = *newchains.add(ni);
            *newchains.add(ni) = o;
            o = next;
        }
    }
    mem::free(
        g,
        g.strtab.chains as *mut c_void,
        (g.strtab.mask + 1) * size_of::<*mut GcHeader>(),
    );
    g.strtab.chains = newchains;
    g.strtab.mask = newmask;
    Ok(())
}

/// Free one string object. The sweep has already unlinked it.
pub unsafe fn free_str(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Str);
    g.strtab.num -= 1;
    let len = (*(o as *mut Str)).len;
    mem::free(g, o as *mut c_void, Str::total_size(len));
}

/// Release the chain array itself (runtime teardown).
pub unsafe fn free_table(g: &mut GlobalState) {
    if !g.strtab.chains.is_null() {
        mem::free(
            g,
            g.strtab.chains as *mut c_void,
            (g.strtab.mask + 1) * size_of::<*mut GcHeader>(),
        );
        g.strtab.chains = null_mut();
        g.strtab.mask = 0;
    }
}
