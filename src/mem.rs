//! Allocator facade.
//!
//! Every byte of managed memory flows through [`realloc`], which delegates
//! to the pluggable `allocf` and keeps `gc.total` equal to the sum of live
//! allocation sizes. Out-of-memory surfaces as [`VmError::OutOfMemory`].

use std::os::raw::c_void;
use std::ptr::null_mut;

use crate::error::{VmError, VmResult};
use crate::global::GlobalState;
use crate::header::{GcHeader, Tag};

/// `realloc`-shaped allocation primitive: `nsz == 0` frees, `osz == 0`
/// allocates, anything else resizes.
pub type AllocF =
    unsafe fn(ud: *mut c_void, ptr: *mut c_void, osz: usize, nsz: usize) -> *mut c_void;

/// Default allocator on top of the C heap.
pub unsafe fn libc_allocf(_ud: *mut c_void, ptr: *mut c_void, _osz: usize, nsz: usize) -> *mut c_void {
    if nsz == 0 {
        libc::free(ptr);
        null_mut()
    } else {
        libc::realloc(ptr, nsz)
    }
}

/// Minimum size of growable vectors, in elements.
pub const MIN_VECSZ: usize = 8;

/// Minimum size of the global scratch buffer, in bytes.
pub const MIN_SBUF: usize = 32;

/// Allocate or resize a fragment through the pluggable allocator.
pub unsafe fn realloc(
    g: &mut GlobalState,
    p: *mut c_void,
    osz: usize,
    nsz: usize,
) -> VmResult<*mut c_void> {
    debug_assert!((osz == 0) == (p.is_null()));
    let p = (g.allocf)(g.allocd, p, osz, nsz);
    if p.is_null() && nsz > 0 {
        return Err(VmError::OutOfMemory);
    }
    debug_assert!((nsz == 0) == (p.is_null()));
    g.gc.total = (g.gc.total - osz) + nsz;
    Ok(p)
}

/// Free a fragment of known size.
pub unsafe fn free(g: &mut GlobalState, p: *mut c_void, osz: usize) {
    // Shrinking to zero cannot fail.
    let _ = realloc(g, p, osz, 0);
}

/// Allocate a new GC object and link it to the root list.
pub unsafe fn new_gco(g: &mut GlobalState, size: usize, tag: Tag) -> VmResult<*mut GcHeader> {
    let o = new_obj(g, size, tag)?;
    (*o).next = g.gc.root;
    g.gc.root = o;
    Ok(o)
}

/// Allocate a new GC object without linking it anywhere. Strings live only
/// in their hash chain, open upvalues in their thread's list, traces in the
/// JIT registry; each of those callers does its own linking.
pub unsafe fn new_obj(g: &mut GlobalState, size: usize, tag: Tag) -> VmResult<*mut GcHeader> {
    debug_assert!(size >= std::mem::size_of::<GcHeader>());
    let o = realloc(g, null_mut(), 0, size)? as *mut GcHeader;
    o.write(GcHeader::new(tag, g.gc.currentwhite));
    Ok(o)
}

/// Double a growable vector, clamped to `lim` elements and to a minimum of
/// [`MIN_VECSZ`]. `szp` is updated to the new element count.
pub unsafe fn grow(
    g: &mut GlobalState,
    p: *mut c_void,
    szp: &mut usize,
    lim: usize,
    esz: usize,
) -> VmResult<*mut c_void> {
    let mut sz = (*szp) << 1;
    if sz < MIN_VECSZ {
        sz = MIN_VECSZ;
    }
    if sz > lim {
        sz = lim;
    }
    let p = realloc(g, p, (*szp) * esz, sz * esz)?;
    *szp = sz;
    Ok(p)
}

/// Growable scratch buffer owned by the global state. The marshaller uses
/// it as a bounce area when coercing aggregates; the sweep phase shrinks it.
pub struct SBuf {
    pub buf: *mut u8,
    pub sz: usize,
}

impl SBuf {
    pub const fn empty() -> SBuf {
        SBuf {
            buf: null_mut(),
            sz: 0,
        }
    }
}

/// Ensure the scratch buffer holds at least `sz` bytes and return it.
pub unsafe fn sbuf_need(g: &mut GlobalState, sz: usize) -> VmResult<*mut u8> {
    if g.tmpbuf.sz < sz {
        let mut nsz = if g.tmpbuf.sz == 0 { MIN_SBUF } else { g.tmpbuf.sz };
        while nsz < sz {
            nsz <<= 1;
        }
        let buf = realloc(g, g.tmpbuf.buf as *mut c_void, g.tmpbuf.sz, nsz)? as *mut u8;
        g.tmpbuf.buf = buf;
        g.tmpbuf.sz = nsz;
    }
    Ok(g.tmpbuf.buf)
}

/// Resize the scratch buffer (shrink path of the sweep phase).
pub unsafe fn sbuf_resize(g: &mut GlobalState, nsz: usize) -> VmResult<()> {
    let buf = realloc(g, g.tmpbuf.buf as *mut c_void, g.tmpbuf.sz, nsz)?;
    g.tmpbuf.buf = buf as *mut u8;
    g.tmpbuf.sz = nsz;
    Ok(())
}

pub unsafe fn sbuf_free(g: &mut GlobalState) {
    if !g.tmpbuf.buf.is_null() {
        free(g, g.tmpbuf.buf as *mut c_void, g.tmpbuf.sz);
        g.tmpbuf.buf = null_mut();
        g.tmpbuf.sz = 0;
    }
}
