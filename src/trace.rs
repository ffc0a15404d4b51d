//! Minimal JIT trace objects.
//!
//! A trace holds collectable constants that must be kept alive while the
//! trace exists. Traces are owned by the JIT registry, not the root list:
//! the collector marks their constants (through the owning prototype or the
//! in-progress anchor) but never sweeps them.

use std::mem::size_of;
use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};

use crate::error::VmResult;
use crate::func::Proto;
use crate::global::GlobalState;
use crate::header::{GcHeader, Tag};
use crate::mem;

#[repr(C)]
pub struct TraceObj {
    pub head: GcHeader,
    pub kgc: *mut *mut GcHeader,
    pub nkgc: usize,
    /// Next root trace of the same prototype (trace number, 0 = end).
    pub nextroot: u32,
    /// Next side trace attached to this one (trace number, 0 = end).
    pub nextside: u32,
}

/// Registry of compiled traces plus the in-progress anchor. Index 0 is
/// reserved so trace numbers can use 0 as "none".
pub struct JitState {
    pub traces: Vec<*mut TraceObj>,
    pub cur: *mut TraceObj,
    pub aborts: usize,
}

impl JitState {
    pub fn new() -> JitState {
        JitState {
            traces: vec![null_mut()],
            cur: null_mut(),
            aborts: 0,
        }
    }

    #[inline]
    pub fn get(&self, no: u32) -> *mut TraceObj {
        self.traces.get(no as usize).copied().unwrap_or(null_mut())
    }
}

pub unsafe fn new_trace(g: &mut GlobalState, nkgc: usize) -> VmResult<NonNull<TraceObj>> {
    let o = mem::new_obj(g, size_of::<TraceObj>(), Tag::Trace)?;
    let t = o as *mut TraceObj;
    (*t).kgc = null_mut();
    (*t).nkgc = 0;
    (*t).nextroot = 0;
    (*t).nextside = 0;
    if nkgc > 0 {
        let p = mem::realloc(g, null_mut(), 0, nkgc * size_of::<usize>())? as *mut *mut GcHeader;
        std::ptr::write_bytes(p as *mut u8, 0, nkgc * size_of::<usize>());
        (*t).kgc = p;
        (*t).nkgc = nkgc;
    }
    Ok(NonNull::new_unchecked(t))
}

/// Register a finished trace and return its number.
pub unsafe fn register(g: &mut GlobalState, t: *mut TraceObj) -> u32 {
    g.jit.traces.push(t);
    (g.jit.traces.len() - 1) as u32
}

/// Attach a registered trace as a root trace of `pt`.
pub unsafe fn attach_root(pt: *mut Proto, g: &mut GlobalState, no: u32) {
    let t = g.jit.get(no);
    debug_assert!(!t.is_null());
    (*t).nextroot = (*pt).trace;
    (*pt).trace = no;
}

pub unsafe fn free_trace(g: &mut GlobalState, t: *mut TraceObj) {
    if !(*t).kgc.is_null() {
        mem::free(g, (*t).kgc as *mut c_void, (*t).nkgc * size_of::<usize>());
    }
    mem::free(g, t as *mut c_void, size_of::<TraceObj>());
}

/// Discard the in-progress trace. Called when a finalizer runs or when a
/// `__stdcall` fixup invalidates compiled assumptions.
pub fn trace_abort(g: &mut GlobalState) {
    g.jit.cur = null_mut();
    g.jit.aborts += 1;
}
