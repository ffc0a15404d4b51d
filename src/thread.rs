//! Thread (coroutine) objects and upvalues.
//!
//! A thread owns a value stack and a frame record array, both allocated
//! through the facade so they count toward `gc.total`. Open upvalues point
//! into the stack and live in two lists at once: the owning thread's
//! intrusive chain (threaded through the header link, sorted by slot) and
//! the global order list with its sentinel, which the atomic phase walks to
//! re-mark them.

use std::mem::size_of;
use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};

use crate::error::VmResult;
use crate::gc;
use crate::global::GlobalState;
use crate::header::{GcHeader, Tag, White};
use crate::mem;
use crate::table::Table;
use crate::value::Value;

pub const INIT_STACKSIZE: usize = 40;
/// Slack kept above `top` so pushes rarely grow.
pub const STACK_EXTRA: usize = 8;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct Frame {
    /// Stack slot holding the frame's function value.
    pub func_slot: usize,
    pub framesize: usize,
}

#[repr(C)]
pub struct Thread {
    pub head: GcHeader,
    pub global: *mut GlobalState,
    pub stack: *mut Value,
    pub stacksize: usize,
    pub top: usize,
    pub base: usize,
    pub frames: *mut Frame,
    pub nframes: usize,
    pub sizeframes: usize,
    /// Chain of open upvalues via their header link, sorted by descending
    /// stack slot.
    pub openupval: *mut GcHeader,
    pub env: *mut Table,
}

impl Thread {
    pub fn total_size(&self) -> usize {
        size_of::<Thread>()
            + self.stacksize * size_of::<Value>()
            + self.sizeframes * size_of::<Frame>()
    }

    #[inline]
    pub unsafe fn slot(&self, i: usize) -> *mut Value {
        debug_assert!(i < self.stacksize);
        self.stack.add(i)
    }
}

/// Upvalue: open while `v` aims at a live stack slot, closed once the value
/// has been copied into the embedded `tv`.
#[repr(C)]
pub struct Upval {
    pub head: GcHeader,
    pub v: *mut Value,
    pub tv: Value,
    pub closed: bool,
    /// Global order list links (open upvalues only).
    pub prev: *mut Upval,
    pub next: *mut Upval,
}

impl Upval {
    /// Detached header used for the global list sentinel.
    pub fn sentinel() -> Upval {
        Upval {
            head: GcHeader::new(Tag::Upval, White::W0),
            v: null_mut(),
            tv: Value::Nil,
            closed: false,
            prev: null_mut(),
            next: null_mut(),
        }
    }

    #[inline]
    pub unsafe fn value(&self) -> Value {
        *self.v
    }
}

pub unsafe fn new_thread(g: &mut GlobalState, env: *mut Table) -> VmResult<NonNull<Thread>> {
    let o = mem::new_gco(g, size_of::<Thread>(), Tag::Thread)?;
    let th = o as *mut Thread;
    (*th).global = g as *mut GlobalState;
    (*th).stack = null_mut();
    (*th).stacksize = 0;
    (*th).top = 1;
    (*th).base = 1;
    (*th).frames = null_mut();
    (*th).nframes = 0;
    (*th).sizeframes = 0;
    (*th).openupval = null_mut();
    (*th).env = env;
    let stack = mem::realloc(g, null_mut(), 0, INIT_STACKSIZE * size_of::<Value>())? as *mut Value;
    for i in 0..INIT_STACKSIZE {
        stack.add(i).write(Value::Nil);
    }
    (*th).stack = stack;
    (*th).stacksize = INIT_STACKSIZE;
    Ok(NonNull::new_unchecked(th))
}

pub unsafe fn free_thread(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Thread);
    let th = o as *mut Thread;
    close_upvals(g, th, 0);
    if !(*th).stack.is_null() {
        mem::free(
            g,
            (*th).stack as *mut c_void,
            (*th).stacksize * size_of::<Value>(),
        );
    }
    if !(*th).frames.is_null() {
        mem::free(
            g,
            (*th).frames as *mut c_void,
            (*th).sizeframes * size_of::<Frame>(),
        );
    }
    mem::free(g, o as *mut c_void, size_of::<Thread>());
}

/// Grow the stack so at least `need` slots exist above `top`, fixing open
/// upvalue pointers if the array moved.
pub unsafe fn grow_stack(g: &mut GlobalState, th: *mut Thread, need: usize) -> VmResult<()> {
    let want = (*th).top + need + STACK_EXTRA;
    if want <= (*th).stacksize {
        return Ok(());
    }
    let mut nsz = (*th).stacksize * 2;
    if nsz < want {
        nsz = want;
    }
    resize_stack(g, th, nsz)
}

unsafe fn resize_stack(g: &mut GlobalState, th: *mut Thread, nsz: usize) -> VmResult<()> {
    let old = (*th).stack;
    let osz = (*th).stacksize;
    let stack = mem::realloc(
        g,
        old as *mut c_void,
        osz * size_of::<Value>(),
        nsz * size_of::<Value>(),
    )? as *mut Value;
    for i in osz..nsz {
        stack.add(i).write(Value::Nil);
    }
    if stack != old {
        // Retarget open upvalues into the moved array.
        let mut o = (*th).openupval;
        while !o.is_null() {
            let uv = o as *mut Upval;
            let slot = ((*uv).v as usize - old as usize) / size_of::<Value>();
            (*uv).v = stack.add(slot);
            o = (*o).next;
        }
    }
    (*th).stack = stack;
    (*th).stacksize = nsz;
    Ok(())
}

/// Shrink the stack to `lim` live slots (plus slack). Best effort: keeps
/// the old array when the allocator declines.
pub unsafe fn shrink_stack(g: &mut GlobalState, th: *mut Thread, lim: usize) {
    let nsz = (lim + 1 + STACK_EXTRA).max(INIT_STACKSIZE);
    if nsz < (*th).stacksize {
        let _ = resize_stack(g, th, nsz);
    }
}

pub unsafe fn push(g: &mut GlobalState, th: *mut Thread, v: Value) -> VmResult<()> {
    if (*th).top + 1 >= (*th).stacksize {
        grow_stack(g, th, 1)?;
    }
    *(*th).stack.add((*th).top) = v;
    (*th).top += 1;
    Ok(())
}

pub unsafe fn pop(th: *mut Thread) -> Value {
    debug_assert!((*th).top > (*th).base);
    (*th).top -= 1;
    *(*th).stack.add((*th).top)
}

/// Record a call frame whose function value sits in `func_slot`.
pub unsafe fn push_frame(
    g: &mut GlobalState,
    th: *mut Thread,
    func_slot: usize,
    framesize: usize,
) -> VmResult<()> {
    if (*th).nframes == (*th).sizeframes {
        let mut sz = (*th).sizeframes;
        let p = mem::grow(
            g,
            (*th).frames as *mut c_void,
            &mut sz,
            usize::MAX / size_of::<Frame>(),
            size_of::<Frame>(),
        )?;
        (*th).frames = p as *mut Frame;
        (*th).sizeframes = sz;
    }
    *(*th).frames.add((*th).nframes) = Frame {
        func_slot,
        framesize,
    };
    (*th).nframes += 1;
    Ok(())
}

pub unsafe fn pop_frame(th: *mut Thread) {
    debug_assert!((*th).nframes > 0);
    (*th).nframes -= 1;
}

/// Find or create the open upvalue for stack slot `slot`.
pub unsafe fn find_upval(
    g: &mut GlobalState,
    th: *mut Thread,
    slot: usize,
) -> VmResult<NonNull<Upval>> {
    let target = (*th).stack.add(slot);
    let mut p: *mut *mut GcHeader = &mut (*th).openupval;
    while !(*p).is_null() {
        let uv = *p as *mut Upval;
        if (*uv).v == target {
            if (*uv).head.is_dead(g.gc.currentwhite) {
                (*uv).head.make_white(g.gc.currentwhite);
            }
            return Ok(NonNull::new_unchecked(uv));
        }
        if (*uv).v < target {
            break;
        }
        p = &mut (**p).next;
    }
    // Not anchored on the root list while open; the thread chain and the
    // global order list keep it reachable for the collector.
    let o = mem::new_obj(g, size_of::<Upval>(), Tag::Upval)?;
    let uv = o as *mut Upval;
    (*uv).v = target;
    (*uv).tv = Value::Nil;
    (*uv).closed = false;
    (*o).next = *p;
    *p = o;
    let head = &mut g.uvhead as *mut Upval;
    (*uv).next = (*head).next;
    (*uv).prev = head;
    (*(*head).next).prev = uv;
    (*head).next = uv;
    Ok(NonNull::new_unchecked(uv))
}

/// Unlink an open upvalue from the global order list.
pub unsafe fn unlink_upval(uv: *mut Upval) {
    debug_assert!(!(*uv).closed);
    (*(*uv).next).prev = (*uv).prev;
    (*(*uv).prev).next = (*uv).next;
    (*uv).prev = null_mut();
    (*uv).next = null_mut();
}

/// Close every open upvalue at or above stack slot `level`.
pub unsafe fn close_upvals(g: &mut GlobalState, th: *mut Thread, level: usize) {
    let limit = (*th).stack.add(level);
    while !(*th).openupval.is_null() {
        let uv = (*th).openupval as *mut Upval;
        if (*uv).v < limit {
            break;
        }
        (*th).openupval = (*uv).head.next;
        (*uv).head.next = null_mut();
        unlink_upval(uv);
        gc::close_uv(g, uv);
    }
}

/// Free one upvalue object (sweep dispatch). Open upvalues must leave the
/// global order list first.
pub unsafe fn free_upval(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Upval);
    let uv = o as *mut Upval;
    if !(*uv).closed {
        unlink_upval(uv);
    }
    mem::free(g, o as *mut c_void, size_of::<Upval>());
}

/// Store through an upvalue, with the closed-upvalue forward barrier.
pub unsafe fn set_upval(g: &mut GlobalState, uv: *mut Upval, v: Value) {
    *(*uv).v = v;
    if (*uv).closed && (*uv).head.marked.black() {
        if let Some(o) = v.gc() {
            if (*o).marked.is_white() {
                gc::barrier_uv(g, uv);
            }
        }
    }
}
