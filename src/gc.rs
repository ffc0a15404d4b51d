//! Incremental tri-color garbage collector.
//!
//! The cycle is pause -> propagate -> (atomic) -> sweep-strings -> sweep ->
//! finalize -> pause. Each [`step`] performs a bounded amount of work; only
//! the atomic phase runs to completion. Write barriers keep the tri-color
//! invariant intact while the mutator runs between steps.

use std::ptr::null_mut;

use crate::error::{VmError, VmResult};
use crate::func::{self, Func, FuncKind, Proto};
use crate::global::{formatted_size, GcPhase, GlobalState, Mm, VmPhase, GCROOT_MAX, HOOK_GC};
use crate::header::{GcHeader, Tag, TAG_COUNT};
use crate::mem;
use crate::strtab;
use crate::table::{self, Table};
use crate::thread::{self, Thread, Upval};
use crate::trace::{self, TraceObj};
use crate::udata::{self, Udata};
use crate::value::Value;

pub const STEPSIZE: usize = 1024;
pub const SWEEPMAX: usize = 40;
pub const SWEEPCOST: usize = 10;
pub const FINALIZECOST: usize = 100;

/// Threshold value that effectively disables GC steps.
pub const MAX_THRESHOLD: usize = usize::MAX / 2;

/// Per-type free functions, indexed by [`Tag`]. Each is called exactly once
/// per freed object.
type FreeFn = unsafe fn(&mut GlobalState, *mut GcHeader);

unsafe fn free_trace_unreachable(_g: &mut GlobalState, _o: *mut GcHeader) {
    // Traces never enter the root list; the JIT registry owns them.
    debug_assert!(false, "trace reached the sweep");
}

const FREE_FUNCS: [FreeFn; TAG_COUNT] = [
    strtab::free_str,
    thread::free_upval,
    thread::free_thread,
    func::free_proto,
    func::free_func,
    table::free,
    udata::free_udata,
    udata::free_cdata,
    free_trace_unreachable,
];

// -- Mark phase ----------------------------------------------------------

/// Mark a white object. Strings just lose their white; userdata and closed
/// upvalues blacken immediately; everything else queues on the gray list.
unsafe fn mark(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).marked.is_white() && !(*o).is_dead(g.gc.currentwhite));
    (*o).white_to_gray();
    match (*o).tag {
        Tag::Str | Tag::Cdata => {
            // Leaves: no outgoing references to propagate.
            (*o).gray_to_black();
        }
        Tag::Udata => {
            (*o).gray_to_black(); // Userdata are never gray.
            let ud = o as *mut Udata;
            let mt = (*ud).metatable;
            if !mt.is_null() {
                mark_obj(g, mt as *mut GcHeader);
            }
            if !(*ud).env.is_null() {
                mark_obj(g, (*ud).env as *mut GcHeader);
            }
        }
        Tag::Upval => {
            let uv = o as *mut Upval;
            mark_value(g, (*uv).value());
            if (*uv).closed {
                (*o).gray_to_black(); // Closed upvalues are never gray.
            }
        }
        Tag::Trace => {
            (*o).gray_to_black();
            traverse_trace(g, o as *mut TraceObj);
        }
        Tag::Func | Tag::Table | Tag::Thread | Tag::Proto => {
            (*o).gclist = g.gc.gray;
            g.gc.gray = o;
        }
    }
}

#[inline]
unsafe fn mark_obj(g: &mut GlobalState, o: *mut GcHeader) {
    if (*o).marked.is_white() {
        mark(g, o);
    }
}

#[inline]
unsafe fn mark_value(g: &mut GlobalState, v: Value) {
    if let Some(o) = v.gc() {
        if (*o).marked.is_white() {
            mark(g, o);
        }
    }
}

unsafe fn mark_gcroot(g: &mut GlobalState) {
    for i in 0..GCROOT_MAX {
        mark_value(g, g.gcroot[i]);
    }
}

/// Start a cycle: clear the worklists and mark the root set.
unsafe fn mark_start(g: &mut GlobalState) {
    g.gc.gray = null_mut();
    g.gc.grayagain = null_mut();
    g.gc.weak = null_mut();
    let main = g.mainthread;
    mark_obj(g, main as *mut GcHeader);
    if !(*main).env.is_null() {
        mark_obj(g, (*main).env as *mut GcHeader);
    }
    mark_value(g, g.registry);
    mark_gcroot(g);
    g.gc.state = GcPhase::Propagate;
}

/// Re-mark open upvalues; the holding thread may already be dead.
unsafe fn mark_uv(g: &mut GlobalState) {
    let head = &mut g.uvhead as *mut Upval;
    let mut uv = (*head).next;
    while uv != head {
        debug_assert!((*(*uv).next).prev == uv && (*(*uv).prev).next == uv);
        if (*uv).head.marked.is_gray() {
            let v = (*uv).value();
            mark_value(g, v);
        }
        uv = (*uv).next;
    }
}

/// Mark everything on the finalizer ring (entries can be left over from a
/// previous cycle).
unsafe fn mark_mmudata(g: &mut GlobalState) {
    let root = g.gc.mmudata;
    if root.is_null() {
        return;
    }
    let mut u = root;
    loop {
        u = (*u).next;
        (*u).make_white(g.gc.currentwhite);
        mark(g, u);
        if u == root {
            break;
        }
    }
}

/// Move userdata that needs finalization from the main thread's chain onto
/// the `mmudata` ring. Returns the byte total of separated objects.
pub unsafe fn separate_udata(g: &mut GlobalState, all: bool) -> usize {
    let mut m = 0usize;
    let mut p: *mut *mut GcHeader = &mut (*(g.mainthread as *mut GcHeader)).next;
    loop {
        let o = *p;
        if o.is_null() {
            break;
        }
        debug_assert!((*o).tag == Tag::Udata);
        let ud = o as *mut Udata;
        if !((*o).marked.is_white() || all) || (*o).marked.finalized() {
            p = &mut (*o).next; // Nothing to do.
        } else if g.meta_fast((*ud).metatable, Mm::Gc).is_nil() {
            // No __gc: flag it so this chain walk never reconsiders it.
            (*o).marked.set_finalized(true);
            p = &mut (*o).next;
        } else {
            m += Udata::total_size((*ud).len);
            (*o).marked.set_finalized(true);
            *p = (*o).next;
            if !g.gc.mmudata.is_null() {
                // Link to the end of the circular list.
                let root = g.gc.mmudata;
                (*o).next = (*root).next;
                (*root).next = o;
                g.gc.mmudata = o;
            } else {
                (*o).next = o;
                g.gc.mmudata = o;
            }
        }
    }
    m
}

// -- Propagation phase ---------------------------------------------------

/// Traverse a table; returns true when the table is weak (and must stay
/// gray until the atomic phase clears it).
unsafe fn traverse_tab(g: &mut GlobalState, t: *mut Table) -> bool {
    let mt = (*t).metatable;
    if !mt.is_null() {
        mark_obj(g, mt as *mut GcHeader);
    }
    let mut weak_key = false;
    let mut weak_val = false;
    if let Value::Str(mode) = g.meta_fast(mt, Mm::Mode) {
        for &c in (*mode.as_ptr()).as_bytes() {
            if c == b'k' {
                weak_key = true;
            } else if c == b'v' {
                weak_val = true;
            }
        }
        if weak_key || weak_val {
            // Weak tables are cleared in the atomic phase.
            (*t).head.marked.set_weak_key(weak_key);
            (*t).head.marked.set_weak_val(weak_val);
            (*t).head.gclist = g.gc.weak;
            g.gc.weak = t as *mut GcHeader;
        }
    }
    if weak_key && weak_val {
        return true; // Nothing to mark if both sides are weak.
    }
    if !weak_val {
        for i in 0..(*t).asize {
            let v = *(*t).array_slot(i);
            mark_value(g, v);
        }
    }
    if !(*t).node.is_null() {
        for i in 0..=(*t).hmask {
            let n = (*t).node_slot(i);
            if !(*n).val.is_nil() {
                debug_assert!(!(*n).key.is_nil());
                if !weak_key {
                    let k = (*n).key;
                    mark_value(g, k);
                }
                if !weak_val {
                    let v = (*n).val;
                    mark_value(g, v);
                }
            } else if (*n).key.is_gc() {
                // Leave the key in, but mark it dead for reuse.
                (*n).key = Value::DeadKey;
            }
        }
    }
    weak_key || weak_val
}

unsafe fn traverse_func(g: &mut GlobalState, f: *mut Func) {
    if !(*f).env.is_null() {
        mark_obj(g, (*f).env as *mut GcHeader);
    }
    match (*f).kind {
        FuncKind::Vm {
            proto,
            upvals,
            nupvals,
        } => {
            mark_obj(g, proto as *mut GcHeader);
            for i in 0..nupvals {
                let uv = *upvals.add(i);
                if !uv.is_null() {
                    mark_obj(g, uv as *mut GcHeader);
                }
            }
        }
        FuncKind::Native {
            upvals, nupvals, ..
        } => {
            for i in 0..nupvals {
                let v = *upvals.add(i);
                mark_value(g, v);
            }
        }
    }
}

unsafe fn traverse_trace(g: &mut GlobalState, t: *mut TraceObj) {
    for i in 0..(*t).nkgc {
        let o = *(*t).kgc.add(i);
        if !o.is_null() {
            mark_obj(g, o);
        }
    }
}

unsafe fn traverse_proto(g: &mut GlobalState, pt: *mut Proto) {
    // Mark all root traces and attached side traces.
    let mut root = (*pt).trace;
    while root != 0 {
        let rt = g.jit.get(root);
        if rt.is_null() {
            break;
        }
        let mut side = (*rt).nextside;
        while side != 0 {
            let st = g.jit.get(side);
            if st.is_null() {
                break;
            }
            traverse_trace(g, st);
            side = (*st).nextside;
        }
        traverse_trace(g, rt);
        root = (*rt).nextroot;
    }
    // GC during prototype creation can leave null fields behind.
    if !(*pt).chunkname.is_null() {
        mark_obj(g, (*pt).chunkname as *mut GcHeader);
    }
    for i in 0..(*pt).sizekgc {
        let o = *(*pt).kgc.add(i);
        if !o.is_null() {
            mark_obj(g, o);
        }
    }
    for i in 0..(*pt).sizeuvname {
        let s = *(*pt).uvnames.add(i);
        if !s.is_null() {
            mark_obj(g, s as *mut GcHeader);
        }
    }
    for i in 0..(*pt).sizevarinfo {
        let s = *(*pt).varnames.add(i);
        if !s.is_null() {
            mark_obj(g, s as *mut GcHeader);
        }
    }
}

/// Walk the frame records, marking each frame's function, and return the
/// maximum frame extent.
unsafe fn traverse_frames(g: &mut GlobalState, th: *mut Thread) -> usize {
    let mut lim = (*th).top;
    for i in 0..(*th).nframes {
        let f = *(*th).frames.add(i);
        let fv = *(*th).slot(f.func_slot);
        mark_value(g, fv);
        let ftop = f.func_slot + f.framesize;
        if ftop > lim {
            lim = ftop;
        }
    }
    if lim > (*th).stacksize {
        lim = (*th).stacksize;
    }
    lim
}

unsafe fn traverse_thread(g: &mut GlobalState, th: *mut Thread) {
    if !(*th).env.is_null() {
        mark_obj(g, (*th).env as *mut GcHeader);
    }
    for i in 1..(*th).top {
        let v = *(*th).slot(i);
        mark_value(g, v);
    }
    let lim = traverse_frames(g, th);
    // Clear slots between the live top and the maximum frame extent, so a
    // dead value cannot be resurrected when a larger frame re-enters.
    for i in (*th).top..lim {
        *(*th).slot(i) = Value::Nil;
    }
    thread::shrink_stack(g, th, lim);
}

/// Propagate one gray object: turn it black and traverse it. Returns a
/// cost estimate proportional to the object's size.
unsafe fn propagate_mark(g: &mut GlobalState) -> usize {
    let o = g.gc.gray;
    debug_assert!((*o).marked.is_gray());
    (*o).gray_to_black();
    g.gc.gray = (*o).gclist; // Remove from gray list.
    match (*o).tag {
        Tag::Table => {
            let t = o as *mut Table;
            if traverse_tab(g, t) {
                (*o).black_to_gray(); // Keep weak tables gray.
            }
            (*t).total_size()
        }
        Tag::Func => {
            let f = o as *mut Func;
            traverse_func(g, f);
            (*f).total_size()
        }
        Tag::Proto => {
            let pt = o as *mut Proto;
            traverse_proto(g, pt);
            (*pt).total_size()
        }
        Tag::Thread => {
            let th = o as *mut Thread;
            // Threads are re-traversed in the atomic phase and never stay
            // black: their stack mutates without barriers.
            (*o).gclist = g.gc.grayagain;
            g.gc.grayagain = o;
            (*o).black_to_gray();
            traverse_thread(g, th);
            (*th).total_size()
        }
        _ => {
            debug_assert!(false, "non-traversable object on gray list");
            0
        }
    }
}

unsafe fn propagate_gray(g: &mut GlobalState) -> usize {
    let mut m = 0;
    while !g.gc.gray.is_null() {
        m += propagate_mark(g);
    }
    m
}

// -- Sweep phase ---------------------------------------------------------

/// Partial sweep of an intrusive list. Walks at most `lim` objects from the
/// cursor `p`, freeing everything still carrying the other white.
unsafe fn sweep(
    g: &mut GlobalState,
    mut p: *mut *mut GcHeader,
    mut lim: usize,
    shutdown: bool,
) -> *mut *mut GcHeader {
    let cur = g.gc.currentwhite;
    loop {
        let o = *p;
        if o.is_null() || lim == 0 {
            break;
        }
        lim -= 1;
        if (*o).tag == Tag::Thread {
            // Open upvalues are anchored per thread; sweep them fully first.
            let th = o as *mut Thread;
            full_sweep(g, &mut (*th).openupval, shutdown);
        }
        let alive = if shutdown {
            (*o).marked.sfixed()
        } else {
            !(*o).is_dead(cur) || (*o).marked.fixed()
        };
        if alive {
            debug_assert!(shutdown || !(*o).is_dead(cur) || (*o).marked.fixed());
            (*o).make_white(cur);
            p = &mut (*o).next;
        } else {
            *p = (*o).next;
            if o == g.gc.root {
                g.gc.root = (*o).next; // Adjust list anchor.
            }
            FREE_FUNCS[(*o).tag as usize](g, o);
        }
    }
    p
}

unsafe fn full_sweep(g: &mut GlobalState, p: *mut *mut GcHeader, shutdown: bool) {
    sweep(g, p, usize::MAX, shutdown);
}

/// Can a weak-table slot referencing `v` be cleared? Strings are never weak
/// references and get marked instead.
unsafe fn may_clear(g: &mut GlobalState, v: Value, is_val: bool) -> bool {
    match v {
        Value::Str(s) => {
            mark_obj(g, s.as_ptr() as *mut GcHeader);
            false
        }
        _ => {
            if let Some(o) = v.gc() {
                if (*o).marked.is_white() {
                    return true; // About to be collected.
                }
                if is_val && (*o).tag == Tag::Udata && (*o).marked.finalized() {
                    return true; // Finalized userdata drops out of values.
                }
            }
            false
        }
    }
}

/// Clear collected entries from all tables on the weak list.
unsafe fn clear_weak(g: &mut GlobalState, mut o: *mut GcHeader) {
    while !o.is_null() {
        let t = o as *mut Table;
        debug_assert!((*o).marked.is_weak());
        if (*o).marked.weak_val() {
            for i in 0..(*t).asize {
                let slot = (*t).array_slot(i);
                let v = *slot;
                if may_clear(g, v, true) {
                    *slot = Value::Nil;
                }
            }
        }
        if !(*t).node.is_null() {
            for i in 0..=(*t).hmask {
                let n = (*t).node_slot(i);
                let (k, v) = ((*n).key, (*n).val);
                if !v.is_nil() && (may_clear(g, k, false) || may_clear(g, v, true)) {
                    (*n).val = Value::Nil;
                    if k.is_gc() {
                        (*n).key = Value::DeadKey;
                    }
                }
            }
        }
        o = (*t).head.gclist;
    }
}

/// Shrink the string table and the scratch buffer when they run mostly
/// empty. Called once per sweep at the end of the root list.
unsafe fn shrink(g: &mut GlobalState) -> VmResult<()> {
    if g.strtab.num <= (g.strtab.mask >> 2) && g.strtab.mask > strtab::MIN_STRTAB * 2 - 1 {
        strtab::resize(g, g.strtab.mask >> 1)?;
    }
    if g.tmpbuf.sz > mem::MIN_SBUF * 2 {
        mem::sbuf_resize(g, g.tmpbuf.sz >> 1)?;
    }
    Ok(())
}

// -- Finalizers ----------------------------------------------------------

/// Detach the head of the finalizer ring and run its `__gc` metamethod
/// under a protected call.
unsafe fn finalize_one(g: &mut GlobalState, l: *mut Thread) -> VmResult<()> {
    let root = g.gc.mmudata;
    debug_assert!(!root.is_null());
    let o = (*root).next;
    // Unchain from the ring.
    if o == root {
        g.gc.mmudata = null_mut();
    } else {
        (*root).next = (*o).next;
    }
    // Back onto the main userdata chain, freshly whitened: the object stays
    // alive for one more cycle and is swept normally afterwards.
    let main = g.mainthread as *mut GcHeader;
    (*o).next = (*main).next;
    (*main).next = o;
    (*o).make_white(g.gc.currentwhite);

    let ud = o as *mut Udata;
    let mo = g.meta_fast((*ud).metatable, Mm::Gc);
    let f = match mo {
        Value::Nil => return Ok(()),
        Value::Func(f) => f.as_ptr(),
        _ => return Err(VmError::BadFinalizer),
    };
    let nf = match (*f).kind {
        FuncKind::Native { f: nf, .. } => nf,
        FuncKind::Vm { .. } => return Err(VmError::BadFinalizer),
    };
    // The callback may allocate, call foreign code or error: save hook
    // state, threshold and the JIT anchor, and restore all of it after.
    let oldh = g.hookmask;
    let oldt = g.gc.threshold;
    let oldcur = g.jit.cur;
    trace::trace_abort(g);
    g.hookmask = HOOK_GC;
    g.gc.threshold = MAX_THRESHOLD; // No recursive GC steps.
    let ret = nf(g, l, Value::Udata(std::ptr::NonNull::new_unchecked(ud)));
    g.hookmask = oldh;
    g.gc.threshold = oldt;
    g.jit.cur = oldcur;
    ret.map_err(|e| VmError::Finalizer(Box::new(e)))
}

/// Drain the finalizer ring completely (shutdown path).
pub unsafe fn finalize_all(g: &mut GlobalState, l: *mut Thread) -> VmResult<()> {
    while !g.gc.mmudata.is_null() {
        finalize_one(g, l)?;
    }
    Ok(())
}

/// Shutdown sweep: free every object except those pinned for shutdown.
pub unsafe fn free_all(g: &mut GlobalState) {
    let root: *mut *mut GcHeader = &mut g.gc.root;
    full_sweep(g, root, true);
    for i in 0..=g.strtab.mask {
        let chain = g.strtab.chain(i);
        full_sweep(g, chain, true);
    }
}

// -- Collector state machine ---------------------------------------------

/// Atomic part of the cycle: finish marking, separate finalizable userdata,
/// clear weak tables and flip the white.
unsafe fn atomic(g: &mut GlobalState, l: *mut Thread) {
    mark_uv(g); // Re-mark open upvalues; the thread may be dead.
    propagate_gray(g);

    // Weak tables re-enter the gray list for final marking of their strong
    // sides.
    g.gc.gray = g.gc.weak;
    g.gc.weak = null_mut();
    debug_assert!(!(*(g.mainthread as *mut GcHeader)).marked.is_white());
    mark_obj(g, l as *mut GcHeader);
    if !g.jit.cur.is_null() {
        let cur = g.jit.cur;
        traverse_trace(g, cur); // The in-progress trace is a GC root.
    }
    mark_gcroot(g);
    propagate_gray(g);

    // Second-chance list: threads and backward-barriered tables.
    g.gc.gray = g.gc.grayagain;
    g.gc.grayagain = null_mut();
    propagate_gray(g);

    let mut udsize = separate_udata(g, false);
    mark_mmudata(g);
    udsize += propagate_gray(g);

    let weak = g.gc.weak;
    clear_weak(g, weak);

    // Prepare for the sweep phase.
    g.gc.currentwhite = g.gc.currentwhite.other();
    g.gc.sweepstr = 0;
    g.gc.sweep = &mut g.gc.root;
    g.gc.state = GcPhase::SweepString;
    g.gc.estimate = g.gc.total.saturating_sub(udsize);
}

/// Execute one state transition's worth of work; returns its cost.
unsafe fn one_step(g: &mut GlobalState, l: *mut Thread) -> VmResult<usize> {
    match g.gc.state {
        GcPhase::Pause => {
            mark_start(g); // New cycle: mark the GC roots.
            Ok(0)
        }
        GcPhase::Propagate => {
            if !g.gc.gray.is_null() {
                Ok(propagate_mark(g))
            } else {
                atomic(g, l); // End of mark phase.
                Ok(0)
            }
        }
        GcPhase::SweepString => {
            let old = g.gc.total;
            let chain = g.strtab.chain(g.gc.sweepstr);
            full_sweep(g, chain, false); // Sweep one chain.
            g.gc.sweepstr += 1;
            if g.gc.sweepstr > g.strtab.mask {
                g.gc.state = GcPhase::Sweep; // All string chains done.
            }
            debug_assert!(old >= g.gc.total);
            g.gc.estimate = g.gc.estimate.saturating_sub(old - g.gc.total);
            Ok(SWEEPCOST)
        }
        GcPhase::Sweep => {
            let old = g.gc.total;
            let p = g.gc.sweep;
            g.gc.sweep = sweep(g, p, SWEEPMAX, false);
            if (*g.gc.sweep).is_null() {
                shrink(g)?;
                g.gc.state = GcPhase::Finalize; // End of sweep phase.
            }
            debug_assert!(old >= g.gc.total);
            g.gc.estimate = g.gc.estimate.saturating_sub(old - g.gc.total);
            Ok(SWEEPMAX * SWEEPCOST)
        }
        GcPhase::Finalize => {
            if !g.gc.mmudata.is_null() {
                finalize_one(g, l)?;
                g.gc.estimate = g.gc.estimate.saturating_sub(FINALIZECOST);
                Ok(FINALIZECOST)
            } else {
                g.gc.state = GcPhase::Pause; // End of cycle.
                g.gc.debt = 0;
                Ok(0)
            }
        }
    }
}

/// Perform a bounded amount of incremental GC work. Returns 1 when this
/// call finished a full cycle.
pub unsafe fn step(g: &mut GlobalState, l: *mut Thread) -> VmResult<i32> {
    let ostate = g.vmstate;
    g.vmstate = VmPhase::Gc;
    let mut lim = (STEPSIZE / 100) * g.gc.stepmul;
    if lim == 0 {
        lim = usize::MAX;
    }
    g.gc.debt += g.gc.total.saturating_sub(g.gc.threshold);
    loop {
        let cost = one_step(g, l).map_err(|e| {
            g.vmstate = ostate;
            e
        })?;
        if g.gc.state == GcPhase::Pause {
            debug_assert!(g.gc.total >= g.gc.estimate);
            g.gc.threshold = (g.gc.estimate / 100) * g.gc.pause;
            g.vmstate = ostate;
            return Ok(1); // Finished a GC cycle.
        }
        lim = lim.saturating_sub(cost);
        if lim == 0 {
            break;
        }
    }
    if g.gc.debt < STEPSIZE {
        g.gc.threshold = g.gc.total + STEPSIZE;
    } else {
        g.gc.debt -= STEPSIZE;
        g.gc.threshold = g.gc.total;
    }
    g.vmstate = ostate;
    Ok(0)
}

/// Run up to `n` steps, stopping early when a cycle completes.
pub unsafe fn steps(g: &mut GlobalState, l: *mut Thread, n: usize) -> VmResult<()> {
    for _ in 0..n {
        if step(g, l)? != 0 {
            break;
        }
    }
    Ok(())
}

/// Allocation checkpoint: step when the threshold has been crossed.
pub unsafe fn check(g: &mut GlobalState, l: *mut Thread) -> VmResult<()> {
    if g.gc.total >= g.gc.threshold {
        step(g, l)?;
    }
    Ok(())
}

/// Perform a full GC cycle.
pub unsafe fn full_gc(g: &mut GlobalState, l: *mut Thread) -> VmResult<()> {
    let ostate = g.vmstate;
    g.vmstate = VmPhase::Gc;
    let before = g.gc.total;
    if g.gc.state == GcPhase::Pause || g.gc.state == GcPhase::Propagate {
        // Caught in the middle of a cycle: fast-forward to the sweep phase,
        // preserving current whites so no live object is freed.
        g.gc.sweepstr = 0;
        g.gc.sweep = &mut g.gc.root;
        g.gc.gray = null_mut();
        g.gc.grayagain = null_mut();
        g.gc.weak = null_mut();
        g.gc.state = GcPhase::SweepString;
    }
    while g.gc.state == GcPhase::SweepString || g.gc.state == GcPhase::Sweep {
        one_step(g, l).map_err(|e| {
            g.vmstate = ostate;
            e
        })?; // Finish the sweep.
    }
    debug_assert!(g.gc.state == GcPhase::Finalize || g.gc.state == GcPhase::Pause);
    // Now perform a fresh full cycle.
    mark_start(g);
    while g.gc.state != GcPhase::Pause {
        one_step(g, l).map_err(|e| {
            g.vmstate = ostate;
            e
        })?;
    }
    g.gc.threshold = (g.gc.estimate / 100) * g.gc.pause;
    g.vmstate = ostate;
    if g.verbose {
        eprintln!(
            "[gc] full collection: {} -> {}",
            formatted_size(before),
            formatted_size(g.gc.total)
        );
    }
    Ok(())
}

// -- Write barriers ------------------------------------------------------

/// Move the propagation frontier forward: a black `o` now references the
/// white `v`. Not used for tables.
pub unsafe fn barrier_f(g: &mut GlobalState, o: *mut GcHeader, v: *mut GcHeader) {
    debug_assert!((*o).marked.black() && (*v).marked.is_white());
    debug_assert!(!(*o).is_dead(g.gc.currentwhite) && !(*v).is_dead(g.gc.currentwhite));
    debug_assert!(g.gc.state != GcPhase::Finalize && g.gc.state != GcPhase::Pause);
    debug_assert!((*o).tag != Tag::Table);
    if g.gc.state == GcPhase::Propagate {
        mark(g, v); // Move frontier forward.
    } else {
        (*o).make_white(g.gc.currentwhite); // Not yet swept: re-whiten.
    }
}

/// Move the propagation frontier back for tables: re-gray the table and
/// queue it for a bulk re-scan, keeping per-store cost constant.
pub unsafe fn barrier_back(g: &mut GlobalState, t: *mut Table) {
    let o = t as *mut GcHeader;
    debug_assert!((*o).marked.black() && !(*o).is_dead(g.gc.currentwhite));
    debug_assert!(g.gc.state != GcPhase::Finalize && g.gc.state != GcPhase::Pause);
    (*o).black_to_gray();
    (*o).gclist = g.gc.grayagain;
    g.gc.grayagain = o;
}

/// Barrier for a store into a closed upvalue's embedded value slot.
pub unsafe fn barrier_uv(g: &mut GlobalState, uv: *mut Upval) {
    debug_assert!((*uv).closed);
    if g.gc.state == GcPhase::Propagate {
        let v = (*uv).value();
        mark_value(g, v);
    } else {
        (*uv).head.make_white(g.gc.currentwhite);
    }
}

/// Close an upvalue: copy the stack slot into the embedded storage and move
/// the object onto the root list. The caller has already unlinked it from
/// the thread chain and the global order list.
pub unsafe fn close_uv(g: &mut GlobalState, uv: *mut Upval) {
    let o = uv as *mut GcHeader;
    (*uv).tv = *(*uv).v;
    (*uv).v = &mut (*uv).tv;
    (*uv).closed = true;
    (*o).next = g.gc.root;
    g.gc.root = o;
    if (*o).marked.is_gray() {
        if g.gc.state == GcPhase::Propagate {
            (*o).gray_to_black(); // Closed upvalues are never gray.
            if let Some(v) = (*uv).tv.gc() {
                if (*v).marked.is_white() {
                    barrier_f(g, o, v);
                }
            }
        } else {
            (*o).make_white(g.gc.currentwhite); // Defer to the sweep.
        }
    }
}

/// Mark a trace's constants when it is saved during propagation.
pub unsafe fn barrier_trace(g: &mut GlobalState, t: *mut TraceObj) {
    if g.gc.state == GcPhase::Propagate {
        traverse_trace(g, t);
    }
}

// -- Test support --------------------------------------------------------

/// Walk the heap and assert the tri-color invariant: no black object holds
/// a direct reference to a white object.
#[cfg(test)]
pub(crate) unsafe fn assert_tricolor(g: &mut GlobalState) {
    unsafe fn check(src: *mut GcHeader, v: Value) {
        if let Some(o) = v.gc() {
            assert!(
                !(*o).marked.is_white(),
                "black {:?} references white {:?}",
                (*src).tag,
                (*o).tag
            );
        }
    }
    let mut o = g.gc.root;
    while !o.is_null() {
        if (*o).marked.black() {
            match (*o).tag {
                Tag::Table => {
                    let t = o as *mut Table;
                    if !(*t).metatable.is_null() {
                        assert!(!(*(*t).metatable).head.marked.is_white());
                    }
                    if !(*o).marked.is_weak() {
                        for i in 0..(*t).asize {
                            check(o, *(*t).array_slot(i));
                        }
                        if !(*t).node.is_null() {
                            for i in 0..=(*t).hmask {
                                let n = (*t).node_slot(i);
                                if !(*n).val.is_nil() {
                                    check(o, (*n).key);
                                    check(o, (*n).val);
                                }
                            }
                        }
                    }
                }
                Tag::Func => {
                    let f = o as *mut Func;
                    match (*f).kind {
                        FuncKind::Vm {
                            proto,
                            upvals,
                            nupvals,
                        } => {
                            assert!(!(*(proto as *mut GcHeader)).marked.is_white());
                            for i in 0..nupvals {
                                let uv = *upvals.add(i);
                                if !uv.is_null() {
                                    assert!(!(*(uv as *mut GcHeader)).marked.is_white());
                                }
                            }
                        }
                        FuncKind::Native {
                            upvals, nupvals, ..
                        } => {
                            for i in 0..nupvals {
                                check(o, *upvals.add(i));
                            }
                        }
                    }
                }
                Tag::Upval => {
                    let uv = o as *mut Upval;
                    if (*uv).closed {
                        check(o, (*uv).tv);
                    }
                }
                Tag::Udata => {
                    let ud = o as *mut Udata;
                    if !(*ud).metatable.is_null() {
                        assert!(!(*(*ud).metatable).head.marked.is_white());
                    }
                }
                Tag::Thread => panic!("threads must never be black"),
                _ => {}
            }
        }
        o = (*o).next;
    }
}

/// Assert that `mmudata` is either empty or a proper ring disjoint from the
/// main userdata chain.
#[cfg(test)]
pub(crate) unsafe fn assert_mmudata_ring(g: &mut GlobalState) {
    let root = g.gc.mmudata;
    let mut ring = Vec::new();
    if !root.is_null() {
        let mut u = (*root).next;
        loop {
            assert!((*u).tag == Tag::Udata);
            assert!(!ring.contains(&u), "mmudata ring is not a proper cycle");
            ring.push(u);
            if u == root {
                break;
            }
            u = (*u).next;
        }
    }
    let mut o = (*(g.mainthread as *mut GcHeader)).next;
    while !o.is_null() {
        assert!(
            !ring.contains(&o),
            "object on both mmudata and the main chain"
        );
        o = (*o).next;
    }
}
