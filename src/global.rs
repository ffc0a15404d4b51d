//! Global collector and runtime state.
//!
//! One `GlobalState` exists per runtime instance and is passed explicitly
//! to every operation; nothing in this crate goes through ambient globals.

use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};

use crate::error::VmResult;
use crate::ffi::abi::AbiDesc;
use crate::ffi::ctype::CTypeTable;
use crate::ffi::CallState;
use crate::gc;
use crate::header::{GcHeader, White};
use crate::mem::{self, AllocF, SBuf};
use crate::strtab::{self, Str, StrTab};
use crate::table::{self, Table};
use crate::thread::{self, Thread, Upval};
use crate::trace::{self, JitState};
use crate::value::Value;

/// Collector phases. The atomic part of the cycle is transient and never
/// observable between steps.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcPhase {
    Pause,
    Propagate,
    SweepString,
    Sweep,
    Finalize,
}

/// Coarse VM state, recorded while the collector runs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmPhase {
    Normal,
    Gc,
}

/// Everything the collector itself owns.
pub struct GcState {
    /// Head of the root list of all GC objects.
    pub root: *mut GcHeader,
    /// Gray worklist (intrusive via `gclist`).
    pub gray: *mut GcHeader,
    /// Objects needing re-traversal in the atomic phase.
    pub grayagain: *mut GcHeader,
    /// Weak tables found during propagation.
    pub weak: *mut GcHeader,
    /// Circular list of userdata awaiting finalization.
    pub mmudata: *mut GcHeader,
    /// Sweep cursor: the link that points at the next object to examine.
    pub sweep: *mut *mut GcHeader,
    /// Index of the next string hash chain to sweep.
    pub sweepstr: usize,
    pub currentwhite: White,
    pub state: GcPhase,
    pub total: usize,
    pub threshold: usize,
    pub estimate: usize,
    pub debt: usize,
    /// Step multiplier, percent.
    pub stepmul: usize,
    /// Pause between cycles, percent of the live estimate.
    pub pause: usize,
}

impl GcState {
    fn new() -> GcState {
        GcState {
            root: null_mut(),
            gray: null_mut(),
            grayagain: null_mut(),
            weak: null_mut(),
            mmudata: null_mut(),
            sweep: null_mut(),
            sweepstr: 0,
            currentwhite: White::W0,
            state: GcPhase::Pause,
            total: 0,
            threshold: 0,
            estimate: 0,
            debt: 0,
            stepmul: 200,
            pause: 200,
        }
    }
}

/// Static root slots (registry-like anchors usable by the embedder).
pub const GCROOT_MAX: usize = 8;

/// Hook mask value while a finalizer runs: everything disabled.
pub const HOOK_GC: u8 = 0x80;

/// Fast metamethod slots resolved against interned event names.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mm {
    Gc,
    Mode,
}

pub struct GlobalState {
    pub allocf: AllocF,
    pub allocd: *mut c_void,
    pub gc: GcState,
    pub strtab: StrTab,
    pub tmpbuf: SBuf,
    pub mainthread: *mut Thread,
    pub registry: Value,
    pub gcroot: [Value; GCROOT_MAX],
    /// Sentinel of the doubly-linked order list of all open upvalues.
    pub uvhead: Upval,
    pub hookmask: u8,
    pub vmstate: VmPhase,
    pub verbose: bool,
    pub jit: JitState,
    pub cts: CTypeTable,
    pub ffi_abi: &'static AbiDesc,
    /// Platform trampoline: loads registers from the call state and invokes
    /// `func`. Registered by the embedder (or a test double).
    pub ffi_call: Option<unsafe fn(*mut CallState)>,
    pub mm_gc: *mut Str,
    pub mm_mode: *mut Str,
}

impl GlobalState {
    /// Resolve a metamethod directly from a metatable (no inheritance).
    pub unsafe fn meta_fast(&self, mt: *mut Table, mm: Mm) -> Value {
        if mt.is_null() {
            return Value::Nil;
        }
        let name = match mm {
            Mm::Gc => self.mm_gc,
            Mm::Mode => self.mm_mode,
        };
        table::get(mt, Value::Str(NonNull::new_unchecked(name)))
    }

    /// Store into a static root slot. Roots are re-marked every cycle, so
    /// no barrier is needed.
    pub fn set_gcroot(&mut self, i: usize, v: Value) {
        self.gcroot[i] = v;
    }

    pub fn gcroot(&self, i: usize) -> Value {
        self.gcroot[i]
    }
}

/// Owning handle for one runtime instance. Dropping it runs all pending
/// finalizers, sweeps every object and releases the global structures.
pub struct Runtime {
    g: *mut GlobalState,
}

impl Runtime {
    pub fn new() -> VmResult<Runtime> {
        Runtime::with_allocf(mem::libc_allocf, null_mut())
    }

    pub fn with_allocf(allocf: AllocF, allocd: *mut c_void) -> VmResult<Runtime> {
        let g = Box::into_raw(Box::new(GlobalState {
            allocf,
            allocd,
            gc: GcState::new(),
            strtab: StrTab::empty(),
            tmpbuf: SBuf::empty(),
            mainthread: null_mut(),
            registry: Value::Nil,
            gcroot: [Value::Nil; GCROOT_MAX],
            uvhead: Upval::sentinel(),
            hookmask: 0,
            vmstate: VmPhase::Normal,
            verbose: false,
            jit: JitState::new(),
            cts: CTypeTable::host(),
            ffi_abi: AbiDesc::host(),
            ffi_call: None,
            mm_gc: null_mut(),
            mm_mode: null_mut(),
        }));
        unsafe {
            (*g).uvhead.prev = &mut (*g).uvhead;
            (*g).uvhead.next = &mut (*g).uvhead;
            if let Err(e) = boot(&mut *g) {
                teardown(&mut *g);
                drop(Box::from_raw(g));
                return Err(e);
            }
        }
        Ok(Runtime { g })
    }

    pub fn global_mut(&mut self) -> &mut GlobalState {
        unsafe { &mut *self.g }
    }

    pub fn global(&self) -> &GlobalState {
        unsafe { &*self.g }
    }

    pub fn main_thread(&self) -> *mut Thread {
        unsafe { (*self.g).mainthread }
    }
}

unsafe fn boot(g: &mut GlobalState) -> VmResult<()> {
    strtab::init(g, strtab::MIN_STRTAB)?;
    let th = thread::new_thread(g, null_mut())?.as_ptr();
    // The main thread survives every sweep, including shutdown.
    (*th).head.marked.set_fixed(true);
    (*th).head.marked.set_sfixed(true);
    g.mainthread = th;
    let env = table::new(g, 0, mem::MIN_VECSZ)?.as_ptr();
    (*th).env = env;
    let registry = table::new(g, 0, mem::MIN_VECSZ)?.as_ptr();
    g.registry = Value::Tab(NonNull::new_unchecked(registry));
    let mm_gc = strtab::new_str(g, b"__gc")?;
    strtab::fix_str(mm_gc);
    g.mm_gc = mm_gc.as_ptr();
    let mm_mode = strtab::new_str(g, b"__mode")?;
    strtab::fix_str(mm_mode);
    g.mm_mode = mm_mode.as_ptr();
    g.gc.threshold = g.gc.total * 4;
    Ok(())
}

unsafe fn teardown(g: &mut GlobalState) {
    if !g.mainthread.is_null() {
        let l = g.mainthread;
        gc::separate_udata(g, true);
        if let Err(e) = gc::finalize_all(g, l) {
            if g.verbose {
                eprintln!("[gc] error ignored during shutdown finalization: {}", e);
            }
        }
        gc::free_all(g);
        thread::free_thread(g, l as *mut GcHeader);
        g.mainthread = null_mut();
    }
    strtab::free_table(g);
    mem::sbuf_free(g);
    let traces: Vec<_> = g.jit.traces.drain(..).collect();
    for t in traces {
        if !t.is_null() {
            trace::free_trace(g, t);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        unsafe {
            teardown(&mut *self.g);
            drop(Box::from_raw(self.g));
        }
    }
}

impl std::ops::Deref for Runtime {
    type Target = GlobalState;
    fn deref(&self) -> &GlobalState {
        unsafe { &*self.g }
    }
}

impl std::ops::DerefMut for Runtime {
    fn deref_mut(&mut self) -> &mut GlobalState {
        unsafe { &mut *self.g }
    }
}

pub(crate) struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;
        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }
        let msize = ksize / 1024f64;
        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }
        write!(f, "{:.1}M", msize)
    }
}

pub(crate) fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
