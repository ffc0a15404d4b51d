//! Function objects (VM closures and native closures) and prototypes.

use std::mem::size_of;
use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};

use crate::error::VmResult;
use crate::gc;
use crate::global::GlobalState;
use crate::header::{GcHeader, Tag};
use crate::mem;
use crate::strtab::Str;
use crate::table::Table;
use crate::thread::{Thread, Upval};
use crate::value::Value;

/// Native closure entry point. Finalizers and other runtime callbacks use
/// this shape; the single argument is the value being operated on.
pub type NativeFn = fn(&mut GlobalState, *mut Thread, Value) -> VmResult<()>;

/// Function prototype. Immutable once built, so stores into it need no
/// write barrier.
#[repr(C)]
pub struct Proto {
    pub head: GcHeader,
    pub chunkname: *mut Str,
    pub kgc: *mut *mut GcHeader,
    pub sizekgc: usize,
    pub uvnames: *mut *mut Str,
    pub sizeuvname: usize,
    pub varnames: *mut *mut Str,
    pub sizevarinfo: usize,
    pub framesize: usize,
    pub sizebc: usize,
    pub sizekn: usize,
    /// Root trace attached to this prototype (0 = none).
    pub trace: u32,
}

impl Proto {
    /// Bytes attributed for mark cost estimates.
    pub fn total_size(&self) -> usize {
        size_of::<Proto>()
            + self.sizekgc * size_of::<*mut GcHeader>()
            + self.sizeuvname * size_of::<*mut Str>()
            + self.sizevarinfo * size_of::<*mut Str>()
            + self.sizebc * 4
            + self.sizekn * size_of::<f64>()
    }
}

pub unsafe fn new_proto(
    g: &mut GlobalState,
    framesize: usize,
    sizekgc: usize,
    sizeuvname: usize,
    sizevarinfo: usize,
) -> VmResult<NonNull<Proto>> {
    let o = mem::new_gco(g, size_of::<Proto>(), Tag::Proto)?;
    let pt = o as *mut Proto;
    (*pt).chunkname = null_mut();
    (*pt).kgc = null_mut();
    (*pt).sizekgc = 0;
    (*pt).uvnames = null_mut();
    (*pt).sizeuvname = 0;
    (*pt).varnames = null_mut();
    (*pt).sizevarinfo = 0;
    (*pt).framesize = framesize;
    (*pt).sizebc = 0;
    (*pt).sizekn = 0;
    (*pt).trace = 0;
    if sizekgc > 0 {
        (*pt).kgc = alloc_ptr_vec(g, sizekgc)? as *mut *mut GcHeader;
        (*pt).sizekgc = sizekgc;
    }
    if sizeuvname > 0 {
        (*pt).uvnames = alloc_ptr_vec(g, sizeuvname)? as *mut *mut Str;
        (*pt).sizeuvname = sizeuvname;
    }
    if sizevarinfo > 0 {
        (*pt).varnames = alloc_ptr_vec(g, sizevarinfo)? as *mut *mut Str;
        (*pt).sizevarinfo = sizevarinfo;
    }
    Ok(NonNull::new_unchecked(pt))
}

unsafe fn alloc_ptr_vec(g: &mut GlobalState, n: usize) -> VmResult<*mut c_void> {
    let p = mem::realloc(g, null_mut(), 0, n * size_of::<usize>())?;
    std::ptr::write_bytes(p as *mut u8, 0, n * size_of::<usize>());
    Ok(p)
}

pub unsafe fn free_proto(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Proto);
    let pt = o as *mut Proto;
    if !(*pt).kgc.is_null() {
        mem::free(g, (*pt).kgc as *mut c_void, (*pt).sizekgc * size_of::<usize>());
    }
    if !(*pt).uvnames.is_null() {
        mem::free(
            g,
            (*pt).uvnames as *mut c_void,
            (*pt).sizeuvname * size_of::<usize>(),
        );
    }
    if !(*pt).varnames.is_null() {
        mem::free(
            g,
            (*pt).varnames as *mut c_void,
            (*pt).sizevarinfo * size_of::<usize>(),
        );
    }
    mem::free(g, o as *mut c_void, size_of::<Proto>());
}

pub enum FuncKind {
    /// VM-level closure: prototype plus shared upvalue objects.
    Vm {
        proto: *mut Proto,
        upvals: *mut *mut Upval,
        nupvals: usize,
    },
    /// Native closure: entry point plus embedded upvalue values.
    Native {
        f: NativeFn,
        upvals: *mut Value,
        nupvals: usize,
    },
}

#[repr(C)]
pub struct Func {
    pub head: GcHeader,
    pub env: *mut Table,
    pub kind: FuncKind,
}

impl Func {
    pub fn total_size(&self) -> usize {
        size_of::<Func>()
            + match self.kind {
                FuncKind::Vm { nupvals, .. } => nupvals * size_of::<*mut Upval>(),
                FuncKind::Native { nupvals, .. } => nupvals * size_of::<Value>(),
            }
    }
}

pub unsafe fn new_vm_func(
    g: &mut GlobalState,
    proto: *mut Proto,
    nupvals: usize,
    env: *mut Table,
) -> VmResult<NonNull<Func>> {
    let o = mem::new_gco(g, size_of::<Func>(), Tag::Func)?;
    let f = o as *mut Func;
    (*f).env = env;
    let upvals = if nupvals > 0 {
        alloc_ptr_vec(g, nupvals)? as *mut *mut Upval
    } else {
        null_mut()
    };
    std::ptr::write(
        &mut (*f).kind,
        FuncKind::Vm {
            proto,
            upvals,
            nupvals,
        },
    );
    Ok(NonNull::new_unchecked(f))
}

pub unsafe fn new_native(
    g: &mut GlobalState,
    nf: NativeFn,
    nupvals: usize,
    env: *mut Table,
) -> VmResult<NonNull<Func>> {
    let o = mem::new_gco(g, size_of::<Func>(), Tag::Func)?;
    let f = o as *mut Func;
    (*f).env = env;
    let upvals = if nupvals > 0 {
        let p = mem::realloc(g, null_mut(), 0, nupvals * size_of::<Value>())? as *mut Value;
        for i in 0..nupvals {
            p.add(i).write(Value::Nil);
        }
        p
    } else {
        null_mut()
    };
    std::ptr::write(
        &mut (*f).kind,
        FuncKind::Native {
            f: nf,
            upvals,
            nupvals,
        },
    );
    Ok(NonNull::new_unchecked(f))
}

pub unsafe fn free_func(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Func);
    let f = o as *mut Func;
    match (*f).kind {
        FuncKind::Vm {
            upvals, nupvals, ..
        } => {
            if !upvals.is_null() {
                mem::free(g, upvals as *mut c_void, nupvals * size_of::<usize>());
            }
        }
        FuncKind::Native {
            upvals, nupvals, ..
        } => {
            if !upvals.is_null() {
                mem::free(g, upvals as *mut c_void, nupvals * size_of::<Value>());
            }
        }
    }
    mem::free(g, o as *mut c_void, size_of::<Func>());
}

/// Store an upvalue value of a native closure, with the forward barrier.
pub unsafe fn set_native_upvalue(g: &mut GlobalState, f: *mut Func, i: usize, v: Value) {
    if let FuncKind::Native {
        upvals, nupvals, ..
    } = (*f).kind
    {
        debug_assert!(i < nupvals);
        *upvals.add(i) = v;
        if (*f).head.marked.black() {
            if let Some(o) = v.gc() {
                if (*o).marked.is_white() {
                    gc::barrier_f(g, f as *mut GcHeader, o);
                }
            }
        }
    } else {
        debug_assert!(false, "not a native closure");
    }
}
