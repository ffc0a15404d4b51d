//! Foreign function call marshaller.
//!
//! [`call_func`] resolves a callable cdata, lays its arguments out into a
//! [`CallState`] register/stack image according to the selected ABI
//! descriptor, invokes the registered platform trampoline and converts the
//! returned registers back into managed values.
//!
//! Trampoline contract: the hook receives a `*mut CallState`, loads `gpr`,
//! `fpr` and the outgoing `stack` area per the target ABI, calls `func`,
//! then stores result registers back (integers/pointers into `gpr[0..]`,
//! floating results into `fpr[0]`, x87 results spilled into `fpr[0]`). On
//! x86 targets it must also store the callee-cleaned byte count into
//! `spadj` (0 for a caller-clean return); `__stdcall` auto-detection reads
//! it.

pub mod abi;
pub mod cconv;
pub mod ctype;

use std::os::raw::c_void;
use std::ptr::null_mut;

use crate::error::{VmError, VmResult};
use crate::ffi::abi::{AbiDesc, AbiTarget};
use crate::ffi::cconv::ConvFlags;
use crate::ffi::ctype::{CTypeId, CTypeKind, CallConv};
use crate::gc;
use crate::global::GlobalState;
use crate::thread::{self, Thread};
use crate::trace;
use crate::udata::{self, Cdata};
use crate::value::Value;

/// Maximum outgoing stack slots (pointer-sized units).
pub const MAX_STACK_SLOTS: usize = 32;

pub const NUM_GPR: usize = 8;
pub const NUM_FPR: usize = 8;

/// One FPR shadow: an xmm-style register viewed as doubles, floats or raw
/// lanes.
#[repr(C)]
#[derive(Clone, Copy)]
pub union FpReg {
    pub d: [f64; 2],
    pub f: [f32; 4],
    pub l: [u64; 2],
}

/// Register/stack image for one foreign call, built by the marshaller and
/// consumed by the platform trampoline.
#[repr(C)]
pub struct CallState {
    pub gpr: [u64; NUM_GPR],
    pub fpr: [FpReg; NUM_FPR],
    pub stack: [u8; MAX_STACK_SLOTS * 8],
    pub func: *const c_void,
    /// Outgoing stack adjustment in bytes; on x86 the trampoline overwrites
    /// it with the callee-cleaned byte count on return.
    pub spadj: usize,
    pub nsp: usize,
    pub ngpr: usize,
    pub nfpr: usize,
    /// Result arrives in a caller-supplied buffer whose pointer was passed
    /// as an implicit argument.
    pub retref: bool,
    /// x86 only: 1 = float on the x87 stack, 2 = double.
    pub resx87: u8,
}

impl CallState {
    pub fn new() -> CallState {
        CallState {
            gpr: [0; NUM_GPR],
            fpr: [FpReg { l: [0, 0] }; NUM_FPR],
            stack: [0; MAX_STACK_SLOTS * 8],
            func: null_mut(),
            spadj: 0,
            nsp: 0,
            ngpr: 0,
            nfpr: 0,
            retref: false,
            resx87: 0,
        }
    }
}

impl Default for CallState {
    fn default() -> CallState {
        CallState::new()
    }
}

/// Where the target descriptor decided an argument goes.
pub enum ArgDisp {
    /// Continue the common register/stack path (by value).
    Fallthrough,
    /// Pass a pointer to this temporary instead of the value.
    ByRef(*mut u8),
    /// Fully placed by the descriptor; move on to the next argument.
    Done,
}

/// Mutable state shared with the ABI descriptor hooks during argument
/// setup.
pub struct SetupCtx<'a> {
    pub g: &'a mut GlobalState,
    pub l: *mut Thread,
    pub cc: &'a mut CallState,
    pub abi: &'static AbiDesc,
    pub ret_id: CTypeId,
    pub ngpr: usize,
    pub nfpr: usize,
    pub nsp: usize,
    pub maxgpr: usize,
    pub gcsteps: usize,
}

impl<'a> SetupCtx<'a> {
    #[inline]
    pub fn gpr_ptr(&mut self, i: usize) -> *mut u8 {
        debug_assert!(i < NUM_GPR);
        unsafe { self.cc.gpr.as_mut_ptr().add(i) as *mut u8 }
    }

    #[inline]
    pub fn fpr_ptr(&mut self, i: usize) -> *mut u8 {
        debug_assert!(i < NUM_FPR);
        unsafe { self.cc.fpr.as_mut_ptr().add(i) as *mut u8 }
    }

    #[inline]
    pub fn stack_ptr(&mut self, slot: usize) -> *mut u8 {
        debug_assert!(slot <= MAX_STACK_SLOTS);
        unsafe { self.cc.stack.as_mut_ptr().add(slot * self.abi.ptr_size) }
    }
}

/// Infer the destination C type for a vararg argument.
unsafe fn infer_vararg(g: &mut GlobalState, o: Value) -> CTypeId {
    match o {
        Value::Num(_) => ctype::DOUBLE,
        Value::Cdata(cd) => {
            let id = (*cd.as_ptr()).ctypeid;
            let ct = g.cts.get(id).clone();
            match ct.kind {
                // Arrays decay to element pointers.
                CTypeKind::Array { elem, .. } => g.cts.ptr_to(elem),
                // Struct and function cdata in vararg slots get pointer
                // semantics, not struct-by-value.
                CTypeKind::Struct { .. } | CTypeKind::Func { .. } => g.cts.ptr_to(id),
                CTypeKind::Float if ct.size == 4 => ctype::DOUBLE,
                _ => id,
            }
        }
        Value::Str(_) => ctype::P_CCHAR,
        Value::Bool(_) => ctype::BOOL,
        _ => ctype::P_VOID,
    }
}

/// Set up arguments for a C call. Returns the number of managed
/// allocations performed (each one owes a GC checkpoint after the call).
pub unsafe fn set_args(
    g: &mut GlobalState,
    l: *mut Thread,
    fid: CTypeId,
    cc: &mut CallState,
) -> VmResult<usize> {
    let abi = g.ffi_abi;
    let (ret_id, params, vararg, conv) = match g.cts.get(fid).kind {
        CTypeKind::Func {
            ret,
            ref params,
            vararg,
            conv,
        } => (ret, params.clone(), vararg, conv),
        _ => return Err(VmError::NotFunction),
    };
    let ptr_size = abi.ptr_size;

    // Clear unused regs to get some determinism in case of misdeclaration.
    cc.gpr = [0; NUM_GPR];
    cc.fpr = [FpReg { l: [0, 0] }; NUM_FPR];
    cc.resx87 = 0;
    cc.retref = false;

    // x86 has several different calling conventions.
    let maxgpr = if abi.target == AbiTarget::X86Win || abi.target == AbiTarget::X86Sysv {
        match conv {
            CallConv::Fastcall => 2,
            CallConv::Thiscall => 1,
            _ => 0,
        }
    } else {
        abi.nreg_gpr
    };

    // Snapshot the argument values before anything can move the stack.
    let base = (*l).base;
    let top = (*l).top;
    let mut args: Vec<Value> = Vec::with_capacity(top.saturating_sub(base + 1));
    for i in base + 1..top {
        args.push(*(*l).slot(i));
    }

    // Perform required setup for some result types.
    let retk = g.cts.get(ret_id).kind.clone();
    let retsz = g.cts.size(ret_id);
    let mut retdp: *mut u8 = null_mut();
    match retk {
        CTypeKind::Vector { .. } => {
            if !(abi.vector_reg && (retsz == 8 || retsz == 16)) {
                return Err(VmError::FfiNyiCall);
            }
        }
        CTypeKind::Complex { .. } | CTypeKind::Struct { .. } => {
            // Preallocate the result cdata and anchor it on the stack.
            let cd = udata::new_cdata(g, ret_id, retsz)?;
            retdp = (*cd.as_ptr()).payload();
            thread::push(g, l, Value::Cdata(cd))?;
        }
        _ => {}
    }

    let mut ctx = SetupCtx {
        g: &mut *g,
        l,
        cc: &mut *cc,
        abi,
        ret_id,
        ngpr: 0,
        nfpr: 0,
        nsp: 0,
        maxgpr,
        gcsteps: 0,
    };

    match retk {
        CTypeKind::Struct { .. } => (abi.structret)(&mut ctx, retsz, retdp)?,
        CTypeKind::Complex { .. } => (abi.complexret)(&mut ctx, retsz, retdp)?,
        CTypeKind::Float
            if ctx.abi.target == AbiTarget::X86Win || ctx.abi.target == AbiTarget::X86Sysv =>
        {
            // Floating results come back on the x87 stack.
            ctx.cc.resx87 = if retsz == 4 { 1 } else { 2 };
        }
        _ => {}
    }

    // Walk through all passed arguments.
    for (i, &o) in args.iter().enumerate() {
        let narg = i + 1;
        let (mut did, isva) = match params.get(i) {
            Some(&p) => (p, false),
            None => {
                if !vararg {
                    return Err(VmError::FfiNumArgs); // Too many arguments.
                }
                (infer_vararg(ctx.g, o), true)
            }
        };
        if let CTypeKind::Enum { base } = ctx.g.cts.get(did).kind {
            did = base;
        }
        let mut sz = ctx.g.cts.size(did);
        let kind = ctx.g.cts.get(did).kind.clone();
        let mut isfp: u8 = 0;
        let mut rp: *mut u8 = null_mut();

        // Find out how (by value/ref) and where (GPR/FPR) to pass it.
        match kind {
            CTypeKind::Bool | CTypeKind::Int { .. } => {
                if sz > 8 {
                    return Err(VmError::FfiNyiCall);
                }
                if sz < ptr_size {
                    did = ctx.g.cts.int_psz(); // Widen to pointer size.
                }
            }
            CTypeKind::Float => {
                if sz > 8 {
                    return Err(VmError::FfiNyiCall);
                }
                isfp = 1;
            }
            CTypeKind::Vector { .. } => {
                if ctx.abi.vector_reg && (sz == 8 || sz == 16) {
                    isfp = 1;
                } else {
                    return Err(VmError::FfiNyiCall);
                }
            }
            CTypeKind::Struct { .. } => {
                let structarg = ctx.abi.structarg;
                match structarg(&mut ctx, did, &mut sz, o, narg)? {
                    ArgDisp::Done => continue,
                    ArgDisp::ByRef(p) => rp = p,
                    ArgDisp::Fallthrough => {}
                }
            }
            CTypeKind::Complex { .. } => {
                let complexarg = ctx.abi.complexarg;
                match complexarg(&mut ctx, did, &mut sz, &mut isfp)? {
                    ArgDisp::Done => continue,
                    ArgDisp::ByRef(p) => rp = p,
                    ArgDisp::Fallthrough => {}
                }
            }
            CTypeKind::Array { elem, .. } => {
                // Array parameters decay to pointers.
                did = ctx.g.cts.ptr_to(elem);
                sz = ptr_size;
            }
            CTypeKind::Func { .. } => {
                did = ctx.g.cts.ptr_to(did);
                sz = ptr_size;
            }
            CTypeKind::Ptr { .. } => {
                sz = ptr_size;
            }
            CTypeKind::Void | CTypeKind::Enum { .. } => return Err(VmError::FfiNyiCall),
        }

        sz = (sz + ptr_size - 1) & !(ptr_size - 1);
        let n = sz / ptr_size; // GPRs or stack slots needed.

        let regarg = ctx.abi.regarg;
        let mut isva_eff = isva;
        let mut dp = match regarg(&mut ctx, isfp, n) {
            Some(dp) => dp,
            None => {
                // Pass the argument on the stack.
                let dalign = ctx.g.cts.align(did);
                if ctx.abi.align_stackarg && rp.is_null() && dalign > ptr_size {
                    let a = dalign / ptr_size;
                    ctx.nsp = (ctx.nsp + a - 1) / a * a;
                }
                if ctx.nsp + n > MAX_STACK_SLOTS {
                    return Err(VmError::FfiNyiCall); // Too many arguments.
                }
                let dp = ctx.stack_ptr(ctx.nsp);
                ctx.nsp += n;
                isva_eff = false;
                dp
            }
        };
        if !rp.is_null() {
            // Pass by reference through the temporary.
            ctx.gcsteps += 1;
            cconv::write_int(dp, rp as usize as u64, ptr_size);
            dp = rp;
        }
        cconv::ct_tv(ctx.g, did, dp, o, ConvFlags::empty())?;
        let postarg = ctx.abi.postarg;
        postarg(&mut ctx, isfp, isva_eff, n, dp);
    }
    if args.len() < params.len() {
        return Err(VmError::FfiNumArgs); // Too few arguments.
    }

    let (ngpr, nfpr, nsp, gcsteps) = (ctx.ngpr, ctx.nfpr, ctx.nsp, ctx.gcsteps);
    cc.ngpr = ngpr;
    cc.nfpr = nfpr; // Required for vararg functions.
    cc.nsp = nsp;
    cc.spadj = (abi.sps_free + abi.sps_extra) * ptr_size;
    if nsp > abi.sps_free {
        cc.spadj += ((nsp - abi.sps_free) * ptr_size + 15) & !15;
    }
    Ok(gcsteps)
}

/// Get results from a completed C call. Returns the managed result count
/// and the number of managed allocations performed.
pub unsafe fn get_results(
    g: &mut GlobalState,
    l: *mut Thread,
    fid: CTypeId,
    cc: &mut CallState,
) -> VmResult<(i32, usize)> {
    let abi = g.ffi_abi;
    let ret_id = match g.cts.get(fid).kind {
        CTypeKind::Func { ret, .. } => ret,
        _ => return Err(VmError::NotFunction),
    };
    let retk = g.cts.get(ret_id).kind.clone();
    let retsz = g.cts.size(ret_id);
    match retk {
        CTypeKind::Void => Ok((0, 0)), // Zero results.
        CTypeKind::Struct { .. } => {
            // The preallocated cdata on top of the stack is the result.
            if !cc.retref {
                let cd = result_cdata(l)?;
                (abi.structret2)(g, cc, ret_id, (*cd).payload())?;
            }
            Ok((1, 1))
        }
        CTypeKind::Complex { .. } => {
            let cd = result_cdata(l)?;
            if !cc.retref {
                (abi.complexret2)(cc, retsz, (*cd).payload());
            }
            Ok((1, 1))
        }
        _ => {
            let fp = matches!(retk, CTypeKind::Float | CTypeKind::Vector { .. });
            let sp = if fp {
                cc.fpr.as_ptr() as *const u8
            } else {
                cc.gpr.as_ptr() as *const u8
            };
            let mut rid = ret_id;
            if let CTypeKind::Enum { base } = retk {
                rid = base;
            }
            let (v, steps) = cconv::tv_ct(g, rid, sp)?;
            thread::push(g, l, v)?;
            Ok((1, steps))
        }
    }
}

unsafe fn result_cdata(l: *mut Thread) -> VmResult<*mut Cdata> {
    let top = (*l).top;
    match *(*l).slot(top - 1) {
        Value::Cdata(cd) => Ok(cd.as_ptr()),
        _ => {
            debug_assert!(false, "preallocated return cdata missing");
            Err(VmError::FfiNyiCall)
        }
    }
}

/// Invoke a foreign function cdata. Returns the number of managed results,
/// or -1 when the cdata does not resolve to a C function.
pub unsafe fn call_func(g: &mut GlobalState, l: *mut Thread, cd: *mut Cdata) -> VmResult<i32> {
    let mut id = (*cd).ctypeid;
    let mut psz = g.cts.ptr_size;
    if let CTypeKind::Ptr { to } = g.cts.get(id).kind {
        psz = g.cts.size(id);
        id = to;
    }
    let conv = match g.cts.get(id).kind {
        CTypeKind::Func { conv, .. } => conv,
        _ => return Ok(-1),
    };
    let mut cc = CallState::new();
    cc.func = cconv::read_int((*cd).payload(), psz, true) as usize as *const c_void;
    let mut gcsteps = set_args(g, l, id, &mut cc)?;
    let hook = g.ffi_call.ok_or(VmError::FfiNyiCall)?;
    hook(&mut cc);
    let (ret, steps) = get_results(g, l, id, &mut cc)?;
    gcsteps += steps;
    // Automatically detect __stdcall and fix up the declaration.
    if g.ffi_abi.target == AbiTarget::X86Win && cc.spadj != 0 && conv == CallConv::Cdecl {
        if let CTypeKind::Func { ref mut conv, .. } = g.cts.get_mut(id).kind {
            *conv = CallConv::Stdcall;
        }
        trace::trace_abort(g);
    }
    while gcsteps > 0 {
        gc::check(g, l)?;
        gcsteps -= 1;
    }
    Ok(ret)
}

/// Register the platform trampoline.
pub fn set_trampoline(g: &mut GlobalState, f: unsafe fn(*mut CallState)) {
    g.ffi_call = Some(f);
}
