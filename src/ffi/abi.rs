//! Per-target calling convention descriptors.
//!
//! Each supported target supplies one [`AbiDesc`]: register budgets plus
//! function pointers for the policy points of the argument walk (struct
//! return, struct argument, complex argument, register assignment, post
//! processing and result reassembly). Descriptors are plain statics, so a
//! host of any architecture can exercise any target's packing rules.

use bitflags::bitflags;

use crate::error::{VmError, VmResult};
use crate::ffi::cconv::{self, ConvFlags};
use crate::ffi::ctype::{CTypeId, CTypeKind, CTypeTable};
use crate::ffi::{ArgDisp, CallState, SetupCtx, MAX_STACK_SLOTS};
use crate::global::GlobalState;
use crate::mem;
use crate::udata;
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AbiTarget {
    X86Win,
    X86Sysv,
    X64Win,
    X64Sysv,
    PpcSpe,
}

bitflags! {
    /// x64 SysV register classes, one set per eightbyte.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct RegClass: u8 {
        const INT = 1;
        const SSE = 2;
        const MEM = 4;
        /// Unsupported member (vector field); the call must be rejected.
        const NYI = 8;
    }
}

pub struct AbiDesc {
    pub name: &'static str,
    pub target: AbiTarget,
    pub ptr_size: usize,
    /// Argument GPR budget (x86: cdecl budget, adjusted per convention).
    pub nreg_gpr: usize,
    /// Argument FPR budget (0 for softfp / x87 targets).
    pub nreg_fpr: usize,
    pub sps_free: usize,
    pub sps_extra: usize,
    pub align_stackarg: bool,
    pub vector_reg: bool,
    pub structret: unsafe fn(&mut SetupCtx, usize, *mut u8) -> VmResult<()>,
    pub complexret: unsafe fn(&mut SetupCtx, usize, *mut u8) -> VmResult<()>,
    pub structarg:
        unsafe fn(&mut SetupCtx, CTypeId, &mut usize, Value, usize) -> VmResult<ArgDisp>,
    pub complexarg: unsafe fn(&mut SetupCtx, CTypeId, &mut usize, &mut u8) -> VmResult<ArgDisp>,
    pub regarg: unsafe fn(&mut SetupCtx, u8, usize) -> Option<*mut u8>,
    pub postarg: unsafe fn(&mut SetupCtx, u8, bool, usize, *mut u8),
    pub structret2: unsafe fn(&mut GlobalState, &mut CallState, CTypeId, *mut u8) -> VmResult<()>,
    pub complexret2: unsafe fn(&mut CallState, usize, *mut u8),
}

impl AbiDesc {
    /// Descriptor for the build target.
    pub fn host() -> &'static AbiDesc {
        if cfg!(all(target_arch = "x86_64", target_os = "windows")) {
            &X64_WIN
        } else if cfg!(target_arch = "x86_64") {
            &X64_SYSV
        } else if cfg!(all(target_arch = "x86", target_os = "windows")) {
            &X86_WIN
        } else if cfg!(target_arch = "x86") {
            &X86_SYSV
        } else {
            // Foreign-architecture hosts get the SysV descriptor; calls only
            // run through an embedder-registered trampoline anyway.
            &X64_SYSV
        }
    }
}

// -- x64 SysV struct classification --------------------------------------

fn classify_scalar(rcl: &mut [RegClass; 2], ofs: usize, size: usize, fp: bool) {
    let mut cl = if fp { RegClass::SSE } else { RegClass::INT };
    if size > 0 && (ofs & (size - 1)) != 0 {
        cl = RegClass::MEM; // Unaligned access within the eightbyte.
    }
    rcl[(ofs >= 8) as usize] |= cl;
}

fn classify_ct(cts: &CTypeTable, id: CTypeId, rcl: &mut [RegClass; 2], ofs: usize) {
    let ct = cts.get(id);
    match ct.kind {
        CTypeKind::Array { elem, len } => {
            let esz = cts.size(elem);
            for i in 0..len {
                classify_ct(cts, elem, rcl, ofs + i * esz);
            }
        }
        CTypeKind::Struct { .. } => {
            classify_struct(cts, id, rcl, ofs);
        }
        CTypeKind::Vector { .. } => {
            // Rejected rather than misclassified; the SSEUP class is not
            // implemented.
            rcl[0] |= RegClass::NYI;
        }
        CTypeKind::Complex { elem } => {
            let esz = cts.size(elem);
            classify_scalar(rcl, ofs, esz, true);
            classify_scalar(rcl, ofs + esz, esz, true);
        }
        CTypeKind::Float => classify_scalar(rcl, ofs, ct.size, true),
        CTypeKind::Bool
        | CTypeKind::Int { .. }
        | CTypeKind::Enum { .. }
        | CTypeKind::Ptr { .. }
        | CTypeKind::Func { .. } => classify_scalar(rcl, ofs, ct.size, false),
        CTypeKind::Void => {}
    }
}

/// Recursively classify a struct's bytes 0..7 and 8..15 into register
/// classes. Returns the combined class of both eightbytes, so callers see
/// MEM and NYI bits without re-inspecting `rcl`.
pub fn classify_struct(
    cts: &CTypeTable,
    id: CTypeId,
    rcl: &mut [RegClass; 2],
    ofs: usize,
) -> RegClass {
    let ct = cts.get(id);
    if ct.size > 16 {
        rcl[0] |= RegClass::MEM; // Too big, gets memory class.
        return rcl[0] | rcl[1];
    }
    if let CTypeKind::Struct { ref fields, .. } = ct.kind {
        for f in fields {
            let fofs = ofs + f.offset;
            if f.bits.is_some() {
                rcl[(fofs >= 8) as usize] |= RegClass::INT;
            } else {
                classify_ct(cts, f.ty, rcl, fofs);
            }
        }
    }
    rcl[0] | rcl[1]
}

/// Try to place a classified small struct into registers. Commits counters
/// only on success so an overflow falls back to the stack cleanly.
unsafe fn struct_reg(ctx: &mut SetupCtx, dp: &[u64; 2], rcl: &[RegClass; 2]) -> bool {
    let mut ngpr = ctx.ngpr;
    let mut nfpr = ctx.nfpr;
    for i in 0..2 {
        debug_assert!(!rcl[i].contains(RegClass::MEM));
        if rcl[i].contains(RegClass::INT) {
            // Integer class takes precedence.
            if ngpr >= ctx.abi.nreg_gpr {
                return true; // Register overflow.
            }
            ctx.cc.gpr[ngpr] = dp[i];
            ngpr += 1;
        } else if rcl[i].contains(RegClass::SSE) {
            if nfpr >= ctx.abi.nreg_fpr {
                return true;
            }
            ctx.cc.fpr[nfpr].l[0] = dp[i];
            nfpr += 1;
        }
    }
    ctx.ngpr = ngpr;
    ctx.nfpr = nfpr;
    false
}

/// Convert and place a register-classified struct argument.
unsafe fn x64_struct_arg(
    ctx: &mut SetupCtx,
    did: CTypeId,
    rcl: &[RegClass; 2],
    o: Value,
    _narg: usize,
) -> VmResult<()> {
    // Convert through the scratch buffer into two eightbytes.
    let buf = mem::sbuf_need(ctx.g, 16)?;
    std::ptr::write_bytes(buf, 0, 16);
    cconv::ct_tv(ctx.g, did, buf, o, ConvFlags::empty())?;
    let mut dp = [0u64; 2];
    std::ptr::copy_nonoverlapping(buf, dp.as_mut_ptr() as *mut u8, 16);
    if struct_reg(ctx, &dp, rcl) {
        // Register overflow: the whole struct goes to the stack.
        let n = if rcl[1].is_empty() { 1 } else { 2 };
        if ctx.nsp + n > MAX_STACK_SLOTS {
            return Err(VmError::FfiNyiCall);
        }
        let dst = ctx.stack_ptr(ctx.nsp);
        std::ptr::copy_nonoverlapping(dp.as_ptr() as *const u8, dst, n * 8);
        ctx.nsp += n;
    }
    Ok(())
}

// -- Shared hook bodies --------------------------------------------------

unsafe fn noop_postarg(_ctx: &mut SetupCtx, _isfp: u8, _isva: bool, _n: usize, _dp: *mut u8) {}

/// Default struct-return reassembly: copy from the GPR area.
unsafe fn gpr_structret2(
    g: &mut GlobalState,
    cc: &mut CallState,
    ret: CTypeId,
    dp: *mut u8,
) -> VmResult<()> {
    // Size is bounded by the by-value return rules of the target.
    let sz = g.cts.size(ret).min(16);
    std::ptr::copy_nonoverlapping(cc.gpr.as_ptr() as *const u8, dp, sz);
    Ok(())
}

/// Copy a complex float out of the first GPR.
unsafe fn gpr_complexret2(cc: &mut CallState, _sz: usize, dp: *mut u8) {
    std::ptr::copy_nonoverlapping(cc.gpr.as_ptr() as *const u8, dp, 8);
}

unsafe fn push_retptr_stack(ctx: &mut SetupCtx, dp: *mut u8) -> VmResult<()> {
    if ctx.nsp + 1 > MAX_STACK_SLOTS {
        return Err(VmError::FfiNyiCall);
    }
    let slot = ctx.stack_ptr(ctx.nsp);
    cconv::write_int(slot, dp as usize as u64, ctx.abi.ptr_size);
    ctx.nsp += 1;
    Ok(())
}

unsafe fn push_retptr_gpr_or_stack(ctx: &mut SetupCtx, dp: *mut u8) -> VmResult<()> {
    if ctx.ngpr < ctx.maxgpr {
        ctx.cc.gpr[ctx.ngpr] = dp as usize as u64;
        ctx.ngpr += 1;
        Ok(())
    } else {
        push_retptr_stack(ctx, dp)
    }
}

/// Allocate a temporary cdata for a by-reference argument.
unsafe fn byref_temp(ctx: &mut SetupCtx, did: CTypeId, sz: &mut usize) -> VmResult<ArgDisp> {
    let cd = udata::new_cdata(ctx.g, did, *sz)?;
    *sz = ctx.abi.ptr_size;
    Ok(ArgDisp::ByRef((*cd.as_ptr()).payload()))
}

// -- x86 (Windows and SysV) ----------------------------------------------

unsafe fn x86win_structret(ctx: &mut SetupCtx, sz: usize, dp: *mut u8) -> VmResult<()> {
    // Return structs bigger than 8 by reference (on stack only).
    ctx.cc.retref = sz > 8;
    if ctx.cc.retref {
        push_retptr_stack(ctx, dp)?;
    }
    Ok(())
}

unsafe fn x86_structret(ctx: &mut SetupCtx, _sz: usize, dp: *mut u8) -> VmResult<()> {
    // Return all structs by reference (in reg or on stack).
    ctx.cc.retref = true;
    push_retptr_gpr_or_stack(ctx, dp)
}

unsafe fn x86_complexret(ctx: &mut SetupCtx, sz: usize, dp: *mut u8) -> VmResult<()> {
    // Return complex float in GPRs and complex double by reference.
    ctx.cc.retref = sz > 8;
    if ctx.cc.retref {
        push_retptr_gpr_or_stack(ctx, dp)?;
    }
    Ok(())
}

unsafe fn x86_structarg(
    ctx: &mut SetupCtx,
    _did: CTypeId,
    _sz: &mut usize,
    _o: Value,
    _narg: usize,
) -> VmResult<ArgDisp> {
    // Pass all structs by value on the stack; later words must not be
    // reordered into registers.
    ctx.ngpr = ctx.maxgpr;
    Ok(ArgDisp::Fallthrough)
}

unsafe fn x86_complexarg(
    _ctx: &mut SetupCtx,
    _did: CTypeId,
    _sz: &mut usize,
    isfp: &mut u8,
) -> VmResult<ArgDisp> {
    *isfp = 1; // Pass complex by value on the stack.
    Ok(ArgDisp::Fallthrough)
}

unsafe fn x86_regarg(ctx: &mut SetupCtx, isfp: u8, n: usize) -> Option<*mut u8> {
    if isfp != 0 {
        return None; // Only non-FP values may be passed in registers.
    }
    if n > 1 {
        // Anything > 32 bit is passed on the stack.
        if ctx.abi.target == AbiTarget::X86Sysv {
            ctx.ngpr = ctx.maxgpr; // Prevent reordering.
        }
        return None;
    }
    if ctx.ngpr + 1 <= ctx.maxgpr {
        let dp = ctx.gpr_ptr(ctx.ngpr);
        ctx.ngpr += 1;
        Some(dp)
    } else {
        None
    }
}

// -- Windows/x64 ---------------------------------------------------------

unsafe fn x64win_structret(ctx: &mut SetupCtx, sz: usize, dp: *mut u8) -> VmResult<()> {
    // Return structs of size 1, 2, 4 or 8 in a GPR.
    ctx.cc.retref = !(sz == 1 || sz == 2 || sz == 4 || sz == 8);
    if ctx.cc.retref {
        ctx.cc.gpr[ctx.ngpr] = dp as usize as u64;
        ctx.ngpr += 1;
    }
    Ok(())
}

unsafe fn x64win_structarg(
    ctx: &mut SetupCtx,
    did: CTypeId,
    sz: &mut usize,
    _o: Value,
    _narg: usize,
) -> VmResult<ArgDisp> {
    // Size 1, 2, 4 or 8 goes in a GPR by value; everything else by
    // reference through a temporary.
    if *sz == 1 || *sz == 2 || *sz == 4 || *sz == 8 {
        Ok(ArgDisp::Fallthrough)
    } else {
        byref_temp(ctx, did, sz)
    }
}

unsafe fn x64win_complexarg(
    ctx: &mut SetupCtx,
    did: CTypeId,
    sz: &mut usize,
    _isfp: &mut u8,
) -> VmResult<ArgDisp> {
    // Complex float in a GPR, complex double by reference.
    if *sz != 8 {
        byref_temp(ctx, did, sz)
    } else {
        Ok(ArgDisp::Fallthrough)
    }
}

unsafe fn x64win_regarg(ctx: &mut SetupCtx, isfp: u8, _n: usize) -> Option<*mut u8> {
    // Windows/x64 argument registers are strictly positional.
    if ctx.ngpr >= 4 {
        return None;
    }
    let dp = if isfp != 0 {
        let p = ctx.fpr_ptr(ctx.ngpr);
        ctx.nfpr = ctx.ngpr + 1;
        p
    } else {
        ctx.gpr_ptr(ctx.ngpr)
    };
    ctx.ngpr += 1;
    Some(dp)
}

unsafe fn x64win_postarg(ctx: &mut SetupCtx, _isfp: u8, isva: bool, _n: usize, _dp: *mut u8) {
    if isva && ctx.ngpr > 0 && ctx.ngpr <= 4 {
        // Varargs are mirrored in both register sets.
        let i = ctx.ngpr - 1;
        if ctx.nfpr == ctx.ngpr {
            ctx.cc.gpr[i] = ctx.cc.fpr[i].l[0];
        } else {
            ctx.cc.fpr[i].l[0] = ctx.cc.gpr[i];
        }
    }
}

// -- POSIX/x64 -----------------------------------------------------------

unsafe fn x64_structret(ctx: &mut SetupCtx, _sz: usize, dp: *mut u8) -> VmResult<()> {
    let mut rcl = [RegClass::empty(); 2];
    let cl = classify_struct(&ctx.g.cts, ctx.ret_id, &mut rcl, 0);
    if cl.contains(RegClass::NYI) {
        return Err(VmError::FfiNyiCall);
    }
    if cl.contains(RegClass::MEM) {
        ctx.cc.retref = true; // Return struct by reference.
        ctx.cc.gpr[ctx.ngpr] = dp as usize as u64;
        ctx.ngpr += 1;
    } else {
        ctx.cc.retref = false; // Return small structs in registers.
    }
    Ok(())
}

unsafe fn x64_complexret(ctx: &mut SetupCtx, _sz: usize, _dp: *mut u8) -> VmResult<()> {
    // Complex values are returned in one or two FPRs.
    ctx.cc.retref = false;
    Ok(())
}

unsafe fn x64_structarg(
    ctx: &mut SetupCtx,
    did: CTypeId,
    _sz: &mut usize,
    o: Value,
    narg: usize,
) -> VmResult<ArgDisp> {
    let mut rcl = [RegClass::empty(); 2];
    let cl = classify_struct(&ctx.g.cts, did, &mut rcl, 0);
    if cl.contains(RegClass::NYI) {
        return Err(VmError::FfiNyiCall);
    }
    if cl.contains(RegClass::MEM) {
        // Pass all other structs by value on the stack.
        return Ok(ArgDisp::Fallthrough);
    }
    x64_struct_arg(ctx, did, &rcl, o, narg)?;
    Ok(ArgDisp::Done)
}

unsafe fn x64_complexarg(
    _ctx: &mut SetupCtx,
    _did: CTypeId,
    _sz: &mut usize,
    isfp: &mut u8,
) -> VmResult<ArgDisp> {
    *isfp = 2; // FPRs or stack; needs postprocessing.
    Ok(ArgDisp::Fallthrough)
}

unsafe fn x64_regarg(ctx: &mut SetupCtx, isfp: u8, n: usize) -> Option<*mut u8> {
    if isfp != 0 {
        if ctx.nfpr + n <= ctx.abi.nreg_fpr {
            let dp = ctx.fpr_ptr(ctx.nfpr);
            ctx.nfpr += n;
            return Some(dp);
        }
    } else {
        // Reordering is explicitly allowed in the x64 ABI.
        if n <= 2 && ctx.ngpr + n <= ctx.maxgpr {
            let dp = ctx.gpr_ptr(ctx.ngpr);
            ctx.ngpr += n;
            return Some(dp);
        }
    }
    None
}

unsafe fn x64_postarg(ctx: &mut SetupCtx, isfp: u8, _isva: bool, n: usize, dp: *mut u8) {
    // A complex double written into one FPR slot must be split across two.
    if isfp == 2 && n == 2 && ctx.nfpr >= 2 && dp == ctx.fpr_ptr(ctx.nfpr - 2) {
        let hi = ctx.cc.fpr[ctx.nfpr - 2].d[1];
        ctx.cc.fpr[ctx.nfpr - 1].d[0] = hi;
        ctx.cc.fpr[ctx.nfpr - 2].d[1] = 0.0;
    }
}

unsafe fn x64_structret2(
    g: &mut GlobalState,
    cc: &mut CallState,
    ret: CTypeId,
    dp: *mut u8,
) -> VmResult<()> {
    let mut rcl = [RegClass::empty(); 2];
    classify_struct(&g.cts, ret, &mut rcl, 0);
    let sz = g.cts.size(ret);
    let mut sp = [0u64; 2];
    let mut ngpr = 0;
    let mut nfpr = 0;
    for i in 0..2 {
        if rcl[i].contains(RegClass::INT) {
            sp[i] = cc.gpr[ngpr];
            ngpr += 1;
        } else if rcl[i].contains(RegClass::SSE) {
            sp[i] = cc.fpr[nfpr].l[0];
            nfpr += 1;
        }
    }
    std::ptr::copy_nonoverlapping(sp.as_ptr() as *const u8, dp, sz);
    Ok(())
}

unsafe fn x64_complexret2(cc: &mut CallState, sz: usize, dp: *mut u8) {
    if sz == 8 {
        // Copy complex float from one FPR.
        cconv::write_int(dp, cc.fpr[0].l[0], 8);
    } else {
        // Copy non-contiguous complex double from two FPRs.
        cconv::write_int(dp, cc.fpr[0].l[0], 8);
        cconv::write_int(dp.add(8), cc.fpr[1].l[0], 8);
    }
}

// -- PPC/SPE -------------------------------------------------------------

unsafe fn ppc_structret(ctx: &mut SetupCtx, _sz: usize, dp: *mut u8) -> VmResult<()> {
    ctx.cc.retref = true; // Return all structs by reference.
    ctx.cc.gpr[ctx.ngpr] = dp as usize as u64;
    ctx.ngpr += 1;
    Ok(())
}

unsafe fn ppc_complexret(ctx: &mut SetupCtx, _sz: usize, _dp: *mut u8) -> VmResult<()> {
    ctx.cc.retref = false; // Complex values come back in 2 or 4 GPRs.
    Ok(())
}

unsafe fn ppc_structarg(
    ctx: &mut SetupCtx,
    did: CTypeId,
    sz: &mut usize,
    _o: Value,
    _narg: usize,
) -> VmResult<ArgDisp> {
    byref_temp(ctx, did, sz) // Pass all structs by reference.
}

unsafe fn ppc_complexarg(
    _ctx: &mut SetupCtx,
    _did: CTypeId,
    _sz: &mut usize,
    _isfp: &mut u8,
) -> VmResult<ArgDisp> {
    // Pass complex by value in 2 or 4 GPRs.
    Ok(ArgDisp::Fallthrough)
}

unsafe fn ppc_regarg(ctx: &mut SetupCtx, _isfp: u8, n: usize) -> Option<*mut u8> {
    // Softfp ABI: everything goes through GPRs.
    if n > 1 {
        debug_assert!(n == 2 || n == 4); // int64_t, double or complex.
        if n == 2 {
            ctx.ngpr = (ctx.ngpr + 1) & !1; // Align 64-bit value to regpair.
        } else if ctx.ngpr + n > ctx.maxgpr {
            ctx.ngpr = ctx.maxgpr; // Prevent reordering.
        }
    }
    if ctx.ngpr + n <= ctx.maxgpr {
        let dp = ctx.gpr_ptr(ctx.ngpr);
        ctx.ngpr += n;
        Some(dp)
    } else {
        None
    }
}

unsafe fn ppc_complexret2(cc: &mut CallState, sz: usize, dp: *mut u8) {
    std::ptr::copy_nonoverlapping(cc.gpr.as_ptr() as *const u8, dp, sz);
}

// -- Descriptor table ----------------------------------------------------

pub static X86_WIN: AbiDesc = AbiDesc {
    name: "x86-windows",
    target: AbiTarget::X86Win,
    ptr_size: 4,
    nreg_gpr: 0,
    nreg_fpr: 0,
    sps_free: 0,
    sps_extra: 0,
    align_stackarg: false,
    vector_reg: false,
    structret: x86win_structret,
    complexret: x86win_structret,
    structarg: x86_structarg,
    complexarg: x86_complexarg,
    regarg: x86_regarg,
    postarg: noop_postarg,
    structret2: gpr_structret2,
    complexret2: gpr_complexret2,
};

pub static X86_SYSV: AbiDesc = AbiDesc {
    name: "x86-sysv",
    target: AbiTarget::X86Sysv,
    ptr_size: 4,
    nreg_gpr: 0,
    nreg_fpr: 0,
    sps_free: 0,
    sps_extra: 0,
    align_stackarg: false,
    vector_reg: false,
    structret: x86_structret,
    complexret: x86_complexret,
    structarg: x86_structarg,
    complexarg: x86_complexarg,
    regarg: x86_regarg,
    postarg: noop_postarg,
    structret2: gpr_structret2,
    complexret2: gpr_complexret2,
};

pub static X64_WIN: AbiDesc = AbiDesc {
    name: "x64-windows",
    target: AbiTarget::X64Win,
    ptr_size: 8,
    nreg_gpr: 4,
    nreg_fpr: 4,
    sps_free: 4,
    sps_extra: 0,
    align_stackarg: false,
    vector_reg: true,
    structret: x64win_structret,
    complexret: x64win_structret,
    structarg: x64win_structarg,
    complexarg: x64win_complexarg,
    regarg: x64win_regarg,
    postarg: x64win_postarg,
    structret2: gpr_structret2,
    complexret2: gpr_complexret2,
};

pub static X64_SYSV: AbiDesc = AbiDesc {
    name: "x64-sysv",
    target: AbiTarget::X64Sysv,
    ptr_size: 8,
    nreg_gpr: 6,
    nreg_fpr: 8,
    sps_free: 2,
    sps_extra: 0,
    align_stackarg: true,
    vector_reg: true,
    structret: x64_structret,
    complexret: x64_complexret,
    structarg: x64_structarg,
    complexarg: x64_complexarg,
    regarg: x64_regarg,
    postarg: x64_postarg,
    structret2: x64_structret2,
    complexret2: x64_complexret2,
};

pub static PPC_SPE: AbiDesc = AbiDesc {
    name: "ppc-spe",
    target: AbiTarget::PpcSpe,
    ptr_size: 4,
    nreg_gpr: 8,
    nreg_fpr: 0,
    sps_free: 8,
    sps_extra: 2,
    align_stackarg: true,
    vector_reg: false,
    structret: ppc_structret,
    complexret: ppc_complexret,
    structarg: ppc_structarg,
    complexarg: ppc_complexarg,
    regarg: ppc_regarg,
    postarg: noop_postarg,
    structret2: gpr_structret2,
    complexret2: ppc_complexret2,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::ctype::{self, CField, CTypeTable};

    fn classify(cts: &CTypeTable, id: ctype::CTypeId) -> ([RegClass; 2], RegClass) {
        let mut rcl = [RegClass::empty(); 2];
        let cl = classify_struct(cts, id, &mut rcl, 0);
        (rcl, cl)
    }

    #[test]
    fn integer_pair_takes_one_int_eightbyte() {
        let mut cts = CTypeTable::new(8);
        let id = cts.struct_of(&[ctype::INT32, ctype::INT32], false);
        let (rcl, cl) = classify(&cts, id);
        assert_eq!(rcl[0], RegClass::INT);
        assert!(rcl[1].is_empty());
        assert!(!cl.contains(RegClass::MEM));
    }

    #[test]
    fn double_pair_takes_two_sse_eightbytes() {
        let mut cts = CTypeTable::new(8);
        let id = cts.struct_of(&[ctype::DOUBLE, ctype::DOUBLE], false);
        let (rcl, cl) = classify(&cts, id);
        assert_eq!(rcl[0], RegClass::SSE);
        assert_eq!(rcl[1], RegClass::SSE);
        assert!(!cl.contains(RegClass::MEM));
    }

    #[test]
    fn int_and_float_share_an_eightbyte() {
        let mut cts = CTypeTable::new(8);
        let id = cts.struct_of(&[ctype::INT32, ctype::FLOAT], false);
        let (rcl, _) = classify(&cts, id);
        assert!(rcl[0].contains(RegClass::INT));
        assert!(rcl[0].contains(RegClass::SSE));
    }

    #[test]
    fn oversized_struct_is_memory_class() {
        let mut cts = CTypeTable::new(8);
        let id = cts.struct_of(&[ctype::DOUBLE, ctype::DOUBLE, ctype::DOUBLE], false);
        let (_, cl) = classify(&cts, id);
        assert!(cl.contains(RegClass::MEM));
    }

    #[test]
    fn unaligned_member_is_memory_class() {
        let mut cts = CTypeTable::new(8);
        let id = cts.raw_struct(
            vec![
                CField {
                    ty: ctype::INT32,
                    offset: 0,
                    bits: None,
                },
                CField {
                    ty: ctype::DOUBLE,
                    offset: 4,
                    bits: None,
                },
            ],
            12,
            4,
            false,
        );
        let (_, cl) = classify(&cts, id);
        assert!(cl.contains(RegClass::MEM));
    }

    #[test]
    fn bitfields_classify_as_int() {
        let mut cts = CTypeTable::new(8);
        let id = cts.raw_struct(
            vec![CField {
                ty: ctype::INT32,
                offset: 0,
                bits: Some((0, 7)),
            }],
            4,
            4,
            false,
        );
        let (rcl, cl) = classify(&cts, id);
        assert_eq!(rcl[0], RegClass::INT);
        assert!(!cl.contains(RegClass::MEM));
    }

    #[test]
    fn union_members_merge_classes() {
        let mut cts = CTypeTable::new(8);
        let id = cts.struct_of(&[ctype::DOUBLE, ctype::INT64], true);
        let (rcl, _) = classify(&cts, id);
        assert!(rcl[0].contains(RegClass::INT));
        assert!(rcl[0].contains(RegClass::SSE));
    }

    #[test]
    fn nested_struct_classifies_recursively() {
        let mut cts = CTypeTable::new(8);
        let inner = cts.struct_of(&[ctype::FLOAT, ctype::FLOAT], false);
        let id = cts.struct_of(&[inner, ctype::DOUBLE], false);
        let (rcl, cl) = classify(&cts, id);
        assert_eq!(rcl[0], RegClass::SSE);
        assert_eq!(rcl[1], RegClass::SSE);
        assert!(!cl.contains(RegClass::MEM));
    }

    #[test]
    fn vector_member_is_rejected() {
        let mut cts = CTypeTable::new(8);
        let v2 = cts.vector_of(ctype::DOUBLE, 2);
        let id = cts.raw_struct(
            vec![CField {
                ty: v2,
                offset: 0,
                bits: None,
            }],
            16,
            16,
            false,
        );
        let (_, cl) = classify(&cts, id);
        assert!(cl.contains(RegClass::NYI));
    }
}
