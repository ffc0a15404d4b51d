//! End-to-end collector and marshaller scenarios.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::VmError;
use crate::ffi::{self, abi, ctype, CallState};
use crate::gc;
use crate::global::{GcPhase, Runtime};
use crate::header::GcHeader;
use crate::strtab;
use crate::table;
use crate::thread;
use crate::udata;
use crate::value::Value;
use crate::{func, GlobalState};

unsafe fn cycle(g: &mut GlobalState) {
    let l = g.mainthread;
    gc::full_gc(g, l).unwrap();
}

#[test]
fn cyclic_tables_are_collected() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        cycle(g);
        let before = g.gc.total;

        let t1 = table::new(g, 2, 0).unwrap();
        let t2 = table::new(g, 2, 0).unwrap();
        table::set(g, t1.as_ptr(), Value::Num(1.0), Value::Tab(t2)).unwrap();
        table::set(g, t2.as_ptr(), Value::Num(1.0), Value::Tab(t1)).unwrap();
        let sizes = (*t1.as_ptr()).total_size() + (*t2.as_ptr()).total_size();

        g.set_gcroot(0, Value::Tab(t1));
        cycle(g);
        gc::assert_mmudata_ring(g);
        assert!(g.gc.total >= before + sizes);

        // Make the cycle unreachable; both tables must go at once.
        g.set_gcroot(0, Value::Nil);
        cycle(g);
        gc::assert_mmudata_ring(g);
        assert_eq!(g.gc.total, before);
    }
}

#[test]
fn weak_value_table_is_cleared() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let mode_key = strtab::new_str(g, b"__mode").unwrap();
        let mode_v = strtab::new_str(g, b"v").unwrap();
        let mt = table::new(g, 0, 8).unwrap().as_ptr();
        table::set(g, mt, Value::Str(mode_key), Value::Str(mode_v)).unwrap();

        let t = table::new(g, 2, 0).unwrap();
        table::set_metatable(g, t.as_ptr(), mt);
        let ud = udata::new_udata(g, 16, null_mut()).unwrap();
        table::set(g, t.as_ptr(), Value::Num(1.0), Value::Udata(ud)).unwrap();
        g.set_gcroot(0, Value::Tab(t));

        cycle(g);
        // The userdata had no strong reference: the weak slot reads nil and
        // the table itself stays live.
        assert!(table::get(t.as_ptr(), Value::Num(1.0)).is_nil());
        assert_eq!(table::get(t.as_ptr(), Value::Num(1.0)), Value::Nil);
        g.set_gcroot(0, Value::Nil);
    }
}

fn resurrecting_finalizer(
    g: &mut GlobalState,
    _l: *mut crate::thread::Thread,
    v: Value,
) -> crate::error::VmResult<()> {
    let count = match g.gcroot(3) {
        Value::Num(n) => n,
        _ => 0.0,
    };
    g.set_gcroot(1, v); // Resurrect.
    g.set_gcroot(3, Value::Num(count + 1.0));
    Ok(())
}

#[test]
fn finalizer_runs_exactly_once_and_resurrects() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        cycle(g);
        let baseline = g.gc.total;

        let gc_key = strtab::new_str(g, b"__gc").unwrap();
        let fin = func::new_native(g, resurrecting_finalizer, 0, null_mut()).unwrap();
        let mt = table::new(g, 0, 8).unwrap().as_ptr();
        table::set(g, mt, Value::Str(gc_key), Value::Func(fin)).unwrap();
        g.set_gcroot(2, Value::Tab(std::ptr::NonNull::new_unchecked(mt)));

        let ud = udata::new_udata(g, 8, null_mut()).unwrap();
        udata::set_metatable(g, ud.as_ptr(), mt);
        let udsize = crate::udata::Udata::total_size(8);

        // No direct references left: the first cycle runs __gc exactly once
        // and the object is resurrected through gcroot(1).
        cycle(g);
        gc::assert_mmudata_ring(g);
        assert_eq!(g.gcroot(3), Value::Num(1.0));
        assert_eq!(g.gcroot(1), Value::Udata(ud));

        // A second cycle must not run the finalizer again.
        cycle(g);
        assert_eq!(g.gcroot(3), Value::Num(1.0));

        // Dropping the resurrection reference frees the object for real.
        let with_ud = g.gc.total;
        g.set_gcroot(1, Value::Nil);
        cycle(g);
        assert_eq!(g.gcroot(3), Value::Num(1.0));
        assert_eq!(g.gc.total, with_ud - udsize);
        assert!(g.gc.total > baseline); // mt and closure still anchored
        g.set_gcroot(2, Value::Nil);
    }
}

#[test]
fn backward_barrier_requeues_black_table_once_per_cycle() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let l = g.mainthread;
        let t = table::new(g, 0, 8).unwrap().as_ptr();
        g.set_gcroot(0, Value::Tab(std::ptr::NonNull::new_unchecked(t)));

        // Tiny steps so the cycle pauses inside propagation.
        g.gc.stepmul = 1;
        let mut seen_black = false;
        for _ in 0..10_000 {
            if gc::step(g, l).unwrap() != 0 {
                break;
            }
            gc::assert_tricolor(g);
            if g.gc.state == GcPhase::Propagate && (*t).head.marked.black() {
                seen_black = true;
                let v1 = strtab::new_str(g, b"barrier victim 1").unwrap();
                table::set(g, t, Value::Num(1.5), Value::Str(v1)).unwrap();
                assert!((*t).head.marked.is_gray());
                assert_eq!(count_on_list(g.gc.grayagain, t as *mut GcHeader), 1);

                // A second store must not enqueue the table twice.
                let v2 = strtab::new_str(g, b"barrier victim 2").unwrap();
                table::set(g, t, Value::Num(2.5), Value::Str(v2)).unwrap();
                assert_eq!(count_on_list(g.gc.grayagain, t as *mut GcHeader), 1);

                // Finish the cycle; the stored values must survive the sweep.
                while gc::step(g, l).unwrap() == 0 {}
                break;
            }
        }
        assert!(seen_black, "table never turned black during propagation");
        assert_eq!(g.gc.state, GcPhase::Pause);
        assert!(g.gc.gray.is_null() && g.gc.grayagain.is_null() && g.gc.weak.is_null());
        match table::get(t, Value::Num(1.5)) {
            Value::Str(s) => assert_eq!((*s.as_ptr()).as_bytes(), b"barrier victim 1"),
            v => panic!("barrier-protected value lost: {:?}", v),
        }
        g.set_gcroot(0, Value::Nil);
    }
}

unsafe fn count_on_list(mut head: *mut GcHeader, o: *mut GcHeader) -> usize {
    let mut n = 0;
    while !head.is_null() {
        if head == o {
            n += 1;
        }
        head = (*head).gclist;
    }
    n
}

#[test]
fn full_gc_is_idempotent() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let t = table::new(g, 8, 8).unwrap();
        g.set_gcroot(0, Value::Tab(t));
        cycle(g);
        let total = g.gc.total;
        cycle(g);
        assert_eq!(g.gc.total, total);
        cycle(g);
        assert_eq!(g.gc.total, total);
    }
}

#[test]
fn finished_step_leaves_empty_worklists() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let l = g.mainthread;
        for _ in 0..16 {
            let t = table::new(g, 4, 0).unwrap();
            g.set_gcroot(0, Value::Tab(t));
        }
        loop {
            if gc::step(g, l).unwrap() == 1 {
                break;
            }
        }
        assert_eq!(g.gc.state, GcPhase::Pause);
        assert!(g.gc.gray.is_null());
        assert!(g.gc.grayagain.is_null());
        assert!(g.gc.weak.is_null());
    }
}

#[test]
fn single_step_work_is_bounded() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let l = g.mainthread;
        let anchor = table::new(g, 0, 128).unwrap().as_ptr();
        g.set_gcroot(0, Value::Tab(std::ptr::NonNull::new_unchecked(anchor)));
        for i in 0..200 {
            let t = table::new(g, 8, 0).unwrap();
            table::set(g, anchor, Value::Num(i as f64), Value::Tab(t)).unwrap();
        }
        g.gc.stepmul = 1;
        // A single tiny step cannot complete a whole cycle over 200 tables.
        assert_eq!(gc::step(g, l).unwrap(), 0);
        assert_ne!(g.gc.state, GcPhase::Pause);
        while gc::step(g, l).unwrap() == 0 {}
        g.set_gcroot(0, Value::Nil);
    }
}

#[test]
fn unreferenced_strings_are_swept_fixed_strings_survive() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        cycle(g);
        let before = g.strtab.num;
        let s = strtab::new_str(g, b"an unanchored string").unwrap();
        let f = strtab::new_str(g, b"a fixed string").unwrap();
        strtab::fix_str(f);
        assert_eq!(g.strtab.num, before + 2);
        // Interning the same bytes yields the same object.
        let s2 = strtab::new_str(g, b"an unanchored string").unwrap();
        assert_eq!(s.as_ptr(), s2.as_ptr());
        cycle(g);
        assert_eq!(g.strtab.num, before + 1); // only the fixed one is left
        let f2 = strtab::new_str(g, b"a fixed string").unwrap();
        assert_eq!(f.as_ptr(), f2.as_ptr());
    }
}

#[test]
fn closed_upvalue_keeps_value_alive() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let l = g.mainthread;
        let s = strtab::new_str(g, b"upvalue payload").unwrap();
        let slot = (*l).top;
        thread::push(g, l, Value::Str(s)).unwrap();
        let uv = thread::find_upval(g, l, slot).unwrap();
        assert!(!(*uv.as_ptr()).closed);

        // A closure shares the upvalue; closing must preserve the value.
        let pt = func::new_proto(g, 4, 0, 0, 0).unwrap();
        let f = func::new_vm_func(g, pt.as_ptr(), 1, null_mut()).unwrap();
        if let func::FuncKind::Vm { upvals, .. } = (*f.as_ptr()).kind {
            *upvals = uv.as_ptr();
        }
        g.set_gcroot(0, Value::Func(f));

        thread::close_upvals(g, l, slot);
        (*l).top = slot; // Pop the stack slot away.
        assert!((*uv.as_ptr()).closed);
        cycle(g);
        cycle(g);
        match (*uv.as_ptr()).value() {
            Value::Str(v) => assert_eq!((*v.as_ptr()).as_bytes(), b"upvalue payload"),
            v => panic!("closed upvalue lost its value: {:?}", v),
        }
        g.set_gcroot(0, Value::Nil);
    }
}

#[test]
fn dead_stack_slots_are_cleared_to_frame_extent() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let l = g.mainthread;
        let fin = func::new_native(g, |_, _, _| Ok(()), 0, null_mut()).unwrap();
        let fslot = (*l).top;
        thread::push(g, l, Value::Func(fin)).unwrap();
        thread::push_frame(g, l, fslot, 12).unwrap();
        // Plant a stale value above the live top, inside the frame extent.
        let stale = strtab::new_str(g, b"stale slot").unwrap();
        *(*l).slot((*l).top + 3) = Value::Str(stale);
        cycle(g);
        assert!((*(*l).slot((*l).top + 3)).is_nil());
        thread::pop_frame(l);
    }
}

// -- FFI scenarios -------------------------------------------------------

unsafe fn push_call_frame(
    g: &mut GlobalState,
    cd: std::ptr::NonNull<crate::udata::Cdata>,
    args: &[Value],
) -> *mut crate::thread::Thread {
    let l = g.mainthread;
    (*l).base = (*l).top;
    thread::push(g, l, Value::Cdata(cd)).unwrap();
    for &a in args {
        thread::push(g, l, a).unwrap();
    }
    l
}

unsafe fn struct_ret_trampoline(cc: *mut CallState) {
    (*cc).fpr[0].d[0] = 1.5;
    (*cc).fpr[1].d[0] = 2.5;
}

#[test]
fn x64_sysv_struct_return_reassembles_from_fprs() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        g.ffi_abi = &abi::X64_SYSV;
        g.cts = ctype::CTypeTable::new(8);
        let sid = g.cts.struct_of(&[ctype::DOUBLE, ctype::DOUBLE], false);
        let fid = g.cts.func(sid, &[], false, ctype::CallConv::Cdecl);
        let cd = udata::new_cdata(g, fid, 8).unwrap();
        ffi::set_trampoline(g, struct_ret_trampoline);

        let l = push_call_frame(g, cd, &[]);
        let ret = ffi::call_func(g, l, cd.as_ptr()).unwrap();
        assert_eq!(ret, 1);

        let out = match *(*l).slot((*l).top - 1) {
            Value::Cdata(out) => out.as_ptr(),
            v => panic!("expected result cdata, got {:?}", v),
        };
        assert_eq!((*out).ctypeid, sid);
        let re = f64::from_le_bytes(*((*out).payload() as *const [u8; 8]));
        let im = f64::from_le_bytes(*((*out).payload().add(8) as *const [u8; 8]));
        assert_eq!((re, im), (1.5, 2.5));
    }
}

unsafe fn stdcall_trampoline(cc: *mut CallState) {
    (*cc).spadj = 4; // Callee cleaned the stack.
}

#[test]
fn x86_stdcall_is_autodetected_and_aborts_traces() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        g.ffi_abi = &abi::X86_WIN;
        g.cts = ctype::CTypeTable::new(4);
        let fid = g.cts.func(ctype::VOID, &[ctype::INT32], false, ctype::CallConv::Cdecl);
        let cd = udata::new_cdata(g, fid, 4).unwrap();
        ffi::set_trampoline(g, stdcall_trampoline);

        // Pretend a trace is being recorded across the call site.
        let tr = crate::trace::new_trace(g, 0).unwrap().as_ptr();
        g.jit.cur = tr;
        let aborts = g.jit.aborts;

        let l = push_call_frame(g, cd, &[Value::Num(42.0)]);
        assert_eq!(ffi::call_func(g, l, cd.as_ptr()).unwrap(), 0);

        match g.cts.get(fid).kind {
            ctype::CTypeKind::Func { conv, .. } => {
                assert_eq!(conv, ctype::CallConv::Stdcall)
            }
            _ => panic!("function type lost"),
        }
        assert!(g.jit.cur.is_null());
        assert_eq!(g.jit.aborts, aborts + 1);

        // Subsequent calls observe stdcall and do not re-abort.
        let l = push_call_frame(g, cd, &[Value::Num(7.0)]);
        assert_eq!(ffi::call_func(g, l, cd.as_ptr()).unwrap(), 0);
        assert_eq!(g.jit.aborts, aborts + 1);
        crate::trace::free_trace(g, tr);
    }
}

static CAP_GPR1: AtomicU64 = AtomicU64::new(0);
static CAP_FPR1: AtomicU64 = AtomicU64::new(0);

unsafe fn vararg_mirror_trampoline(cc: *mut CallState) {
    CAP_GPR1.store((*cc).gpr[1], Ordering::SeqCst);
    CAP_FPR1.store((*cc).fpr[1].l[0], Ordering::SeqCst);
}

#[test]
fn x64_windows_mirrors_fp_varargs_into_gprs() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        g.ffi_abi = &abi::X64_WIN;
        g.cts = ctype::CTypeTable::new(8);
        let fid = g.cts.func(
            ctype::VOID,
            &[ctype::INT32],
            true,
            ctype::CallConv::Cdecl,
        );
        let cd = udata::new_cdata(g, fid, 8).unwrap();
        ffi::set_trampoline(g, vararg_mirror_trampoline);

        // Second argument is a vararg number, inferred as double: it must
        // land in fpr[1] and be mirrored into gpr[1].
        let l = push_call_frame(g, cd, &[Value::Num(3.0), Value::Num(0.5)]);
        ffi::call_func(g, l, cd.as_ptr()).unwrap();
        assert_eq!(CAP_GPR1.load(Ordering::SeqCst), 0.5f64.to_bits());
        assert_eq!(CAP_FPR1.load(Ordering::SeqCst), 0.5f64.to_bits());
    }
}

static CAP_F0: AtomicU64 = AtomicU64::new(0);
static CAP_F0HI: AtomicU64 = AtomicU64::new(0);
static CAP_F1: AtomicU64 = AtomicU64::new(0);

unsafe fn complex_split_trampoline(cc: *mut CallState) {
    CAP_F0.store((*cc).fpr[0].l[0], Ordering::SeqCst);
    CAP_F0HI.store((*cc).fpr[0].l[1], Ordering::SeqCst);
    CAP_F1.store((*cc).fpr[1].l[0], Ordering::SeqCst);
}

#[test]
fn x64_sysv_complex_double_splits_across_fprs() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        g.ffi_abi = &abi::X64_SYSV;
        g.cts = ctype::CTypeTable::new(8);
        let cxd = g.cts.complex_of(ctype::DOUBLE);
        let fid = g.cts.func(ctype::VOID, &[cxd], false, ctype::CallConv::Cdecl);

        // Build a complex double cdata {re = 4.0, im = 9.0}.
        let arg = udata::new_cdata(g, cxd, 16).unwrap();
        (*arg.as_ptr())
            .payload()
            .cast::<f64>()
            .write_unaligned(4.0);
        (*arg.as_ptr())
            .payload()
            .add(8)
            .cast::<f64>()
            .write_unaligned(9.0);

        let cd = udata::new_cdata(g, fid, 8).unwrap();
        ffi::set_trampoline(g, complex_split_trampoline);
        let l = push_call_frame(g, cd, &[Value::Cdata(arg)]);
        ffi::call_func(g, l, cd.as_ptr()).unwrap();

        assert_eq!(CAP_F0.load(Ordering::SeqCst), 4.0f64.to_bits());
        assert_eq!(CAP_F0HI.load(Ordering::SeqCst), 0); // upper half zeroed
        assert_eq!(CAP_F1.load(Ordering::SeqCst), 9.0f64.to_bits());
    }
}

unsafe fn noop_trampoline(_cc: *mut CallState) {}

#[test]
fn argument_count_mismatch_is_rejected() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        g.ffi_abi = &abi::X64_SYSV;
        g.cts = ctype::CTypeTable::new(8);
        let fid = g.cts.func(
            ctype::VOID,
            &[ctype::INT32, ctype::DOUBLE],
            false,
            ctype::CallConv::Cdecl,
        );
        let cd = udata::new_cdata(g, fid, 8).unwrap();
        ffi::set_trampoline(g, noop_trampoline);

        let l = push_call_frame(g, cd, &[Value::Num(1.0)]);
        match ffi::call_func(g, l, cd.as_ptr()) {
            Err(VmError::FfiNumArgs) => {}
            r => panic!("expected FfiNumArgs, got {:?}", r.map_err(|e| e.to_string())),
        }

        let l = push_call_frame(
            g,
            cd,
            &[Value::Num(1.0), Value::Num(2.0), Value::Num(3.0)],
        );
        match ffi::call_func(g, l, cd.as_ptr()) {
            Err(VmError::FfiNumArgs) => {}
            r => panic!("expected FfiNumArgs, got {:?}", r.map_err(|e| e.to_string())),
        }
    }
}

#[test]
fn struct_with_vector_field_is_rejected() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        g.ffi_abi = &abi::X64_SYSV;
        g.cts = ctype::CTypeTable::new(8);
        let v4 = g.cts.vector_of(ctype::FLOAT, 4);
        let sid = g.cts.raw_struct(
            vec![ctype::CField {
                ty: v4,
                offset: 0,
                bits: None,
            }],
            16,
            16,
            false,
        );
        let fid = g.cts.func(ctype::VOID, &[sid], false, ctype::CallConv::Cdecl);
        let cd = udata::new_cdata(g, fid, 8).unwrap();
        ffi::set_trampoline(g, noop_trampoline);

        let arg = udata::new_cdata(g, sid, 16).unwrap();
        let l = push_call_frame(g, cd, &[Value::Cdata(arg)]);
        match ffi::call_func(g, l, cd.as_ptr()) {
            Err(VmError::FfiNyiCall) => {}
            r => panic!("expected FfiNyiCall, got {:?}", r.map_err(|e| e.to_string())),
        }
    }
}

#[test]
fn not_a_function_returns_minus_one() {
    let mut rt = Runtime::new().unwrap();
    unsafe {
        let g = rt.global_mut();
        let cd = udata::new_cdata(g, ctype::INT32, 4).unwrap();
        let l = g.mainthread;
        (*l).base = (*l).top;
        assert_eq!(ffi::call_func(g, l, cd.as_ptr()).unwrap(), -1);
    }
}
