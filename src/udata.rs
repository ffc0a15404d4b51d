//! Userdata and cdata objects. Payload bytes follow the struct inline.

use std::mem::size_of;
use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::error::VmResult;
use crate::ffi::ctype::CTypeId;
use crate::gc;
use crate::global::GlobalState;
use crate::header::{GcHeader, Tag};
use crate::mem;
use crate::table::Table;

/// Userdata: opaque payload with a metatable (whose `__gc` makes the object
/// finalizable) and an environment table.
#[repr(C)]
pub struct Udata {
    pub head: GcHeader,
    pub len: usize,
    pub metatable: *mut Table,
    pub env: *mut Table,
}

impl Udata {
    #[inline]
    pub fn payload(&self) -> *mut u8 {
        unsafe { (self as *const Udata as *mut u8).add(size_of::<Udata>()) }
    }

    #[inline]
    pub fn total_size(len: usize) -> usize {
        size_of::<Udata>() + len
    }
}

/// New userdata objects are linked directly behind the main thread on the
/// root list, so the finalizer separation pass only walks that suffix.
pub unsafe fn new_udata(g: &mut GlobalState, len: usize, env: *mut Table) -> VmResult<NonNull<Udata>> {
    let o = mem::new_obj(g, Udata::total_size(len), Tag::Udata)?;
    let ud = o as *mut Udata;
    (*ud).len = len;
    (*ud).metatable = std::ptr::null_mut();
    (*ud).env = env;
    std::ptr::write_bytes((*ud).payload(), 0, len);
    let main = g.mainthread as *mut GcHeader;
    (*o).next = (*main).next;
    (*main).next = o;
    Ok(NonNull::new_unchecked(ud))
}

pub unsafe fn free_udata(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Udata);
    let len = (*(o as *mut Udata)).len;
    mem::free(g, o as *mut c_void, Udata::total_size(len));
}

pub unsafe fn set_metatable(g: &mut GlobalState, ud: *mut Udata, mt: *mut Table) {
    (*ud).metatable = mt;
    if !mt.is_null() && (*ud).head.marked.black() && (*mt).head.marked.is_white() {
        gc::barrier_f(g, ud as *mut GcHeader, mt as *mut GcHeader);
    }
}

/// Cdata: foreign-typed bytes declared by a C type table entry.
#[repr(C)]
pub struct Cdata {
    pub head: GcHeader,
    pub ctypeid: CTypeId,
    pub len: usize,
}

impl Cdata {
    #[inline]
    pub fn payload(&self) -> *mut u8 {
        unsafe { (self as *const Cdata as *mut u8).add(size_of::<Cdata>()) }
    }

    #[inline]
    pub fn total_size(len: usize) -> usize {
        size_of::<Cdata>() + len
    }
}

pub unsafe fn new_cdata(g: &mut GlobalState, id: CTypeId, len: usize) -> VmResult<NonNull<Cdata>> {
    let o = mem::new_gco(g, Cdata::total_size(len), Tag::Cdata)?;
    let cd = o as *mut Cdata;
    (*cd).ctypeid = id;
    (*cd).len = len;
    std::ptr::write_bytes((*cd).payload(), 0, len);
    Ok(NonNull::new_unchecked(cd))
}

pub unsafe fn free_cdata(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Cdata);
    let len = (*(o as *mut Cdata)).len;
    mem::free(g, o as *mut c_void, Cdata::total_size(len));
}
