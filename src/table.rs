//! Table objects: an array part for dense integer keys and an open-addressed
//! hash part for everything else.
//!
//! Removed hash entries keep their key in place flagged as a dead key so
//! probe sequences stay intact; the GC turns collectable keys of empty slots
//! into dead keys during traversal and weak clearing.

use std::mem::size_of;
use std::os::raw::c_void;
use std::ptr::{null_mut, NonNull};

use crate::error::VmResult;
use crate::gc;
use crate::global::GlobalState;
use crate::header::{GcHeader, Tag};
use crate::mem;
use crate::value::{Node, Value};

#[repr(C)]
pub struct Table {
    pub head: GcHeader,
    pub array: *mut Value,
    pub asize: usize,
    pub node: *mut Node,
    pub hmask: usize,
    pub hnum: usize,
    pub metatable: *mut Table,
}

impl Table {
    #[inline]
    pub unsafe fn array_slot(&self, i: usize) -> *mut Value {
        debug_assert!(i < self.asize);
        self.array.add(i)
    }

    #[inline]
    pub unsafe fn node_slot(&self, i: usize) -> *mut Node {
        debug_assert!(i <= self.hmask);
        self.node.add(i)
    }

    /// Bytes attributed to this table for sweep accounting and mark cost.
    pub fn total_size(&self) -> usize {
        let mut sz = size_of::<Table>() + self.asize * size_of::<Value>();
        if !self.node.is_null() {
            sz += (self.hmask + 1) * size_of::<Node>();
        }
        sz
    }
}

/// Integer index into the array part, if the key is one.
#[inline]
fn array_index(key: Value, asize: usize) -> Option<usize> {
    if let Value::Num(n) = key {
        let i = n as usize;
        if i as f64 == n && i < asize {
            return Some(i);
        }
    }
    None
}

pub unsafe fn new(g: &mut GlobalState, asize: usize, hsize: usize) -> VmResult<NonNull<Table>> {
    debug_assert!(hsize == 0 || hsize.is_power_of_two());
    let o = mem::new_gco(g, size_of::<Table>(), Tag::Table)?;
    let t = o as *mut Table;
    (*t).array = null_mut();
    (*t).asize = 0;
    (*t).node = null_mut();
    (*t).hmask = 0;
    (*t).hnum = 0;
    (*t).metatable = null_mut();
    if asize > 0 {
        let a = mem::realloc(g, null_mut(), 0, asize * size_of::<Value>())? as *mut Value;
        for i in 0..asize {
            a.add(i).write(Value::Nil);
        }
        (*t).array = a;
        (*t).asize = asize;
    }
    if hsize > 0 {
        alloc_hash(g, t, hsize)?;
    }
    Ok(NonNull::new_unchecked(t))
}

unsafe fn alloc_hash(g: &mut GlobalState, t: *mut Table, hsize: usize) -> VmResult<()> {
    let n = mem::realloc(g, null_mut(), 0, hsize * size_of::<Node>())? as *mut Node;
    for i in 0..hsize {
        n.add(i).write(Node::EMPTY);
    }
    (*t).node = n;
    (*t).hmask = hsize - 1;
    (*t).hnum = 0;
    Ok(())
}

pub unsafe fn free(g: &mut GlobalState, o: *mut GcHeader) {
    debug_assert!((*o).tag == Tag::Table);
    let t = o as *mut Table;
    if !(*t).array.is_null() {
        mem::free(g, (*t).array as *mut c_void, (*t).asize * size_of::<Value>());
    }
    if !(*t).node.is_null() {
        mem::free(
            g,
            (*t).node as *mut c_void,
            ((*t).hmask + 1) * size_of::<Node>(),
        );
    }
    mem::free(g, o as *mut c_void, size_of::<Table>());
}

pub unsafe fn get(t: *const Table, key: Value) -> Value {
    if let Some(i) = array_index(key, (*t).asize) {
        return *(*t).array_slot(i);
    }
    if (*t).node.is_null() {
        return Value::Nil;
    }
    let start = key.key_hash() as usize & (*t).hmask;
    for probe in 0..=(*t).hmask {
        let n = (*t).node_slot((start + probe) & (*t).hmask);
        if (*n).key == key {
            return (*n).val;
        }
        if (*n).key.is_nil() {
            break;
        }
    }
    Value::Nil
}

/// Store `key = val`, applying the backward write barrier when a black
/// table receives a white collectable.
pub unsafe fn set(g: &mut GlobalState, t: *mut Table, key: Value, val: Value) -> VmResult<()> {
    debug_assert!(!key.is_nil() && !matches!(key, Value::DeadKey));
    if let Some(i) = array_index(key, (*t).asize) {
        *(*t).array_slot(i) = val;
        store_barrier(g, t, key, val);
        return Ok(());
    }
    hash_set(g, t, key, val)?;
    store_barrier(g, t, key, val);
    Ok(())
}

#[inline]
unsafe fn store_barrier(g: &mut GlobalState, t: *mut Table, key: Value, val: Value) {
    if !(*t).head.marked.black() {
        return;
    }
    let white = |v: Value| match v.gc() {
        Some(o) => unsafe { (*o).marked.is_white() },
        None => false,
    };
    if white(val) || white(key) {
        gc::barrier_back(g, t);
    }
}

unsafe fn hash_set(g: &mut GlobalState, t: *mut Table, key: Value, val: Value) -> VmResult<()> {
    if (*t).node.is_null() {
        alloc_hash(g, t, mem::MIN_VECSZ)?;
    }
    loop {
        let start = key.key_hash() as usize & (*t).hmask;
        let mut freeslot: *mut Node = null_mut();
        for probe in 0..=(*t).hmask {
            let n = (*t).node_slot((start + probe) & (*t).hmask);
            if (*n).key == key {
                (*n).val = val;
                return Ok(());
            }
            if (*n).key.is_nil() {
                if freeslot.is_null() {
                    freeslot = n;
                }
                break;
            }
            // Dead or cleared slots are reusable for inserts.
            if freeslot.is_null()
                && (*n).val.is_nil()
                && matches!((*n).key, Value::DeadKey)
            {
                freeslot = n;
            }
        }
        if !freeslot.is_null() {
            // Keep a quarter of the table free so probe chains stay short.
            if (*t).hnum + 1 > (*t).hmask + 1 - ((*t).hmask + 1) / 4 {
                rehash(g, t)?;
                continue;
            }
            (*freeslot).key = key;
            (*freeslot).val = val;
            (*t).hnum += 1;
            return Ok(());
        }
        rehash(g, t)?;
    }
}

/// Double the hash part, reinserting every live entry.
unsafe fn rehash(g: &mut GlobalState, t: *mut Table) -> VmResult<()> {
    let oldnode = (*t).node;
    let oldmask = (*t).hmask;
    let newsize = (oldmask + 1) << 1;
    alloc_hash(g, t, newsize)?;
    for i in 0..=oldmask {
        let n = oldnode.add(i);
        if !(*n).val.is_nil() {
            debug_assert!(!(*n).key.is_nil());
            // Reinsert directly; the new table has room by construction.
            let start = (*n).key.key_hash() as usize & (*t).hmask;
            for probe in 0..=(*t).hmask {
                let d = (*t).node_slot((start + probe) & (*t).hmask);
                if (*d).key.is_nil() {
                    *d = *n;
                    (*t).hnum += 1;
                    break;
                }
            }
        }
    }
    mem::free(g, oldnode as *mut c_void, (oldmask + 1) * size_of::<Node>());
    Ok(())
}

pub unsafe fn set_metatable(g: &mut GlobalState, t: *mut Table, mt: *mut Table) {
    (*t).metatable = mt;
    if !mt.is_null() && (*t).head.marked.black() && (*mt).head.marked.is_white() {
        gc::barrier_back(g, t);
    }
}

#[cfg(test)]
mod tests {
    use crate::global::Runtime;
    use crate::value::Value;

    #[test]
    fn hash_part_insert_lookup_delete() {
        let mut rt = Runtime::new().unwrap();
        unsafe {
            let g = rt.global_mut();
            let t = super::new(g, 0, 0).unwrap().as_ptr();
            for i in 0..64 {
                super::set(g, t, Value::Num(i as f64 + 0.5), Value::Num(i as f64)).unwrap();
            }
            for i in 0..64 {
                assert_eq!(
                    super::get(t, Value::Num(i as f64 + 0.5)),
                    Value::Num(i as f64)
                );
            }
            super::set(g, t, Value::Num(3.5), Value::Nil).unwrap();
            assert!(super::get(t, Value::Num(3.5)).is_nil());
            assert_eq!(super::get(t, Value::Num(4.5)), Value::Num(4.0));
        }
    }

    #[test]
    fn array_part_stores() {
        let mut rt = Runtime::new().unwrap();
        unsafe {
            let g = rt.global_mut();
            let t = super::new(g, 4, 0).unwrap().as_ptr();
            super::set(g, t, Value::Num(1.0), Value::Bool(true)).unwrap();
            assert_eq!(super::get(t, Value::Num(1.0)), Value::Bool(true));
            // Out-of-range integers fall through to the hash part.
            super::set(g, t, Value::Num(100.0), Value::Bool(false)).unwrap();
            assert_eq!(super::get(t, Value::Num(100.0)), Value::Bool(false));
        }
    }
}
