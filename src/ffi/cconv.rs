//! Coercion between managed values and C representations.
//!
//! `ct_tv` writes a managed value into memory laid out as a given C type;
//! `tv_ct` reads C bytes back into a managed value, boxing into cdata where
//! a number cannot represent the result. `tv_ct` reports how many managed
//! allocations it made so the caller can schedule GC checkpoints.

use bitflags::bitflags;

use crate::error::{VmError, VmResult};
use crate::ffi::ctype::{CTypeId, CTypeKind};
use crate::global::GlobalState;
use crate::udata;
use crate::value::Value;

bitflags! {
    /// Conversion context flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ConvFlags: u32 {
        /// Permissive cast (not a checked argument conversion).
        const CAST = 0x1;
    }
}

/// Read a little-endian integer of `size` bytes, extending to 64 bits.
pub unsafe fn read_int(sp: *const u8, size: usize, unsigned: bool) -> u64 {
    let mut raw = [0u8; 8];
    std::ptr::copy_nonoverlapping(sp, raw.as_mut_ptr(), size);
    let x = u64::from_le_bytes(raw);
    if unsigned || size == 8 {
        x
    } else {
        // Sign-extend.
        let shift = 64 - size * 8;
        (((x << shift) as i64) >> shift) as u64
    }
}

pub unsafe fn write_int(dst: *mut u8, x: u64, size: usize) {
    let raw = x.to_le_bytes();
    std::ptr::copy_nonoverlapping(raw.as_ptr(), dst, size);
}

/// Write a managed value as C type `did` at `dst`.
pub unsafe fn ct_tv(
    g: &mut GlobalState,
    did: CTypeId,
    dst: *mut u8,
    v: Value,
    flags: ConvFlags,
) -> VmResult<()> {
    let ct = g.cts.get(did).clone();
    match ct.kind {
        CTypeKind::Bool => {
            let b = !matches!(v, Value::Nil | Value::Bool(false));
            *dst = b as u8;
            Ok(())
        }
        CTypeKind::Int { unsigned } => {
            let x: u64 = match v {
                Value::Num(n) => {
                    if unsigned {
                        n as u64
                    } else {
                        (n as i64) as u64
                    }
                }
                Value::Bool(b) => b as u64,
                Value::Cdata(cd) => {
                    let cd = cd.as_ptr();
                    match g.cts.get((*cd).ctypeid).kind {
                        CTypeKind::Int { unsigned: su } => {
                            read_int((*cd).payload(), g.cts.size((*cd).ctypeid), su)
                        }
                        _ => return Err(VmError::FfiNyiCall),
                    }
                }
                _ => return Err(VmError::FfiNyiCall),
            };
            write_int(dst, x, ct.size);
            Ok(())
        }
        CTypeKind::Float => {
            let n = match v {
                Value::Num(n) => n,
                Value::Cdata(cd) => {
                    let cd = cd.as_ptr();
                    match g.cts.get((*cd).ctypeid).kind {
                        CTypeKind::Float => {
                            if g.cts.size((*cd).ctypeid) == 4 {
                                f32::from_le_bytes(*((*cd).payload() as *const [u8; 4])) as f64
                            } else {
                                f64::from_le_bytes(*((*cd).payload() as *const [u8; 8]))
                            }
                        }
                        _ => return Err(VmError::FfiNyiCall),
                    }
                }
                _ => return Err(VmError::FfiNyiCall),
            };
            if ct.size == 4 {
                std::ptr::copy_nonoverlapping(
                    (n as f32).to_le_bytes().as_ptr(),
                    dst,
                    4,
                );
            } else {
                std::ptr::copy_nonoverlapping(n.to_le_bytes().as_ptr(), dst, 8);
            }
            Ok(())
        }
        CTypeKind::Enum { base } => ct_tv(g, base, dst, v, flags),
        CTypeKind::Ptr { .. } => {
            let p: usize = match v {
                Value::Nil => 0,
                Value::Str(s) => (*s.as_ptr()).data() as usize,
                Value::Udata(ud) => (*ud.as_ptr()).payload() as usize,
                Value::Cdata(cd) => {
                    let cd = cd.as_ptr();
                    match g.cts.get((*cd).ctypeid).kind {
                        CTypeKind::Ptr { .. } => {
                            read_int((*cd).payload(), g.cts.ptr_size, true) as usize
                        }
                        // Arrays and aggregates decay to their payload.
                        _ => (*cd).payload() as usize,
                    }
                }
                _ => return Err(VmError::FfiNyiCall),
            };
            write_int(dst, p as u64, ct.size);
            Ok(())
        }
        CTypeKind::Complex { elem } => {
            let esz = g.cts.size(elem);
            match v {
                Value::Num(n) => {
                    // Real part from the number, zero imaginary part.
                    if esz == 4 {
                        std::ptr::copy_nonoverlapping(
                            (n as f32).to_le_bytes().as_ptr(),
                            dst,
                            4,
                        );
                        std::ptr::write_bytes(dst.add(4), 0, 4);
                    } else {
                        std::ptr::copy_nonoverlapping(n.to_le_bytes().as_ptr(), dst, 8);
                        std::ptr::write_bytes(dst.add(8), 0, 8);
                    }
                    Ok(())
                }
                Value::Cdata(cd) => {
                    let cd = cd.as_ptr();
                    if g.cts.size((*cd).ctypeid) == ct.size {
                        std::ptr::copy_nonoverlapping((*cd).payload(), dst, ct.size);
                        Ok(())
                    } else {
                        Err(VmError::FfiNyiCall)
                    }
                }
                _ => Err(VmError::FfiNyiCall),
            }
        }
        CTypeKind::Struct { .. } | CTypeKind::Array { .. } | CTypeKind::Vector { .. } => {
            match v {
                Value::Cdata(cd) => {
                    let cd = cd.as_ptr();
                    if g.cts.size((*cd).ctypeid) == ct.size {
                        std::ptr::copy_nonoverlapping((*cd).payload(), dst, ct.size);
                        Ok(())
                    } else {
                        Err(VmError::FfiNyiCall)
                    }
                }
                _ => Err(VmError::FfiNyiCall),
            }
        }
        CTypeKind::Void | CTypeKind::Func { .. } => Err(VmError::FfiNyiCall),
    }
}

/// Read C bytes of type `ct_id` at `sp` into a managed value. Returns the
/// value and the number of managed allocations performed.
pub unsafe fn tv_ct(
    g: &mut GlobalState,
    ct_id: CTypeId,
    sp: *const u8,
) -> VmResult<(Value, usize)> {
    let ct = g.cts.get(ct_id).clone();
    match ct.kind {
        CTypeKind::Bool => Ok((Value::Bool(*sp != 0), 0)),
        CTypeKind::Int { unsigned } => {
            if ct.size == 8 {
                // 64-bit integers do not fit a number; box them.
                let cd = udata::new_cdata(g, ct_id, 8)?;
                std::ptr::copy_nonoverlapping(sp, (*cd.as_ptr()).payload(), 8);
                Ok((Value::Cdata(cd), 1))
            } else {
                let x = read_int(sp, ct.size, unsigned);
                let n = if unsigned {
                    x as f64
                } else {
                    (x as i64) as f64
                };
                Ok((Value::Num(n), 0))
            }
        }
        CTypeKind::Float => {
            let n = if ct.size == 4 {
                f32::from_le_bytes(*(sp as *const [u8; 4])) as f64
            } else {
                f64::from_le_bytes(*(sp as *const [u8; 8]))
            };
            Ok((Value::Num(n), 0))
        }
        CTypeKind::Enum { base } => tv_ct(g, base, sp),
        CTypeKind::Ptr { .. } | CTypeKind::Vector { .. } => {
            let cd = udata::new_cdata(g, ct_id, ct.size)?;
            std::ptr::copy_nonoverlapping(sp, (*cd.as_ptr()).payload(), ct.size);
            Ok((Value::Cdata(cd), 1))
        }
        // Struct and complex returns use a preallocated cdata.
        _ => Err(VmError::FfiNyiCall),
    }
}
