//! Compact C type table.
//!
//! Types are interned into an id-indexed table; aggregate members carry
//! explicit byte offsets so unions and packed layouts need no special
//! cases. Pointer-sized types take their width from the table (which
//! mirrors the selected ABI target), so a 32-bit target can be described
//! from a 64-bit host.

pub type CTypeId = u32;

/// x86 calling conventions; other targets only use `Cdecl`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallConv {
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
}

/// One member of a struct or union. `bits` is `(bit_offset, bit_width)`
/// for bitfield members.
#[derive(Clone, Debug)]
pub struct CField {
    pub ty: CTypeId,
    pub offset: usize,
    pub bits: Option<(u8, u8)>,
}

#[derive(Clone, Debug)]
pub enum CTypeKind {
    Void,
    Bool,
    Int { unsigned: bool },
    Float,
    Enum { base: CTypeId },
    Ptr { to: CTypeId },
    Array { elem: CTypeId, len: usize },
    Vector { elem: CTypeId, len: usize },
    Complex { elem: CTypeId },
    Struct { fields: Vec<CField>, is_union: bool },
    Func {
        ret: CTypeId,
        params: Vec<CTypeId>,
        vararg: bool,
        conv: CallConv,
    },
}

#[derive(Clone, Debug)]
pub struct CType {
    pub kind: CTypeKind,
    pub size: usize,
    pub align: usize,
}

// Predefined ids, in table order.
pub const VOID: CTypeId = 0;
pub const BOOL: CTypeId = 1;
pub const INT8: CTypeId = 2;
pub const UINT8: CTypeId = 3;
pub const INT16: CTypeId = 4;
pub const UINT16: CTypeId = 5;
pub const INT32: CTypeId = 6;
pub const UINT32: CTypeId = 7;
pub const INT64: CTypeId = 8;
pub const UINT64: CTypeId = 9;
pub const FLOAT: CTypeId = 10;
pub const DOUBLE: CTypeId = 11;
pub const P_VOID: CTypeId = 12;
pub const P_CCHAR: CTypeId = 13;

pub struct CTypeTable {
    types: Vec<CType>,
    pub ptr_size: usize,
}

impl CTypeTable {
    pub fn new(ptr_size: usize) -> CTypeTable {
        let int = |size, unsigned| CType {
            kind: CTypeKind::Int { unsigned },
            size,
            align: size,
        };
        let types = vec![
            CType {
                kind: CTypeKind::Void,
                size: 0,
                align: 1,
            },
            CType {
                kind: CTypeKind::Bool,
                size: 1,
                align: 1,
            },
            int(1, false),
            int(1, true),
            int(2, false),
            int(2, true),
            int(4, false),
            int(4, true),
            int(8, false),
            int(8, true),
            CType {
                kind: CTypeKind::Float,
                size: 4,
                align: 4,
            },
            CType {
                kind: CTypeKind::Float,
                size: 8,
                align: 8,
            },
            CType {
                kind: CTypeKind::Ptr { to: VOID },
                size: ptr_size,
                align: ptr_size,
            },
            CType {
                kind: CTypeKind::Ptr { to: INT8 },
                size: ptr_size,
                align: ptr_size,
            },
        ];
        CTypeTable { types, ptr_size }
    }

    pub fn host() -> CTypeTable {
        CTypeTable::new(std::mem::size_of::<usize>())
    }

    #[inline]
    pub fn get(&self, id: CTypeId) -> &CType {
        &self.types[id as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: CTypeId) -> &mut CType {
        &mut self.types[id as usize]
    }

    #[inline]
    pub fn size(&self, id: CTypeId) -> usize {
        self.get(id).size
    }

    #[inline]
    pub fn align(&self, id: CTypeId) -> usize {
        self.get(id).align
    }

    /// The pointer-sized integer small arguments widen to.
    pub fn int_psz(&self) -> CTypeId {
        if self.ptr_size == 8 {
            INT64
        } else {
            INT32
        }
    }

    pub fn push(&mut self, ct: CType) -> CTypeId {
        let id = self.types.len() as CTypeId;
        self.types.push(ct);
        id
    }

    pub fn ptr_to(&mut self, to: CTypeId) -> CTypeId {
        // Reuse an existing pointer type when one matches.
        for (i, ct) in self.types.iter().enumerate() {
            if let CTypeKind::Ptr { to: t } = ct.kind {
                if t == to {
                    return i as CTypeId;
                }
            }
        }
        let (size, align) = (self.ptr_size, self.ptr_size);
        self.push(CType {
            kind: CTypeKind::Ptr { to },
            size,
            align,
        })
    }

    pub fn array_of(&mut self, elem: CTypeId, len: usize) -> CTypeId {
        let (esz, eal) = (self.size(elem), self.align(elem));
        self.push(CType {
            kind: CTypeKind::Array { elem, len },
            size: esz * len,
            align: eal,
        })
    }

    pub fn vector_of(&mut self, elem: CTypeId, len: usize) -> CTypeId {
        let esz = self.size(elem);
        self.push(CType {
            kind: CTypeKind::Vector { elem, len },
            size: esz * len,
            align: esz * len,
        })
    }

    /// `complex float` (elem = [`FLOAT`]) or `complex double` ([`DOUBLE`]).
    pub fn complex_of(&mut self, elem: CTypeId) -> CTypeId {
        let (esz, eal) = (self.size(elem), self.align(elem));
        self.push(CType {
            kind: CTypeKind::Complex { elem },
            size: 2 * esz,
            align: eal,
        })
    }

    pub fn enum_of(&mut self, base: CTypeId) -> CTypeId {
        let (size, align) = (self.size(base), self.align(base));
        self.push(CType {
            kind: CTypeKind::Enum { base },
            size,
            align,
        })
    }

    /// Struct or union with naturally aligned member layout.
    pub fn struct_of(&mut self, members: &[CTypeId], is_union: bool) -> CTypeId {
        let mut fields = Vec::with_capacity(members.len());
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut size = 0usize;
        for &m in members {
            let (msz, mal) = (self.size(m), self.align(m));
            align = align.max(mal);
            let fofs = if is_union {
                0
            } else {
                (offset + mal - 1) & !(mal - 1)
            };
            fields.push(CField {
                ty: m,
                offset: fofs,
                bits: None,
            });
            if is_union {
                size = size.max(msz);
            } else {
                offset = fofs + msz;
                size = offset;
            }
        }
        size = (size + align - 1) & !(align - 1);
        self.push(CType {
            kind: CTypeKind::Struct { fields, is_union },
            size,
            align,
        })
    }

    /// Struct with caller-provided layout (packed/bitfield test cases).
    pub fn raw_struct(
        &mut self,
        fields: Vec<CField>,
        size: usize,
        align: usize,
        is_union: bool,
    ) -> CTypeId {
        self.push(CType {
            kind: CTypeKind::Struct { fields, is_union },
            size,
            align,
        })
    }

    pub fn func(
        &mut self,
        ret: CTypeId,
        params: &[CTypeId],
        vararg: bool,
        conv: CallConv,
    ) -> CTypeId {
        let (size, align) = (self.ptr_size, self.ptr_size);
        self.push(CType {
            kind: CTypeKind::Func {
                ret,
                params: params.to_vec(),
                vararg,
                conv,
            },
            size,
            align,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_struct_layout() {
        let mut cts = CTypeTable::new(8);
        // struct { char; double; int; } -> offsets 0, 8, 16; size 24.
        let id = cts.struct_of(&[INT8, DOUBLE, INT32], false);
        let ct = cts.get(id);
        assert_eq!(ct.size, 24);
        assert_eq!(ct.align, 8);
        if let CTypeKind::Struct { ref fields, .. } = ct.kind {
            assert_eq!(fields[0].offset, 0);
            assert_eq!(fields[1].offset, 8);
            assert_eq!(fields[2].offset, 16);
        } else {
            panic!("not a struct");
        }
    }

    #[test]
    fn union_layout() {
        let mut cts = CTypeTable::new(8);
        let id = cts.struct_of(&[INT32, DOUBLE], true);
        let ct = cts.get(id);
        assert_eq!(ct.size, 8);
        assert_eq!(ct.align, 8);
    }

    #[test]
    fn pointer_types_are_shared() {
        let mut cts = CTypeTable::new(8);
        assert_eq!(cts.ptr_to(VOID), P_VOID);
        let a = cts.ptr_to(DOUBLE);
        let b = cts.ptr_to(DOUBLE);
        assert_eq!(a, b);
    }
}
