//! Fixed, little-endian wire types for the exchange paths.
//!
//! All multi-byte integers in these structs are **little-endian** on the wire.
//! We store them pre-LE with `.to_le()` and decode with `.from_le()`.

use bytemuck::{Pod, Zeroable};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Decode a received byte buffer; copies so the source needs no alignment.
pub fn decode_vec<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytemuck::pod_collect_to_vec(bytes)
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u64,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// A single index (global number, key, or local offset).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireIndex {
    pub id_le: u64,
}

impl WireIndex {
    pub fn of(id: u64) -> Self {
        Self { id_le: id.to_le() }
    }
    pub fn get(&self) -> u64 {
        u64::from_le(self.id_le)
    }
}

/// An `(a, b)` pair: `(key, global)` claims, `(key, owner)` queries, or
/// `(src, dst)` adjacency.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WirePair {
    pub a_le: u64,
    pub b_le: u64,
}

impl WirePair {
    pub fn new(a: u64, b: u64) -> Self {
        Self {
            a_le: a.to_le(),
            b_le: b.to_le(),
        }
    }
    pub fn a(&self) -> u64 {
        u64::from_le(self.a_le)
    }
    pub fn b(&self) -> u64 {
        u64::from_le(self.b_le)
    }
}

/// A matrix entry `(global row, global col, value)`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct WireEntry {
    pub row_le: u64,
    pub col_le: u64,
    pub val_bits_le: u64,
}

impl WireEntry {
    pub fn new(row: u64, col: u64, val: f64) -> Self {
        Self {
            row_le: row.to_le(),
            col_le: col.to_le(),
            val_bits_le: val.to_bits().to_le(),
        }
    }
    pub fn row(&self) -> u64 {
        u64::from_le(self.row_le)
    }
    pub fn col(&self) -> u64 {
        u64::from_le(self.col_le)
    }
    pub fn val(&self) -> f64 {
        f64::from_bits(u64::from_le(self.val_bits_le))
    }
}

/// A scalar value on the wire (bit-exact).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct WireScalar {
    pub bits_le: u64,
}

impl WireScalar {
    pub fn new(v: f64) -> Self {
        Self {
            bits_le: v.to_bits().to_le(),
        }
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(u64::from_le(self.bits_le))
    }
}

/// Header of one mesh entity record shipped during ghost-layer growth;
/// followed on the wire by `cone_len` [`WireIndex`] global cone points.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireEntity {
    pub global_le: u64,
    pub key_le: u64,
    pub owner_le: u64,
    pub cell_type_le: u64,
    pub cone_len_le: u64,
}

impl WireEntity {
    pub fn new(global: u64, key: u64, owner: usize, cell_type: u64, cone_len: usize) -> Self {
        Self {
            global_le: global.to_le(),
            key_le: key.to_le(),
            owner_le: (owner as u64).to_le(),
            cell_type_le: cell_type.to_le(),
            cone_len_le: (cone_len as u64).to_le(),
        }
    }
    pub fn global(&self) -> u64 {
        u64::from_le(self.global_le)
    }
    pub fn key(&self) -> u64 {
        u64::from_le(self.key_le)
    }
    pub fn owner(&self) -> usize {
        u64::from_le(self.owner_le) as usize
    }
    pub fn cell_type(&self) -> u64 {
        u64::from_le(self.cell_type_le)
    }
    pub fn cone_len(&self) -> usize {
        u64::from_le(self.cone_len_le) as usize
    }
}

/// One label value `(point global, name index, value)`; the name index refers
/// to the sender's sorted label-name list shipped alongside.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireLabel {
    pub global_le: u64,
    pub name_le: u32,
    pub value_le: u32,
}

impl WireLabel {
    pub fn new(global: u64, name: u32, value: i32) -> Self {
        Self {
            global_le: global.to_le(),
            name_le: name.to_le(),
            value_le: (value as u32).to_le(),
        }
    }
    pub fn global(&self) -> u64 {
        u64::from_le(self.global_le)
    }
    pub fn name(&self) -> usize {
        u32::from_le(self.name_le) as usize
    }
    pub fn value(&self) -> i32 {
        u32::from_le(self.value_le) as i32
    }
}
