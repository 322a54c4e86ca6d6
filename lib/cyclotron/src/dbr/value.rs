//! Native value vectors and their big-endian wire packing.

use crate::dbr::{EpicsString, NativeType, MAX_STRING_SIZE};
use crate::support::{CaResult, DecodeError, SizedRead};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// A homogeneous array of native elements. Scalars are one-element arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum DbrValue {
    String(Vec<EpicsString>),
    Int(Vec<i16>),
    Float(Vec<f32>),
    Enum(Vec<u16>),
    Char(Vec<u8>),
    Long(Vec<i32>),
    Double(Vec<f64>),
}

impl DbrValue {
    #[inline]
    pub fn native(&self) -> NativeType {
        match self {
            DbrValue::String(_) => NativeType::String,
            DbrValue::Int(_) => NativeType::Int,
            DbrValue::Float(_) => NativeType::Float,
            DbrValue::Enum(_) => NativeType::Enum,
            DbrValue::Char(_) => NativeType::Char,
            DbrValue::Long(_) => NativeType::Long,
            DbrValue::Double(_) => NativeType::Double,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            DbrValue::String(v) => v.len(),
            DbrValue::Int(v) => v.len(),
            DbrValue::Float(v) => v.len(),
            DbrValue::Enum(v) => v.len(),
            DbrValue::Char(v) => v.len(),
            DbrValue::Long(v) => v.len(),
            DbrValue::Double(v) => v.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty array of the given native type.
    pub fn empty(native: NativeType) -> DbrValue {
        match native {
            NativeType::String => DbrValue::String(Vec::new()),
            NativeType::Int => DbrValue::Int(Vec::new()),
            NativeType::Float => DbrValue::Float(Vec::new()),
            NativeType::Enum => DbrValue::Enum(Vec::new()),
            NativeType::Char => DbrValue::Char(Vec::new()),
            NativeType::Long => DbrValue::Long(Vec::new()),
            NativeType::Double => DbrValue::Double(Vec::new()),
        }
    }

    /// Element at `index` as a host double. `None` for string arrays and for
    /// out-of-range indexes.
    pub fn scalar_f64(&self, index: usize) -> Option<f64> {
        match self {
            DbrValue::String(_) => None,
            DbrValue::Int(v) => v.get(index).map(|&x| f64::from(x)),
            DbrValue::Float(v) => v.get(index).map(|&x| f64::from(x)),
            DbrValue::Enum(v) => v.get(index).map(|&x| f64::from(x)),
            DbrValue::Char(v) => v.get(index).map(|&x| f64::from(x)),
            DbrValue::Long(v) => v.get(index).map(|&x| f64::from(x)),
            DbrValue::Double(v) => v.get(index).copied(),
        }
    }

    /// Restricts the array to `indices` (used by the array filters).
    pub fn select(&self, indices: &[usize]) -> DbrValue {
        fn pick<T: Copy>(v: &[T], indices: &[usize]) -> Vec<T> {
            indices.iter().filter_map(|&i| v.get(i).copied()).collect()
        }

        match self {
            DbrValue::String(v) => DbrValue::String(pick(v, indices)),
            DbrValue::Int(v) => DbrValue::Int(pick(v, indices)),
            DbrValue::Float(v) => DbrValue::Float(pick(v, indices)),
            DbrValue::Enum(v) => DbrValue::Enum(pick(v, indices)),
            DbrValue::Char(v) => DbrValue::Char(pick(v, indices)),
            DbrValue::Long(v) => DbrValue::Long(pick(v, indices)),
            DbrValue::Double(v) => DbrValue::Double(pick(v, indices)),
        }
    }

    /// Writes all elements big-endian, strings as fixed 40-byte cells.
    pub fn write<W: io::Write>(&self, stream: &mut W) -> CaResult<()> {
        match self {
            DbrValue::String(v) => {
                for cell in v {
                    stream.write_all(&cell.0)?;
                }
            }
            DbrValue::Int(v) => {
                for &x in v {
                    stream.write_i16::<BigEndian>(x)?;
                }
            }
            DbrValue::Float(v) => {
                for &x in v {
                    stream.write_f32::<BigEndian>(x)?;
                }
            }
            DbrValue::Enum(v) => {
                for &x in v {
                    stream.write_u16::<BigEndian>(x)?;
                }
            }
            DbrValue::Char(v) => stream.write_all(v)?,
            DbrValue::Long(v) => {
                for &x in v {
                    stream.write_i32::<BigEndian>(x)?;
                }
            }
            DbrValue::Double(v) => {
                for &x in v {
                    stream.write_f64::<BigEndian>(x)?;
                }
            }
        }

        Ok(())
    }

    /// Reads `count` elements of `native` type from the stream.
    pub fn read<R: SizedRead>(native: NativeType, count: usize, stream: &mut R) -> CaResult<DbrValue> {
        if stream.remaining_data() < native.element_size() * count {
            return Err(DecodeError::Truncated.into());
        }

        Ok(match native {
            NativeType::String => {
                let mut cells = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut cell = [0u8; MAX_STRING_SIZE];
                    stream.read_exact(&mut cell)?;
                    cells.push(EpicsString(cell));
                }
                DbrValue::String(cells)
            }
            NativeType::Int => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(stream.read_i16::<BigEndian>()?);
                }
                DbrValue::Int(v)
            }
            NativeType::Float => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(stream.read_f32::<BigEndian>()?);
                }
                DbrValue::Float(v)
            }
            NativeType::Enum => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(stream.read_u16::<BigEndian>()?);
                }
                DbrValue::Enum(v)
            }
            NativeType::Char => {
                let mut v = vec![0u8; count];
                stream.read_exact(&mut v)?;
                DbrValue::Char(v)
            }
            NativeType::Long => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(stream.read_i32::<BigEndian>()?);
                }
                DbrValue::Long(v)
            }
            NativeType::Double => {
                let mut v = Vec::with_capacity(count);
                for _ in 0..count {
                    v.push(stream.read_f64::<BigEndian>()?);
                }
                DbrValue::Double(v)
            }
        })
    }
}
