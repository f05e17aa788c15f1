//! Fixed-size primitive conversion for binary reading and writing.
//!
//! [`CilIO`] is implemented for every integer and floating point type that appears in a module
//! image or an instruction stream. [`crate::file::parser::Parser`] uses it to read values and
//! [`crate::file::writer::Writer`] to emit them; module images are always little-endian.

use crate::Result;

/// Conversion between a primitive and its fixed-size little-endian byte representation.
pub trait CilIO: Sized + Copy {
    /// The byte array holding one value
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]> + AsRef<[u8]>;

    /// Reads a value from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Writes a value as little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $size:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $size];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io!(
    u8 => 1,
    i8 => 1,
    u16 => 2,
    i16 => 2,
    u32 => 4,
    i32 => 4,
    u64 => 8,
    i64 => 8,
    f32 => 4,
    f64 => 8,
);

/// Reads a little-endian value from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the value.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a little-endian value at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data`.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(size) else {
        return Err(out_of_bounds_error!());
    };

    let Some(slice) = data.get(*offset..end) else {
        return Err(out_of_bounds_error!());
    };

    let Ok(bytes) = <T::Bytes as TryFrom<&[u8]>>::try_from(slice) else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_values() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xFF];
        let mut offset = 0;

        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 1);
        assert_eq!(read_le_at::<u32>(&data, &mut offset).unwrap(), 2);
        assert_eq!(read_le_at::<i8>(&data, &mut offset).unwrap(), -1);
        assert_eq!(offset, 7);
        assert!(read_le_at::<u8>(&data, &mut offset).is_err());
        assert_eq!(offset, 7);
    }

    #[test]
    fn floats() {
        let bytes = 2.5_f64.to_le_bytes();
        assert_eq!(read_le::<f64>(&bytes).unwrap(), 2.5);
        assert!(read_le::<f64>(&bytes[..7]).is_err());
    }
}
