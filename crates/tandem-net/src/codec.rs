//! Big-endian value encoding over [`FrameBuffer`]s.
//!
//! Scalars are written in network byte order. Strings, slices and vectors
//! are a 4-byte signed count followed by their UTF-8 bytes or elements. A
//! `char` is a 1-byte length followed by its UTF-8 bytes.
//!
//! Application types implement [`Encode`] and [`Decode`] by hand in terms of
//! these primitives.

use crate::buffer::{BufferError, FrameBuffer};

/// A value that can be appended to a frame buffer.
pub trait Encode {
    /// Append the encoding of `self` to `buf`.
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError>;
}

/// A value that can be read back from a frame buffer.
pub trait Decode: Sized {
    /// Read one value at `buf`'s read cursor.
    fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError>;
}

macro_rules! impl_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
                    buf.write_bytes(&self.to_be_bytes())
                }
            }

            impl Decode for $ty {
                fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError> {
                    buf.read_array().map(<$ty>::from_be_bytes)
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, f32, f64);

impl Encode for bool {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        u8::from(*self).encode(buf)
    }
}

impl Decode for bool {
    fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(BufferError::InvalidBool(other)),
        }
    }
}

impl Encode for char {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        let mut scratch = [0u8; 4];
        let utf8 = self.encode_utf8(&mut scratch);
        (utf8.len() as u8).encode(buf)?;
        buf.write_bytes(utf8.as_bytes())
    }
}

impl Decode for char {
    fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError> {
        let len = u8::decode(buf)? as usize;
        let bytes = buf.read_bytes(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| BufferError::InvalidChar)?;
        let mut chars = text.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(BufferError::InvalidChar),
        }
    }
}

/// Write a 4-byte element or byte count.
pub(crate) fn write_count(buf: &mut FrameBuffer, count: usize) -> Result<(), BufferError> {
    let count = i32::try_from(count).map_err(|_| BufferError::CapacityExceeded {
        wanted: count,
        capacity: i32::MAX as usize,
    })?;
    count.encode(buf)
}

/// Read a 4-byte element or byte count.
pub(crate) fn read_count(buf: &mut FrameBuffer) -> Result<usize, BufferError> {
    let count = i32::decode(buf)?;
    usize::try_from(count).map_err(|_| BufferError::NegativeLength(count))
}

impl Encode for str {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        write_count(buf, self.len())?;
        buf.write_bytes(self.as_bytes())
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        self.as_str().encode(buf)
    }
}

impl Decode for String {
    fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError> {
        let len = read_count(buf)?;
        let bytes = buf.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BufferError::InvalidUtf8)
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        write_count(buf, self.len())?;
        self.iter().try_for_each(|item| item.encode(buf))
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        self.as_slice().encode(buf)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError> {
        let count = read_count(buf)?;
        // A hostile count must not drive the allocation.
        let mut items = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        match self {
            Some(value) => {
                true.encode(buf)?;
                value.encode(buf)
            }
            None => false.encode(buf),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError> {
        if bool::decode(buf)? {
            T::decode(buf).map(Some)
        } else {
            Ok(None)
        }
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
        (**self).encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::buffer::BufferPool;
    use crate::status::Transport;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(Transport::Stream, 4096)
    }

    #[test]
    fn test_scalars_roundtrip() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&0xABu8).unwrap();
        buf.write(&-5i8).unwrap();
        buf.write(&0xBEEFu16).unwrap();
        buf.write(&i16::MIN).unwrap();
        buf.write(&u32::MAX).unwrap();
        buf.write(&-123_456i32).unwrap();
        buf.write(&u64::MAX).unwrap();
        buf.write(&i64::MIN).unwrap();
        buf.write(&u128::MAX).unwrap();
        buf.write(&-1i128).unwrap();
        buf.write(&1.5f32).unwrap();
        buf.write(&-0.25f64).unwrap();
        buf.write(&true).unwrap();
        buf.write(&false).unwrap();

        assert_eq!(buf.read::<u8>().unwrap(), 0xAB);
        assert_eq!(buf.read::<i8>().unwrap(), -5);
        assert_eq!(buf.read::<u16>().unwrap(), 0xBEEF);
        assert_eq!(buf.read::<i16>().unwrap(), i16::MIN);
        assert_eq!(buf.read::<u32>().unwrap(), u32::MAX);
        assert_eq!(buf.read::<i32>().unwrap(), -123_456);
        assert_eq!(buf.read::<u64>().unwrap(), u64::MAX);
        assert_eq!(buf.read::<i64>().unwrap(), i64::MIN);
        assert_eq!(buf.read::<u128>().unwrap(), u128::MAX);
        assert_eq!(buf.read::<i128>().unwrap(), -1);
        assert_eq!(buf.read::<f32>().unwrap(), 1.5);
        assert_eq!(buf.read::<f64>().unwrap(), -0.25);
        assert!(buf.read::<bool>().unwrap());
        assert!(!buf.read::<bool>().unwrap());
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_scalars_are_big_endian() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&0x0102_0304u32).unwrap();
        buf.write(&-2i16).unwrap();
        assert_eq!(buf.payload().unwrap(), &[1, 2, 3, 4, 0xFF, 0xFE]);
    }

    #[test]
    fn test_string_has_byte_count_prefix() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write("héllo").unwrap();
        // 'é' is two bytes in UTF-8.
        assert_eq!(&buf.payload().unwrap()[..4], &[0, 0, 0, 6]);
        assert_eq!(buf.read::<String>().unwrap(), "héllo");
    }

    #[test]
    fn test_empty_string_and_vec_roundtrip() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&String::new()).unwrap();
        buf.write(&Vec::<u64>::new()).unwrap();
        assert_eq!(buf.read::<String>().unwrap(), "");
        assert!(buf.read::<Vec<u64>>().unwrap().is_empty());
    }

    #[test]
    fn test_vectors_roundtrip() {
        let pool = pool();
        let mut buf = pool.rent();
        let ints = vec![3i32, -1, 0, i32::MAX];
        let names = vec!["a".to_string(), "bc".to_string()];
        let nested = vec![vec![1u8, 2], vec![], vec![3]];
        buf.write(&ints).unwrap();
        buf.write(&names).unwrap();
        buf.write(&nested).unwrap();
        buf.write(&[7u16, 8][..]).unwrap();

        assert_eq!(buf.read::<Vec<i32>>().unwrap(), ints);
        assert_eq!(buf.read::<Vec<String>>().unwrap(), names);
        assert_eq!(buf.read::<Vec<Vec<u8>>>().unwrap(), nested);
        assert_eq!(buf.read::<Vec<u16>>().unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_chars_roundtrip() {
        let pool = pool();
        let mut buf = pool.rent();
        for c in ['a', 'ß', '€', '🦀'] {
            buf.write(&c).unwrap();
        }
        assert_eq!(buf.payload().unwrap()[0], 1);
        for c in ['a', 'ß', '€', '🦀'] {
            assert_eq!(buf.read::<char>().unwrap(), c);
        }
    }

    #[test]
    fn test_option_roundtrip() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&Some(9u32)).unwrap();
        buf.write(&None::<u32>).unwrap();
        assert_eq!(buf.read::<Option<u32>>().unwrap(), Some(9));
        assert_eq!(buf.read::<Option<u32>>().unwrap(), None);
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&2u8).unwrap();
        assert_eq!(buf.read::<bool>(), Err(BufferError::InvalidBool(2)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&2i32).unwrap();
        buf.write_bytes(&[0xC3, 0x28]).unwrap();
        assert_eq!(buf.read::<String>(), Err(BufferError::InvalidUtf8));
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_negative_count_rejected() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&-1i32).unwrap();
        assert_eq!(buf.read::<Vec<u8>>(), Err(BufferError::NegativeLength(-1)));
    }

    #[test]
    fn test_oversized_count_fails_without_huge_allocation() {
        let pool = pool();
        let mut buf = pool.rent();
        buf.write(&i32::MAX).unwrap();
        buf.write(&1u64).unwrap();
        assert!(matches!(
            buf.read::<Vec<u64>>(),
            Err(BufferError::OutOfBounds { .. })
        ));
    }

    /// Application types compose the primitives by hand.
    #[derive(Debug, PartialEq)]
    struct ChatLine {
        sender: u32,
        text: String,
        tags: Vec<String>,
    }

    impl Encode for ChatLine {
        fn encode(&self, buf: &mut FrameBuffer) -> Result<(), BufferError> {
            buf.write(&self.sender)?;
            buf.write(&self.text)?;
            buf.write(&self.tags)
        }
    }

    impl Decode for ChatLine {
        fn decode(buf: &mut FrameBuffer) -> Result<Self, BufferError> {
            Ok(Self {
                sender: buf.read()?,
                text: buf.read()?,
                tags: buf.read()?,
            })
        }
    }

    #[test]
    fn test_application_type_roundtrip() {
        let pool = pool();
        let mut buf = pool.rent();
        let line = ChatLine {
            sender: 12,
            text: "gg".to_string(),
            tags: vec!["team".to_string()],
        };
        buf.write(&line).unwrap();
        assert_eq!(buf.read::<ChatLine>().unwrap(), line);
    }
}
