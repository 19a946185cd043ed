//! Binary codec primitives for the wire format
//!
//! Everything on the wire is little-endian and positionally fixed: a value is
//! identified by where it sits in the byte stream, not by a name. Sequences of
//! fixed-size elements are `[u32 length][length x element bytes]`; strings and
//! composite records encode recursively through their own [`Wire`] impl.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use std::io::{self, Read, Write};

/// Cap on up-front allocation while decoding a length-prefixed sequence.
/// A corrupt length still fails as a short read, it just cannot reserve
/// gigabytes first.
const MAX_PREALLOC: usize = 1 << 16;

/// Fixed-layout binary encoding.
///
/// `size` returns the exact byte count `encode` will write. `encode` never
/// fails on in-memory state; the only error source is the underlying writer.
/// `decode` reconstructs a value bit-for-bit equal to what was encoded.
/// Truncated or malformed input surfaces as the reader's error; no partially
/// decoded value should be trusted after a failure.
pub trait Wire: Sized {
    /// Exact number of bytes `encode` will write.
    fn size(&self) -> u32;

    /// Write this value to `w` in wire layout.
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()>;

    /// Read one value from `r` in wire layout.
    fn decode<R: Read>(r: &mut R) -> io::Result<Self>;
}

impl Wire for u32 {
    fn size(&self) -> u32 {
        4
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(*self)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Wire for i32 {
    fn size(&self) -> u32 {
        4
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<LittleEndian>(*self)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_i32::<LittleEndian>()
    }
}

impl Wire for f32 {
    fn size(&self) -> u32 {
        4
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f32::<LittleEndian>(*self)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        r.read_f32::<LittleEndian>()
    }
}

impl Wire for Vec2 {
    fn size(&self) -> u32 {
        8
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f32::<LittleEndian>(self.x)?;
        w.write_f32::<LittleEndian>(self.y)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let x = r.read_f32::<LittleEndian>()?;
        let y = r.read_f32::<LittleEndian>()?;
        Ok(Vec2::new(x, y))
    }
}

impl Wire for Vec3 {
    fn size(&self) -> u32 {
        12
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f32::<LittleEndian>(self.x)?;
        w.write_f32::<LittleEndian>(self.y)?;
        w.write_f32::<LittleEndian>(self.z)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let x = r.read_f32::<LittleEndian>()?;
        let y = r.read_f32::<LittleEndian>()?;
        let z = r.read_f32::<LittleEndian>()?;
        Ok(Vec3::new(x, y, z))
    }
}

impl Wire for Vec4 {
    fn size(&self) -> u32 {
        16
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f32::<LittleEndian>(self.x)?;
        w.write_f32::<LittleEndian>(self.y)?;
        w.write_f32::<LittleEndian>(self.z)?;
        w.write_f32::<LittleEndian>(self.w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let x = r.read_f32::<LittleEndian>()?;
        let y = r.read_f32::<LittleEndian>()?;
        let z = r.read_f32::<LittleEndian>()?;
        let w = r.read_f32::<LittleEndian>()?;
        Ok(Vec4::new(x, y, z, w))
    }
}

impl Wire for Quat {
    fn size(&self) -> u32 {
        16
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_f32::<LittleEndian>(self.x)?;
        w.write_f32::<LittleEndian>(self.y)?;
        w.write_f32::<LittleEndian>(self.z)?;
        w.write_f32::<LittleEndian>(self.w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let x = r.read_f32::<LittleEndian>()?;
        let y = r.read_f32::<LittleEndian>()?;
        let z = r.read_f32::<LittleEndian>()?;
        let w = r.read_f32::<LittleEndian>()?;
        Ok(Quat::from_xyzw(x, y, z, w))
    }
}

impl Wire for Mat4 {
    fn size(&self) -> u32 {
        64
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for v in self.to_cols_array() {
            w.write_f32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut cols = [0.0f32; 16];
        for v in &mut cols {
            *v = r.read_f32::<LittleEndian>()?;
        }
        Ok(Mat4::from_cols_array(&cols))
    }
}

impl Wire for String {
    fn size(&self) -> u32 {
        4 + self.len() as u32
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.len() as u32)?;
        w.write_all(self.as_bytes())
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let len = r.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len.min(MAX_PREALLOC)];
        if len <= MAX_PREALLOC {
            r.read_exact(&mut bytes)?;
        } else {
            bytes.clear();
            let mut taken = r.take(len as u64);
            taken.read_to_end(&mut bytes)?;
            if bytes.len() != len {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn size(&self) -> u32 {
        4 + self.iter().map(Wire::size).sum::<u32>()
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.len() as u32)?;
        for item in self {
            item.encode(w)?;
        }
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let len = r.read_u32::<LittleEndian>()? as usize;
        let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
        for _ in 0..len {
            items.push(T::decode(r)?);
        }
        Ok(items)
    }
}
