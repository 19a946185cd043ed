//! Scene node records: entity identity, transforms and cameras
//!
//! Pure data, no behavior beyond the wire codec. Field order on the wire is
//! fixed (base fields first, then derived); reordering breaks compatibility
//! because the format is positional, not self-describing.

use crate::codec::Wire;
use glam::{Quat, Vec3};
use std::io::{self, Read, Write};

/// Identity of a scene node.
///
/// `path` is the hierarchical, stable identity key a receiver uses to upsert
/// across repeated Set messages; hierarchy is implied only by path structure.
/// `id` is a session-scoped integer assigned by the producer, not guaranteed
/// globally unique; receivers may ignore it except to correlate Delete
/// targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    pub id: i32,
    pub path: String,
}

impl Wire for Entity {
    fn size(&self) -> u32 {
        4 + self.path.size()
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.id.encode(w)?;
        self.path.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let id = i32::decode(r)?;
        let path = String::decode(r)?;
        Ok(Self { id, path })
    }
}

/// Translation / rotation / scale block.
///
/// `rotation_euler_zxy` is a parallel Euler representation maintained by the
/// producer for tool round-tripping. It is advisory and may be stale; the
/// codec never derives it from `rotation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trs {
    pub position: Vec3,
    pub rotation: Quat,
    pub rotation_euler_zxy: Vec3,
    pub scale: Vec3,
}

impl Default for Trs {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            rotation_euler_zxy: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Wire for Trs {
    fn size(&self) -> u32 {
        12 + 16 + 12 + 12
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.position.encode(w)?;
        self.rotation.encode(w)?;
        self.rotation_euler_zxy.encode(w)?;
        self.scale.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            position: Vec3::decode(r)?,
            rotation: Quat::decode(r)?,
            rotation_euler_zxy: Vec3::decode(r)?,
            scale: Vec3::decode(r)?,
        })
    }
}

/// A scene node with placement: entity identity plus a TRS block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transform {
    pub entity: Entity,
    pub trs: Trs,
}

impl Wire for Transform {
    fn size(&self) -> u32 {
        self.entity.size() + self.trs.size()
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.entity.encode(w)?;
        self.trs.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            entity: Entity::decode(r)?,
            trs: Trs::decode(r)?,
        })
    }
}

/// A camera node: a transform plus a vertical field of view in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub transform: Transform,
    pub fov: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            transform: Transform::default(),
            fov: 30.0,
        }
    }
}

impl Wire for Camera {
    fn size(&self) -> u32 {
        self.transform.size() + 4
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.transform.encode(w)?;
        self.fov.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            transform: Transform::decode(r)?,
            fov: f32::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(value: &T) -> T {
        let mut buf = Vec::new();
        value.encode(&mut buf).expect("encode failed");
        assert_eq!(buf.len() as u32, value.size());
        T::decode(&mut Cursor::new(buf)).expect("decode failed")
    }

    #[test]
    fn test_transform_roundtrip() {
        let transform = Transform {
            entity: Entity {
                id: 17,
                path: "/root/pelvis/spine".to_string(),
            },
            trs: Trs {
                position: Vec3::new(1.0, 2.0, 3.0),
                rotation: Quat::from_rotation_y(0.5),
                rotation_euler_zxy: Vec3::new(0.0, 28.6, 0.0),
                scale: Vec3::splat(2.0),
            },
        };

        assert_eq!(roundtrip(&transform), transform);
    }

    #[test]
    fn test_camera_roundtrip() {
        let mut camera = Camera::default();
        camera.transform.entity.path = "/root/camera".to_string();
        camera.fov = 60.0;

        assert_eq!(roundtrip(&camera), camera);
    }

    #[test]
    fn test_default_trs_is_identity() {
        let trs = Trs::default();
        assert_eq!(trs.position, Vec3::ZERO);
        assert_eq!(trs.rotation, Quat::IDENTITY);
        assert_eq!(trs.scale, Vec3::ONE);
    }

    #[test]
    fn test_euler_is_not_derived() {
        // The codec carries the producer's Euler block verbatim, even when it
        // disagrees with the quaternion.
        let mut transform = Transform::default();
        transform.trs.rotation = Quat::from_rotation_x(1.0);
        transform.trs.rotation_euler_zxy = Vec3::new(999.0, 0.0, 0.0);

        let decoded = roundtrip(&transform);
        assert_eq!(decoded.trs.rotation_euler_zxy, Vec3::new(999.0, 0.0, 0.0));
    }
}
