//! Mesh data model: flag-gated buffers, refine configuration, derived outputs
//!
//! A mesh is a transform plus a set of optional buffers. A bit-flag word
//! declares which buffers are populated; on the wire only flagged buffers are
//! written, in flag-bit order. In memory the flags are plain named bits — the
//! serialized `u32` layout is the only compatibility contract.

use crate::codec::Wire;
use crate::entity::Transform;
use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::io::{self, Read, Write};

bitflags! {
    /// Which optional mesh buffers are populated.
    ///
    /// Bit positions are wire format; do not reorder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MeshDataFlags: u32 {
        const VISIBLE             = 1 << 0;
        const HAS_REFINE_SETTINGS = 1 << 1;
        const HAS_INDICES         = 1 << 2;
        const HAS_COUNTS          = 1 << 3;
        const HAS_POINTS          = 1 << 4;
        const HAS_NORMALS         = 1 << 5;
        const HAS_TANGENTS        = 1 << 6;
        const HAS_UV              = 1 << 7;
        const HAS_MATERIAL_IDS    = 1 << 8;
        const HAS_BONES           = 1 << 9;
    }
}

bitflags! {
    /// Which refinement stages run, and axis/uv conventions to apply.
    ///
    /// Bit positions are wire format; do not reorder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RefineFlags: u32 {
        const SPLIT                         = 1 << 0;
        const TRIANGULATE                   = 1 << 1;
        const OPTIMIZE_TOPOLOGY             = 1 << 2;
        const SWAP_HANDEDNESS               = 1 << 3;
        const SWAP_FACES                    = 1 << 4;
        const GEN_NORMALS                   = 1 << 5;
        const GEN_NORMALS_WITH_SMOOTH_ANGLE = 1 << 6;
        const GEN_TANGENTS                  = 1 << 7;
        const APPLY_LOCAL2WORLD             = 1 << 8;
        const APPLY_WORLD2LOCAL             = 1 << 9;
        const BAKE_SKIN                     = 1 << 10;
        // Tool-specific conventions.
        const INVERT_V                      = 1 << 11;
        const MIRROR_X                      = 1 << 12;
        const MIRROR_Y                      = 1 << 13;
        const MIRROR_Z                      = 1 << 14;
    }
}

/// Configuration for [`Mesh::refine`].
///
/// `split_unit` is the maximum vertex count per produced split, bounded by
/// the 16-bit index range of downstream GPU index buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineSettings {
    pub flags: RefineFlags,
    pub scale_factor: f32,
    /// Hard-edge threshold in radians for smooth-angle normal generation.
    pub smooth_angle: f32,
    pub split_unit: u32,
    pub local2world: Mat4,
    pub world2local: Mat4,
}

impl Default for RefineSettings {
    fn default() -> Self {
        Self {
            flags: RefineFlags::empty(),
            scale_factor: 1.0,
            smooth_angle: 0.0,
            split_unit: 65000,
            local2world: Mat4::IDENTITY,
            world2local: Mat4::IDENTITY,
        }
    }
}

impl Wire for RefineSettings {
    fn size(&self) -> u32 {
        4 + 4 + 4 + 4 + 64 + 64
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.flags.bits().encode(w)?;
        self.scale_factor.encode(w)?;
        self.smooth_angle.encode(w)?;
        self.split_unit.encode(w)?;
        self.local2world.encode(w)?;
        self.world2local.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            flags: RefineFlags::from_bits_truncate(u32::decode(r)?),
            scale_factor: f32::decode(r)?,
            smooth_angle: f32::decode(r)?,
            split_unit: u32::decode(r)?,
            local2world: Mat4::decode(r)?,
            world2local: Mat4::decode(r)?,
        })
    }
}

/// A contiguous index range sharing one material ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submesh {
    pub index_offset: u32,
    pub index_count: u32,
    pub material_id: i32,
}

/// A self-contained, vertex-budgeted triangle chunk produced by refinement.
///
/// Indices are split-local; each split carries its own copy of the vertex
/// attributes it references plus a material-grouped submesh table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Split {
    pub points: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec4>,
    pub uv: Vec<Vec2>,
    pub indices: Vec<u32>,
    pub submeshes: Vec<Submesh>,
}

impl Split {
    pub fn vertex_count(&self) -> usize {
        self.points.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Fixed 4-wide top skin weights per vertex, ready for GPU skinning.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Weights4 {
    pub weights: [f32; 4],
    pub indices: [u32; 4],
}

/// A renderable scene node: transform, optional geometry buffers, skin data
/// and refine configuration.
///
/// `submeshes`, `splits` and `weights4` are derived by [`Mesh::refine`] and
/// never serialized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub transform: Transform,
    pub flags: MeshDataFlags,
    pub refine_settings: RefineSettings,

    pub points: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec4>,
    pub uv: Vec<Vec2>,
    /// Per-face vertex counts; empty means `indices` is a pure triangle list.
    pub counts: Vec<u32>,
    /// Flattened face indices.
    pub indices: Vec<u32>,
    /// Per-face material IDs, parallel to `counts`.
    pub material_ids: Vec<i32>,

    // Skin data.
    pub bones_per_vertex: u32,
    pub bone_weights: Vec<f32>,
    pub bone_indices: Vec<u32>,
    pub bones: Vec<String>,
    /// One inverse rest-pose matrix per bone.
    pub bindposes: Vec<Mat4>,

    // Derived by refine(), never serialized.
    pub submeshes: Vec<Submesh>,
    pub splits: Vec<Split>,
    pub weights4: Vec<Weights4>,
}

impl Mesh {
    /// Node path, the stable identity key.
    pub fn path(&self) -> &str {
        &self.transform.entity.path
    }

    pub fn vertex_count(&self) -> usize {
        self.points.len()
    }

    /// Whether usable skin data is attached.
    pub fn has_skin(&self) -> bool {
        self.bones_per_vertex > 0 && !self.bone_weights.is_empty() && !self.bindposes.is_empty()
    }

    /// Reset all buffers and derived outputs, keeping the transform.
    pub fn clear(&mut self) {
        self.flags = MeshDataFlags::empty();
        self.refine_settings = RefineSettings::default();
        self.points.clear();
        self.normals.clear();
        self.tangents.clear();
        self.uv.clear();
        self.counts.clear();
        self.indices.clear();
        self.material_ids.clear();
        self.bones_per_vertex = 0;
        self.bone_weights.clear();
        self.bone_indices.clear();
        self.bones.clear();
        self.bindposes.clear();
        self.submeshes.clear();
        self.splits.clear();
        self.weights4.clear();
    }

    /// The flag word as it goes on the wire: state bits from `flags`,
    /// presence bits from actual buffer contents. Encode writes exactly the
    /// sections these bits declare.
    pub fn wire_flags(&self) -> MeshDataFlags {
        let mut f =
            self.flags & (MeshDataFlags::VISIBLE | MeshDataFlags::HAS_REFINE_SETTINGS);
        f.set(MeshDataFlags::HAS_INDICES, !self.indices.is_empty());
        f.set(MeshDataFlags::HAS_COUNTS, !self.counts.is_empty());
        f.set(MeshDataFlags::HAS_POINTS, !self.points.is_empty());
        f.set(MeshDataFlags::HAS_NORMALS, !self.normals.is_empty());
        f.set(MeshDataFlags::HAS_TANGENTS, !self.tangents.is_empty());
        f.set(MeshDataFlags::HAS_UV, !self.uv.is_empty());
        f.set(MeshDataFlags::HAS_MATERIAL_IDS, !self.material_ids.is_empty());
        f.set(MeshDataFlags::HAS_BONES, !self.bone_weights.is_empty());
        f
    }

    /// Check the cross-buffer invariants. Not called by the codec; intended
    /// for producers before sending.
    pub fn validate(&self) -> Result<(), String> {
        if !self.counts.is_empty() && !self.indices.is_empty() {
            let total: u64 = self.counts.iter().map(|&c| c as u64).sum();
            if total != self.indices.len() as u64 {
                return Err(format!(
                    "face counts sum to {} but index buffer holds {}",
                    total,
                    self.indices.len()
                ));
            }
        }

        if !self.material_ids.is_empty() && self.material_ids.len() != self.counts.len() {
            return Err(format!(
                "material ID count {} doesn't match face count {}",
                self.material_ids.len(),
                self.counts.len()
            ));
        }

        if let Some(&max) = self.indices.iter().max() {
            if max as usize >= self.points.len() {
                return Err(format!(
                    "index {} exceeds vertex count {}",
                    max,
                    self.points.len()
                ));
            }
        }

        if self.bones_per_vertex > 0 {
            let expected = self.points.len() * self.bones_per_vertex as usize;
            if self.bone_weights.len() != expected || self.bone_indices.len() != expected {
                return Err(format!(
                    "skin weight/index count {}/{} doesn't match vertices x bones_per_vertex = {}",
                    self.bone_weights.len(),
                    self.bone_indices.len(),
                    expected
                ));
            }
            if self.bones.len() != self.bindposes.len() {
                return Err(format!(
                    "bone name count {} doesn't match bindpose count {}",
                    self.bones.len(),
                    self.bindposes.len()
                ));
            }
        }

        Ok(())
    }
}

impl Wire for Mesh {
    fn size(&self) -> u32 {
        let flags = self.wire_flags();
        let mut size = self.transform.size() + 4;
        if flags.contains(MeshDataFlags::HAS_REFINE_SETTINGS) {
            size += self.refine_settings.size();
        }
        if flags.contains(MeshDataFlags::HAS_INDICES) {
            size += self.indices.size();
        }
        if flags.contains(MeshDataFlags::HAS_COUNTS) {
            size += self.counts.size();
        }
        if flags.contains(MeshDataFlags::HAS_POINTS) {
            size += self.points.size();
        }
        if flags.contains(MeshDataFlags::HAS_NORMALS) {
            size += self.normals.size();
        }
        if flags.contains(MeshDataFlags::HAS_TANGENTS) {
            size += self.tangents.size();
        }
        if flags.contains(MeshDataFlags::HAS_UV) {
            size += self.uv.size();
        }
        if flags.contains(MeshDataFlags::HAS_MATERIAL_IDS) {
            size += self.material_ids.size();
        }
        if flags.contains(MeshDataFlags::HAS_BONES) {
            size += 4
                + self.bone_weights.size()
                + self.bone_indices.size()
                + self.bones.size()
                + self.bindposes.size();
        }
        size
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let flags = self.wire_flags();
        self.transform.encode(w)?;
        flags.bits().encode(w)?;
        if flags.contains(MeshDataFlags::HAS_REFINE_SETTINGS) {
            self.refine_settings.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_INDICES) {
            self.indices.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_COUNTS) {
            self.counts.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_POINTS) {
            self.points.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_NORMALS) {
            self.normals.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_TANGENTS) {
            self.tangents.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_UV) {
            self.uv.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_MATERIAL_IDS) {
            self.material_ids.encode(w)?;
        }
        if flags.contains(MeshDataFlags::HAS_BONES) {
            self.bones_per_vertex.encode(w)?;
            self.bone_weights.encode(w)?;
            self.bone_indices.encode(w)?;
            self.bones.encode(w)?;
            self.bindposes.encode(w)?;
        }
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut mesh = Mesh {
            transform: Transform::decode(r)?,
            flags: MeshDataFlags::from_bits_truncate(u32::decode(r)?),
            ..Mesh::default()
        };
        if mesh.flags.contains(MeshDataFlags::HAS_REFINE_SETTINGS) {
            mesh.refine_settings = RefineSettings::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_INDICES) {
            mesh.indices = Vec::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_COUNTS) {
            mesh.counts = Vec::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_POINTS) {
            mesh.points = Vec::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_NORMALS) {
            mesh.normals = Vec::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_TANGENTS) {
            mesh.tangents = Vec::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_UV) {
            mesh.uv = Vec::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_MATERIAL_IDS) {
            mesh.material_ids = Vec::decode(r)?;
        }
        if mesh.flags.contains(MeshDataFlags::HAS_BONES) {
            mesh.bones_per_vertex = u32::decode(r)?;
            mesh.bone_weights = Vec::decode(r)?;
            mesh.bone_indices = Vec::decode(r)?;
            mesh.bones = Vec::decode(r)?;
            mesh.bindposes = Vec::decode(r)?;
        }
        Ok(mesh)
    }
}
