//! Mesh refinement: normalizes authored geometry into render-ready splits
//!
//! Converts one authoring mesh (polygonal, arbitrary winding/space, optionally
//! skinned) into material-grouped submesh ranges and vertex-budgeted triangle
//! chunks. Stages run in a fixed order, each gated by its refine flag, each
//! feeding the next. Geometry anomalies are non-fatal: the offending element
//! is skipped or zeroed with a warning and the pipeline continues.

use crate::mesh::{Mesh, RefineFlags, Split, Submesh, Weights4};
use glam::{Mat3, Mat4, Vec3, Vec4};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Merge tolerance for topology optimization, applied by quantization.
const WELD_EPSILON: f32 = 1e-5;

impl Mesh {
    /// Run the refinement pipeline configured in `refine_settings`.
    ///
    /// Mutates the authoring buffers in place (coordinate transform, mirror,
    /// skin bake and convention swaps are destructive) and populates the
    /// derived outputs: `submeshes`, `splits` and, for skinned meshes that
    /// were not baked, `weights4`. Presence flags are updated to match the
    /// final buffers.
    pub fn refine(&mut self) {
        let settings = self.refine_settings;
        let flags = settings.flags;

        // 1. Coordinate space. local2world wins if both are set.
        if flags.contains(RefineFlags::APPLY_LOCAL2WORLD) {
            self.apply_transform(&settings.local2world);
        } else if flags.contains(RefineFlags::APPLY_WORLD2LOCAL) {
            self.apply_transform(&settings.world2local);
        }

        // 2. Axis mirrors, plane through the origin.
        if flags.contains(RefineFlags::MIRROR_X) {
            self.apply_mirror(Vec3::X, 0.0);
        }
        if flags.contains(RefineFlags::MIRROR_Y) {
            self.apply_mirror(Vec3::Y, 0.0);
        }
        if flags.contains(RefineFlags::MIRROR_Z) {
            self.apply_mirror(Vec3::Z, 0.0);
        }

        // 3. Skin bake, before convention swaps so static output reflects the
        // final convention.
        if flags.contains(RefineFlags::BAKE_SKIN) && self.has_skin() {
            self.bake_skin();
        }

        // 4. Handedness and winding conventions, independent toggles.
        if flags.contains(RefineFlags::SWAP_HANDEDNESS) {
            self.swap_handedness();
        }
        if flags.contains(RefineFlags::SWAP_FACES) {
            self.reverse_winding();
        }
        if flags.contains(RefineFlags::INVERT_V) {
            for uv in &mut self.uv {
                uv.y = 1.0 - uv.y;
            }
        }

        // 5. Triangulation, producing per-triangle materials. Grouping by
        // material only happens on the freshly emitted triangle list; a mesh
        // that skips this stage keeps its authored buffer order.
        let tri_materials = if flags.contains(RefineFlags::TRIANGULATE)
            && !self.counts.is_empty()
        {
            let mut materials = self.triangulate();
            self.group_by_material(&mut materials);
            materials
        } else {
            self.per_triangle_materials()
        };
        let is_triangles =
            self.counts.is_empty() || self.counts.iter().all(|&c| c == 3);
        if !is_triangles {
            warn!(
                path = self.path(),
                "mesh still holds polygon faces; enable triangulation to build splits"
            );
        }

        // 6. Normals.
        if is_triangles
            && flags.intersects(
                RefineFlags::GEN_NORMALS | RefineFlags::GEN_NORMALS_WITH_SMOOTH_ANGLE,
            )
        {
            if flags.contains(RefineFlags::GEN_NORMALS_WITH_SMOOTH_ANGLE)
                && settings.smooth_angle > 0.0
            {
                self.gen_normals_with_smooth_angle(settings.smooth_angle);
            } else {
                self.gen_normals();
            }
        }

        // 7. Tangents, from normals and uv.
        if is_triangles && flags.contains(RefineFlags::GEN_TANGENTS) {
            self.gen_tangents();
        }

        // 8. Uniform scale.
        if settings.scale_factor != 1.0 {
            for p in &mut self.points {
                *p *= settings.scale_factor;
            }
        }

        // 9. Vertex welding.
        if is_triangles && flags.contains(RefineFlags::OPTIMIZE_TOPOLOGY) {
            self.optimize_topology();
        }

        // Unbaked skins get their GPU-ready fixed-width weights.
        if self.has_skin() {
            self.build_weights4();
        }

        // 10. Submesh table and vertex-budgeted splits.
        if is_triangles {
            self.build_submeshes(&tri_materials);
            let unit = if flags.contains(RefineFlags::SPLIT) {
                settings.split_unit as usize
            } else {
                usize::MAX
            };
            self.build_splits(&tri_materials, unit);
        }

        self.flags = self.wire_flags();
        debug!(
            path = self.path(),
            vertices = self.points.len(),
            triangles = self.indices.len() / 3,
            splits = self.splits.len(),
            "mesh refined"
        );
    }

    /// Apply an affine transform to positions; normals go through the
    /// inverse-transpose of the linear part and are renormalized.
    pub fn apply_transform(&mut self, m: &Mat4) {
        for p in &mut self.points {
            *p = m.transform_point3(*p);
        }
        if !self.normals.is_empty() {
            let nm = Mat3::from_mat4(*m).inverse().transpose();
            for n in &mut self.normals {
                *n = (nm * *n).normalize_or_zero();
            }
        }
    }

    /// Reflect points and normals across the plane `dot(x, plane_n) = plane_d`
    /// and reverse winding so faces keep their outward orientation.
    ///
    /// Applying the same mirror twice restores the original geometry.
    pub fn apply_mirror(&mut self, plane_n: Vec3, plane_d: f32) {
        for p in &mut self.points {
            *p -= 2.0 * (p.dot(plane_n) - plane_d) * plane_n;
        }
        for n in &mut self.normals {
            *n -= 2.0 * n.dot(plane_n) * plane_n;
        }
        self.reverse_winding();
    }

    fn swap_handedness(&mut self) {
        for p in &mut self.points {
            p.x = -p.x;
        }
        for n in &mut self.normals {
            n.x = -n.x;
        }
        for t in &mut self.tangents {
            t.x = -t.x;
        }
    }

    /// Reverse the vertex order of every face.
    fn reverse_winding(&mut self) {
        if self.counts.is_empty() {
            for tri in self.indices.chunks_exact_mut(3) {
                tri.swap(0, 2);
            }
        } else {
            let mut offset = 0usize;
            for &c in &self.counts {
                let c = c as usize;
                if let Some(face) = self.indices.get_mut(offset..offset + c) {
                    face.reverse();
                }
                offset += c;
            }
        }
    }

    /// Deform positions and normals into the bind pose using the per-vertex
    /// weights, then drop all skin buffers. The mesh becomes static.
    fn bake_skin(&mut self) {
        let bpv = self.bones_per_vertex as usize;
        let count = self.points.len();
        let has_normals = self.normals.len() == count;
        let mut out_points = vec![Vec3::ZERO; count];
        let mut out_normals = vec![Vec3::ZERO; count];
        let mut missing_bones = 0usize;

        for vi in 0..count {
            let mut pos = Vec3::ZERO;
            let mut nrm = Vec3::ZERO;
            let mut total = 0.0f32;
            for k in 0..bpv {
                let slot = vi * bpv + k;
                let w = self.bone_weights.get(slot).copied().unwrap_or(0.0);
                if w == 0.0 {
                    continue;
                }
                let bi = self.bone_indices.get(slot).copied().unwrap_or(0) as usize;
                let Some(bindpose) = self.bindposes.get(bi) else {
                    missing_bones += 1;
                    continue;
                };
                pos += bindpose.transform_point3(self.points[vi]) * w;
                if has_normals {
                    nrm += bindpose.transform_vector3(self.normals[vi]) * w;
                }
                total += w;
            }
            out_points[vi] = if total > 0.0 { pos / total } else { self.points[vi] };
            if has_normals {
                out_normals[vi] = if total > 0.0 {
                    nrm.normalize_or_zero()
                } else {
                    self.normals[vi]
                };
            }
        }
        if missing_bones > 0 {
            warn!(
                path = self.path(),
                missing_bones, "skin references bones without bindposes; contributions skipped"
            );
        }

        self.points = out_points;
        if has_normals {
            self.normals = out_normals;
        }
        self.bones_per_vertex = 0;
        self.bone_weights.clear();
        self.bone_indices.clear();
        self.bones.clear();
        self.bindposes.clear();
        self.weights4.clear();
    }

    /// Whether the skin buffers are long enough to index per vertex. Decoded
    /// input can violate the length invariant; such a mesh is treated as
    /// unskinned wherever per-vertex rows are sliced.
    fn skin_buffers_cover(&self, count: usize) -> bool {
        if !self.has_skin() {
            return false;
        }
        let expected = count * self.bones_per_vertex as usize;
        if self.bone_weights.len() < expected || self.bone_indices.len() < expected {
            warn!(
                path = self.path(),
                weights = self.bone_weights.len(),
                expected,
                "skin buffers shorter than vertices x bones_per_vertex; treating mesh as unskinned"
            );
            return false;
        }
        true
    }

    /// Convert polygon faces into a pure triangle list. Fan decomposition for
    /// triangles and quads, ear clipping beyond that; sub-triangle faces are
    /// dropped. Returns the material ID of each emitted triangle and leaves
    /// `counts` empty.
    fn triangulate(&mut self) -> Vec<i32> {
        let counts = std::mem::take(&mut self.counts);
        let src = std::mem::take(&mut self.indices);
        let materials = std::mem::take(&mut self.material_ids);

        let mut tris: Vec<u32> = Vec::with_capacity(src.len());
        let mut tri_materials: Vec<i32> = Vec::with_capacity(counts.len());
        let mut dropped = 0usize;
        let mut offset = 0usize;

        for (fi, &c) in counts.iter().enumerate() {
            let c = c as usize;
            let Some(face) = src.get(offset..offset + c) else {
                warn!(
                    path = self.path(),
                    face = fi,
                    "face overruns the index buffer, stopping triangulation"
                );
                break;
            };
            offset += c;
            let material = materials.get(fi).copied().unwrap_or(0);
            let emitted = match c {
                0..=2 => {
                    dropped += 1;
                    0
                }
                3 => {
                    tris.extend_from_slice(face);
                    1
                }
                4 => {
                    tris.extend_from_slice(&[face[0], face[1], face[2]]);
                    tris.extend_from_slice(&[face[0], face[2], face[3]]);
                    2
                }
                _ => ear_clip(face, &self.points, &mut tris),
            };
            for _ in 0..emitted {
                tri_materials.push(material);
            }
        }
        if dropped > 0 {
            warn!(
                path = self.path(),
                dropped, "dropped degenerate faces with fewer than 3 vertices"
            );
        }

        self.indices = tris;
        tri_materials
    }

    /// Per-triangle materials for a mesh that is already a triangle list.
    fn per_triangle_materials(&self) -> Vec<i32> {
        let tri_count = self.indices.len() / 3;
        if self.material_ids.is_empty() || tri_count == 0 {
            return Vec::new();
        }
        if !self.counts.is_empty() && self.counts.iter().all(|&c| c == 3) {
            let mut materials: Vec<i32> = self
                .material_ids
                .iter()
                .copied()
                .chain(std::iter::repeat(0))
                .take(tri_count)
                .collect();
            materials.truncate(tri_count);
            return materials;
        }
        if self.material_ids.len() == tri_count {
            return self.material_ids.clone();
        }
        Vec::new()
    }

    /// Stable-reorder triangles so each material forms one contiguous run.
    /// Only valid right after triangulation, when `counts` and `material_ids`
    /// have been consumed and `indices` is the pipeline's own triangle list.
    fn group_by_material(&mut self, tri_materials: &mut Vec<i32>) {
        let tri_count = self.indices.len() / 3;
        if tri_materials.len() != tri_count || tri_count == 0 {
            return;
        }
        let grouped = tri_materials.windows(2).all(|w| w[0] <= w[1]);
        if grouped {
            return;
        }
        let mut order: Vec<usize> = (0..tri_count).collect();
        order.sort_by_key(|&t| tri_materials[t]);

        let mut indices = Vec::with_capacity(self.indices.len());
        let mut materials = Vec::with_capacity(tri_count);
        for &t in &order {
            indices.extend_from_slice(&self.indices[t * 3..t * 3 + 3]);
            materials.push(tri_materials[t]);
        }
        self.indices = indices;
        *tri_materials = materials;
    }

    /// Area-weighted vertex normals from face normals.
    fn gen_normals(&mut self) {
        let count = self.points.len();
        let mut acc = vec![Vec3::ZERO; count];
        for tri in self.indices.chunks_exact(3) {
            let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            if a >= count || b >= count || c >= count {
                continue;
            }
            // Unnormalized cross product length is twice the face area, which
            // is exactly the accumulation weight.
            let face_normal =
                (self.points[b] - self.points[a]).cross(self.points[c] - self.points[a]);
            acc[a] += face_normal;
            acc[b] += face_normal;
            acc[c] += face_normal;
        }
        self.normals = acc.into_iter().map(|v| v.normalize_or_zero()).collect();
    }

    /// Vertex normals with hard-edge splitting: a corner only smooths with
    /// incident faces whose normal is within `smooth_angle` radians of its
    /// own face. Corners that end up with different normals get their own
    /// vertex, so the vertex count may grow.
    fn gen_normals_with_smooth_angle(&mut self, smooth_angle: f32) {
        let count = self.points.len();
        let tri_count = self.indices.len() / 3;
        if tri_count == 0 {
            self.gen_normals();
            return;
        }
        let cos_threshold = smooth_angle.cos();

        let mut face_raw = vec![Vec3::ZERO; tri_count];
        let mut face_unit = vec![Vec3::ZERO; tri_count];
        let mut incident: Vec<Vec<u32>> = vec![Vec::new(); count];
        for (t, tri) in self.indices.chunks_exact(3).enumerate() {
            let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            if a >= count || b >= count || c >= count {
                continue;
            }
            let raw = (self.points[b] - self.points[a]).cross(self.points[c] - self.points[a]);
            face_raw[t] = raw;
            face_unit[t] = raw.normalize_or_zero();
            incident[a].push(t as u32);
            incident[b].push(t as u32);
            incident[c].push(t as u32);
        }

        let has_uv = self.uv.len() == count;
        let skinned = self.skin_buffers_cover(count);
        let bpv = self.bones_per_vertex as usize;

        let mut remap: HashMap<(u32, [i32; 3]), u32> = HashMap::new();
        let mut points = Vec::with_capacity(count);
        let mut normals = Vec::with_capacity(count);
        let mut uv = Vec::new();
        let mut bone_weights = Vec::new();
        let mut bone_indices = Vec::new();
        let mut indices = Vec::with_capacity(self.indices.len());

        let old_indices = std::mem::take(&mut self.indices);
        for (t, tri) in old_indices.chunks_exact(3).enumerate() {
            for &v in tri {
                if v as usize >= count {
                    continue;
                }
                let mut sum = Vec3::ZERO;
                for &u in &incident[v as usize] {
                    if face_unit[u as usize].dot(face_unit[t]) >= cos_threshold {
                        sum += face_raw[u as usize];
                    }
                }
                let normal = sum.normalize_or_zero();
                let normal = if normal == Vec3::ZERO { face_unit[t] } else { normal };
                let key = (v, quantize3(normal, 1.0e4));
                let local = *remap.entry(key).or_insert_with(|| {
                    let idx = points.len() as u32;
                    points.push(self.points[v as usize]);
                    normals.push(normal);
                    if has_uv {
                        uv.push(self.uv[v as usize]);
                    }
                    if skinned {
                        let row = v as usize * bpv;
                        bone_weights.extend_from_slice(&self.bone_weights[row..row + bpv]);
                        bone_indices.extend_from_slice(&self.bone_indices[row..row + bpv]);
                    }
                    idx
                });
                indices.push(local);
            }
        }

        self.points = points;
        self.normals = normals;
        if has_uv {
            self.uv = uv;
        }
        if skinned {
            self.bone_weights = bone_weights;
            self.bone_indices = bone_indices;
        }
        self.indices = indices;
        // Any previously generated tangents no longer line up.
        self.tangents.clear();
    }

    /// Per-vertex tangents with handedness sign via the UV-gradient method.
    /// Requires normals and uv; degenerate UV triangles contribute nothing
    /// and may leave zero tangents.
    fn gen_tangents(&mut self) {
        let count = self.points.len();
        if self.normals.len() != count || self.uv.len() != count {
            warn!(
                path = self.path(),
                "tangent generation needs matching normals and uv; skipped"
            );
            return;
        }

        let mut tan_u = vec![Vec3::ZERO; count];
        let mut tan_v = vec![Vec3::ZERO; count];
        let mut degenerate = 0usize;
        for tri in self.indices.chunks_exact(3) {
            let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            if a >= count || b >= count || c >= count {
                continue;
            }
            let e1 = self.points[b] - self.points[a];
            let e2 = self.points[c] - self.points[a];
            let d1 = self.uv[b] - self.uv[a];
            let d2 = self.uv[c] - self.uv[a];
            let denom = d1.x * d2.y - d2.x * d1.y;
            if denom.abs() < 1.0e-8 {
                degenerate += 1;
                continue;
            }
            let r = 1.0 / denom;
            let sdir = (e1 * d2.y - e2 * d1.y) * r;
            let tdir = (e2 * d1.x - e1 * d2.x) * r;
            for &v in &[a, b, c] {
                tan_u[v] += sdir;
                tan_v[v] += tdir;
            }
        }

        let mut zeroed = 0usize;
        self.tangents = (0..count)
            .map(|v| {
                let n = self.normals[v];
                let t = (tan_u[v] - n * n.dot(tan_u[v])).normalize_or_zero();
                if t == Vec3::ZERO {
                    zeroed += 1;
                    return Vec4::ZERO;
                }
                let sign = if n.cross(t).dot(tan_v[v]) < 0.0 { -1.0 } else { 1.0 };
                Vec4::new(t.x, t.y, t.z, sign)
            })
            .collect();
        if degenerate > 0 || zeroed > 0 {
            warn!(
                path = self.path(),
                degenerate_uv_faces = degenerate,
                zero_tangents = zeroed,
                "degenerate UV during tangent generation"
            );
        }
    }

    /// Best-effort weld of vertices identical in position/normal/tangent/uv
    /// within an epsilon. Not guaranteed minimal.
    fn optimize_topology(&mut self) {
        let count = self.points.len();
        if count == 0 || self.indices.is_empty() {
            return;
        }
        let inv_eps = 1.0 / WELD_EPSILON;
        let has_normals = self.normals.len() == count;
        let has_tangents = self.tangents.len() == count;
        let has_uv = self.uv.len() == count;
        let skinned = self.skin_buffers_cover(count);
        let bpv = self.bones_per_vertex as usize;

        type WeldKey = ([i32; 3], [i32; 3], [i32; 4], [i32; 2]);
        let mut welded: HashMap<WeldKey, u32> = HashMap::new();
        let mut remap = vec![0u32; count];
        let mut points = Vec::with_capacity(count);
        let mut normals = Vec::new();
        let mut tangents = Vec::new();
        let mut uv = Vec::new();
        let mut bone_weights = Vec::new();
        let mut bone_indices = Vec::new();

        for v in 0..count {
            let key: WeldKey = (
                quantize3(self.points[v], inv_eps),
                if has_normals { quantize3(self.normals[v], inv_eps) } else { [0; 3] },
                if has_tangents { quantize4(self.tangents[v], inv_eps) } else { [0; 4] },
                if has_uv { quantize2(self.uv[v], inv_eps) } else { [0; 2] },
            );
            remap[v] = *welded.entry(key).or_insert_with(|| {
                let idx = points.len() as u32;
                points.push(self.points[v]);
                if has_normals {
                    normals.push(self.normals[v]);
                }
                if has_tangents {
                    tangents.push(self.tangents[v]);
                }
                if has_uv {
                    uv.push(self.uv[v]);
                }
                if skinned {
                    let row = v * bpv;
                    bone_weights.extend_from_slice(&self.bone_weights[row..row + bpv]);
                    bone_indices.extend_from_slice(&self.bone_indices[row..row + bpv]);
                }
                idx
            });
        }

        debug!(
            path = self.path(),
            before = count,
            after = points.len(),
            "topology optimization"
        );
        self.points = points;
        if has_normals {
            self.normals = normals;
        }
        if has_tangents {
            self.tangents = tangents;
        }
        if has_uv {
            self.uv = uv;
        }
        if skinned {
            self.bone_weights = bone_weights;
            self.bone_indices = bone_indices;
        }
        for i in &mut self.indices {
            *i = remap[*i as usize];
        }
    }

    /// Collapse variable-width skin weights to the top four per vertex,
    /// renormalized, for GPU skinning.
    fn build_weights4(&mut self) {
        let bpv = self.bones_per_vertex as usize;
        let count = self.points.len();
        self.weights4 = (0..count)
            .map(|v| {
                let row = v * bpv;
                let mut pairs: Vec<(f32, u32)> = (0..bpv)
                    .filter_map(|k| {
                        let w = self.bone_weights.get(row + k).copied()?;
                        let b = self.bone_indices.get(row + k).copied()?;
                        (w > 0.0).then_some((w, b))
                    })
                    .collect();
                pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
                pairs.truncate(4);
                let total: f32 = pairs.iter().map(|p| p.0).sum();
                let mut out = Weights4::default();
                for (k, (w, b)) in pairs.into_iter().enumerate() {
                    out.weights[k] = if total > 0.0 { w / total } else { 0.0 };
                    out.indices[k] = b;
                }
                out
            })
            .collect();
    }

    /// Material-grouped index ranges over the final triangle list.
    fn build_submeshes(&mut self, tri_materials: &[i32]) {
        self.submeshes.clear();
        let tri_count = self.indices.len() / 3;
        if tri_count == 0 {
            return;
        }
        if tri_materials.len() != tri_count {
            self.submeshes.push(Submesh {
                index_offset: 0,
                index_count: (tri_count * 3) as u32,
                material_id: 0,
            });
            return;
        }
        let mut run_start = 0usize;
        for t in 1..=tri_count {
            if t == tri_count || tri_materials[t] != tri_materials[run_start] {
                self.submeshes.push(Submesh {
                    index_offset: (run_start * 3) as u32,
                    index_count: ((t - run_start) * 3) as u32,
                    material_id: tri_materials[run_start],
                });
                run_start = t;
            }
        }
    }

    /// Partition the triangle list into self-contained chunks of at most
    /// `split_unit` vertices, preserving material grouping. Indices are
    /// remapped split-local; a submesh may span several splits.
    fn build_splits(&mut self, tri_materials: &[i32], split_unit: usize) {
        self.splits.clear();
        let tri_count = self.indices.len() / 3;
        if tri_count == 0 {
            return;
        }
        // A triangle can introduce three new vertices at once.
        let split_unit = split_unit.max(3);
        let count = self.points.len();
        let has_normals = self.normals.len() == count;
        let has_tangents = self.tangents.len() == count;
        let has_uv = self.uv.len() == count;
        let materials_valid = tri_materials.len() == tri_count;

        let mut split = Split::default();
        let mut split_materials: Vec<i32> = Vec::new();
        let mut remap: HashMap<u32, u32> = HashMap::new();

        let finalize = |split: &mut Split, materials: &mut Vec<i32>, out: &mut Vec<Split>| {
            if split.indices.is_empty() {
                return;
            }
            let tri_count = materials.len();
            let mut run_start = 0usize;
            for t in 1..=tri_count {
                if t == tri_count || materials[t] != materials[run_start] {
                    split.submeshes.push(Submesh {
                        index_offset: (run_start * 3) as u32,
                        index_count: ((t - run_start) * 3) as u32,
                        material_id: materials[run_start],
                    });
                    run_start = t;
                }
            }
            out.push(std::mem::take(split));
            materials.clear();
        };

        for (t, tri) in self.indices.chunks_exact(3).enumerate() {
            if tri.iter().any(|&v| v as usize >= count) {
                warn!(path = self.path(), triangle = t, "out-of-range index, skipped");
                continue;
            }
            let new_vertices = tri
                .iter()
                .filter(|v| !remap.contains_key(v))
                .collect::<std::collections::HashSet<_>>()
                .len();
            if split.points.len() + new_vertices > split_unit {
                finalize(&mut split, &mut split_materials, &mut self.splits);
                remap.clear();
            }
            for &v in tri {
                let local = *remap.entry(v).or_insert_with(|| {
                    let idx = split.points.len() as u32;
                    split.points.push(self.points[v as usize]);
                    if has_normals {
                        split.normals.push(self.normals[v as usize]);
                    }
                    if has_tangents {
                        split.tangents.push(self.tangents[v as usize]);
                    }
                    if has_uv {
                        split.uv.push(self.uv[v as usize]);
                    }
                    idx
                });
                split.indices.push(local);
            }
            split_materials.push(if materials_valid { tri_materials[t] } else { 0 });
        }
        finalize(&mut split, &mut split_materials, &mut self.splits);
    }
}

/// Triangulate a polygon face by ear clipping. Emits index triples into
/// `out`, keeping the source winding, and returns the triangle count.
fn ear_clip(face: &[u32], points: &[Vec3], out: &mut Vec<u32>) -> usize {
    let n = face.len();
    debug_assert!(n > 4);

    // Newell's method for the polygon normal, robust to concave outlines.
    let mut normal = Vec3::ZERO;
    for i in 0..n {
        let a = points.get(face[i] as usize).copied().unwrap_or(Vec3::ZERO);
        let b = points
            .get(face[(i + 1) % n] as usize)
            .copied()
            .unwrap_or(Vec3::ZERO);
        normal.x += (a.y - b.y) * (a.z + b.z);
        normal.y += (a.z - b.z) * (a.x + b.x);
        normal.z += (a.x - b.x) * (a.y + b.y);
    }
    if normal == Vec3::ZERO {
        normal = Vec3::Z;
    }

    // Project onto the dominant plane.
    let abs = normal.abs();
    let (u_axis, v_axis) = if abs.x >= abs.y && abs.x >= abs.z {
        (1, 2)
    } else if abs.y >= abs.z {
        (0, 2)
    } else {
        (0, 1)
    };
    let project = |idx: u32| -> (f32, f32) {
        let p = points.get(idx as usize).copied().unwrap_or(Vec3::ZERO);
        let arr = p.to_array();
        (arr[u_axis], arr[v_axis])
    };

    let area2 = |a: (f32, f32), b: (f32, f32), c: (f32, f32)| -> f32 {
        (b.0 - a.0) * (c.1 - a.1) - (c.0 - a.0) * (b.1 - a.1)
    };

    // Polygon orientation in projected space.
    let mut signed = 0.0f32;
    for i in 0..n {
        let a = project(face[i]);
        let b = project(face[(i + 1) % n]);
        signed += a.0 * b.1 - b.0 * a.1;
    }
    let orientation = if signed < 0.0 { -1.0 } else { 1.0 };

    let mut remaining: Vec<usize> = (0..n).collect();
    let mut emitted = 0usize;

    'clip: while remaining.len() > 3 {
        let m = remaining.len();
        for i in 0..m {
            let prev = remaining[(i + m - 1) % m];
            let curr = remaining[i];
            let next = remaining[(i + 1) % m];
            let (pa, pb, pc) = (project(face[prev]), project(face[curr]), project(face[next]));
            if area2(pa, pb, pc) * orientation <= 0.0 {
                continue; // reflex corner
            }
            let contains_other = remaining.iter().any(|&o| {
                if o == prev || o == curr || o == next {
                    return false;
                }
                let p = project(face[o]);
                let d0 = area2(pa, pb, p) * orientation;
                let d1 = area2(pb, pc, p) * orientation;
                let d2 = area2(pc, pa, p) * orientation;
                d0 >= 0.0 && d1 >= 0.0 && d2 >= 0.0
            });
            if contains_other {
                continue;
            }
            out.extend_from_slice(&[face[prev], face[curr], face[next]]);
            emitted += 1;
            remaining.remove(i);
            continue 'clip;
        }
        // No ear found: the outline is degenerate or self-intersecting.
        // Fall back to a fan over what is left.
        warn!("no ear found while triangulating a polygon; falling back to fan");
        for i in 1..remaining.len() - 1 {
            out.extend_from_slice(&[
                face[remaining[0]],
                face[remaining[i]],
                face[remaining[i + 1]],
            ]);
            emitted += 1;
        }
        return emitted;
    }
    out.extend_from_slice(&[
        face[remaining[0]],
        face[remaining[1]],
        face[remaining[2]],
    ]);
    emitted + 1
}

fn quantize3(v: Vec3, scale: f32) -> [i32; 3] {
    [
        (v.x * scale).round() as i32,
        (v.y * scale).round() as i32,
        (v.z * scale).round() as i32,
    ]
}

fn quantize4(v: Vec4, scale: f32) -> [i32; 4] {
    [
        (v.x * scale).round() as i32,
        (v.y * scale).round() as i32,
        (v.z * scale).round() as i32,
        (v.w * scale).round() as i32,
    ]
}

fn quantize2(v: glam::Vec2, scale: f32) -> [i32; 2] {
    [(v.x * scale).round() as i32, (v.y * scale).round() as i32]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{MeshDataFlags, RefineSettings};
    use glam::Vec2;

    fn quad() -> Mesh {
        Mesh {
            points: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            uv: vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(1.0, 0.0),
                Vec2::new(1.0, 1.0),
                Vec2::new(0.0, 1.0),
            ],
            counts: vec![4],
            indices: vec![0, 1, 2, 3],
            ..Mesh::default()
        }
    }

    fn refine_with(mesh: &mut Mesh, flags: RefineFlags) {
        mesh.refine_settings = RefineSettings {
            flags,
            ..RefineSettings::default()
        };
        mesh.refine();
    }

    #[test]
    fn test_quad_triangulation() {
        let mut mesh = quad();
        refine_with(&mut mesh, RefineFlags::TRIANGULATE);

        assert!(mesh.counts.is_empty());
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);

        // Both triangles face +Z like the source quad.
        for tri in mesh.indices.chunks_exact(3) {
            let (a, b, c) = (
                mesh.points[tri[0] as usize],
                mesh.points[tri[1] as usize],
                mesh.points[tri[2] as usize],
            );
            assert!((b - a).cross(c - a).z > 0.0);
        }

        // All four original vertices are referenced.
        let used: std::collections::HashSet<u32> = mesh.indices.iter().copied().collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_degenerate_faces_dropped() {
        let mut mesh = quad();
        mesh.points.push(Vec3::new(2.0, 0.0, 0.0));
        mesh.counts = vec![2, 4, 1];
        mesh.indices = vec![0, 1, 0, 1, 2, 3, 4];
        mesh.material_ids = vec![5, 7, 5];
        refine_with(&mut mesh, RefineFlags::TRIANGULATE);

        // Only the quad survives, as two triangles of material 7.
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.submeshes.len(), 1);
        assert_eq!(mesh.submeshes[0].material_id, 7);
        assert_eq!(mesh.submeshes[0].index_count, 6);
    }

    #[test]
    fn test_pentagon_ear_clip() {
        let mut mesh = Mesh {
            points: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(2.5, 1.5, 0.0),
                Vec3::new(1.0, 2.5, 0.0),
                Vec3::new(-0.5, 1.5, 0.0),
            ],
            counts: vec![5],
            indices: vec![0, 1, 2, 3, 4],
            ..Mesh::default()
        };
        refine_with(&mut mesh, RefineFlags::TRIANGULATE);

        assert_eq!(mesh.indices.len(), 9);
        // Triangulated area equals the polygon area.
        let area: f32 = mesh
            .indices
            .chunks_exact(3)
            .map(|tri| {
                let (a, b, c) = (
                    mesh.points[tri[0] as usize],
                    mesh.points[tri[1] as usize],
                    mesh.points[tri[2] as usize],
                );
                (b - a).cross(c - a).length() * 0.5
            })
            .sum();
        assert!((area - 5.25).abs() < 1.0e-4);
    }

    #[test]
    fn test_mirror_involution() {
        let mut mesh = quad();
        let original_points = mesh.points.clone();
        let original_indices = mesh.indices.clone();

        let plane = Vec3::new(0.6, 0.0, 0.8).normalize();
        mesh.apply_mirror(plane, 0.25);
        assert_ne!(mesh.points, original_points);
        assert_ne!(mesh.indices, original_indices);

        mesh.apply_mirror(plane, 0.25);
        for (p, q) in mesh.points.iter().zip(&original_points) {
            assert!((*p - *q).length() < 1.0e-5);
        }
        assert_eq!(mesh.indices, original_indices);
    }

    #[test]
    fn test_generated_normals_flat_quad() {
        let mut mesh = quad();
        refine_with(&mut mesh, RefineFlags::TRIANGULATE | RefineFlags::GEN_NORMALS);

        assert_eq!(mesh.normals.len(), mesh.points.len());
        for n in &mesh.normals {
            assert!((*n - Vec3::Z).length() < 1.0e-5);
        }
        assert!(mesh.flags.contains(MeshDataFlags::HAS_NORMALS));
    }

    /// Two triangles sharing an edge, folded by `fold` radians around it.
    fn folded_pair(fold: f32) -> Mesh {
        let (s, c) = fold.sin_cos();
        Mesh {
            points: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.5, 1.0, 0.0),
                Vec3::new(0.5, -c, s),
            ],
            counts: vec![3, 3],
            indices: vec![0, 1, 2, 0, 3, 1],
            ..Mesh::default()
        }
    }

    #[test]
    fn test_smooth_angle_below_threshold_shares_vertices() {
        let mut mesh = folded_pair(0.2);
        mesh.refine_settings = RefineSettings {
            flags: RefineFlags::TRIANGULATE | RefineFlags::GEN_NORMALS_WITH_SMOOTH_ANGLE,
            smooth_angle: 0.5,
            ..RefineSettings::default()
        };
        mesh.refine();

        // Shared-edge vertices smooth across both faces and stay shared.
        assert_eq!(mesh.points.len(), 4);
        assert_eq!(mesh.normals.len(), 4);
    }

    #[test]
    fn test_smooth_angle_above_threshold_splits_vertices() {
        let mut mesh = folded_pair(1.4);
        mesh.refine_settings = RefineSettings {
            flags: RefineFlags::TRIANGULATE | RefineFlags::GEN_NORMALS_WITH_SMOOTH_ANGLE,
            smooth_angle: 0.5,
            ..RefineSettings::default()
        };
        mesh.refine();

        // The two shared-edge vertices split, one copy per face.
        assert_eq!(mesh.points.len(), 6);

        // And the copies carry distinct normals.
        let unique: std::collections::HashSet<[i32; 3]> = mesh
            .normals
            .iter()
            .map(|n| super::quantize3(*n, 1.0e4))
            .collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn test_tangent_generation() {
        let mut mesh = quad();
        refine_with(
            &mut mesh,
            RefineFlags::TRIANGULATE | RefineFlags::GEN_NORMALS | RefineFlags::GEN_TANGENTS,
        );

        assert_eq!(mesh.tangents.len(), mesh.points.len());
        for t in &mesh.tangents {
            // UV u runs along +X, so tangents do too.
            assert!((Vec3::new(t.x, t.y, t.z) - Vec3::X).length() < 1.0e-4);
            assert_eq!(t.w, 1.0);
        }
    }

    #[test]
    fn test_degenerate_uv_yields_zero_tangent() {
        let mut mesh = quad();
        mesh.uv = vec![Vec2::ZERO; 4];
        refine_with(
            &mut mesh,
            RefineFlags::TRIANGULATE | RefineFlags::GEN_NORMALS | RefineFlags::GEN_TANGENTS,
        );

        assert_eq!(mesh.tangents.len(), 4);
        assert!(mesh.tangents.iter().all(|t| *t == Vec4::ZERO));
    }

    #[test]
    fn test_bake_skin_deforms_and_drops_skin() {
        let mut mesh = quad();
        mesh.bones_per_vertex = 1;
        mesh.bone_weights = vec![1.0; 4];
        mesh.bone_indices = vec![0; 4];
        mesh.bones = vec!["/root/bone".to_string()];
        mesh.bindposes = vec![Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0))];
        refine_with(&mut mesh, RefineFlags::BAKE_SKIN);

        for p in &mesh.points {
            assert_eq!(p.z, 5.0);
        }
        assert!(!mesh.has_skin());
        assert!(mesh.bindposes.is_empty());
        assert!(mesh.weights4.is_empty());
        assert!(!mesh.flags.contains(MeshDataFlags::HAS_BONES));
    }

    #[test]
    fn test_weights4_top_four_renormalized() {
        let mut mesh = quad();
        mesh.bones_per_vertex = 5;
        // Every vertex: five equal weights of 0.2; top four survive at 0.25.
        mesh.bone_weights = vec![0.2; 20];
        mesh.bone_indices = (0..20u32).map(|i| i % 5).collect();
        mesh.bones = (0..5).map(|i| format!("/root/b{i}")).collect();
        mesh.bindposes = vec![Mat4::IDENTITY; 5];
        refine_with(&mut mesh, RefineFlags::TRIANGULATE);

        assert_eq!(mesh.weights4.len(), 4);
        for w4 in &mesh.weights4 {
            let total: f32 = w4.weights.iter().sum();
            assert!((total - 1.0).abs() < 1.0e-5);
            assert!(w4.weights.iter().all(|&w| (w - 0.25).abs() < 1.0e-5));
        }
    }

    #[test]
    fn test_swap_handedness_and_faces() {
        let mut mesh = quad();
        refine_with(
            &mut mesh,
            RefineFlags::TRIANGULATE | RefineFlags::SWAP_HANDEDNESS | RefineFlags::SWAP_FACES,
        );

        assert_eq!(mesh.points[1], Vec3::new(-1.0, 0.0, 0.0));
        // Winding reversed before triangulation: the quad face was [3,2,1,0].
        assert_eq!(mesh.indices, vec![3, 2, 1, 3, 1, 0]);
    }

    #[test]
    fn test_scale_factor() {
        let mut mesh = quad();
        mesh.refine_settings.scale_factor = 0.01;
        mesh.refine();
        assert_eq!(mesh.points[2], Vec3::new(0.01, 0.01, 0.0));
    }

    #[test]
    fn test_optimize_topology_welds_duplicates() {
        // Two triangles sharing an edge, authored as unindexed-style
        // duplicates of the shared vertices.
        let mut mesh = Mesh {
            points: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            counts: vec![3, 3],
            indices: vec![0, 1, 2, 3, 4, 5],
            ..Mesh::default()
        };
        refine_with(
            &mut mesh,
            RefineFlags::TRIANGULATE | RefineFlags::OPTIMIZE_TOPOLOGY,
        );

        assert_eq!(mesh.points.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert!(mesh.indices.iter().all(|&i| (i as usize) < 4));
    }

    #[test]
    fn test_split_budget_and_preservation() {
        // A strip of 32 quads -> 64 triangles over 66 shared vertices.
        let n = 32usize;
        let mut points = Vec::new();
        for i in 0..=n {
            points.push(Vec3::new(i as f32, 0.0, 0.0));
            points.push(Vec3::new(i as f32, 1.0, 0.0));
        }
        let mut indices = Vec::new();
        for i in 0..n as u32 {
            let base = i * 2;
            indices.extend_from_slice(&[base, base + 2, base + 3, base + 1]);
        }
        let mut mesh = Mesh {
            points,
            counts: vec![4; n],
            indices,
            ..Mesh::default()
        };
        let original: std::collections::HashSet<[[i32; 3]; 3]> = {
            let mut probe = mesh.clone();
            refine_with(&mut probe, RefineFlags::TRIANGULATE);
            triangle_set(&probe.points, &probe.indices)
        };

        mesh.refine_settings = RefineSettings {
            flags: RefineFlags::TRIANGULATE | RefineFlags::SPLIT,
            split_unit: 16,
            ..RefineSettings::default()
        };
        mesh.refine();

        assert!(mesh.splits.len() > 1);
        let mut recovered = std::collections::HashSet::new();
        let mut total_triangles = 0usize;
        for split in &mesh.splits {
            assert!(split.vertex_count() <= 16);
            assert!(split.indices.iter().all(|&i| (i as usize) < split.vertex_count()));
            total_triangles += split.triangle_count();
            recovered.extend(triangle_set(&split.points, &split.indices));
        }
        // Exact triangle-set preservation: no loss, no duplication.
        assert_eq!(total_triangles, 64);
        assert_eq!(recovered, original);
    }

    fn triangle_set(
        points: &[Vec3],
        indices: &[u32],
    ) -> std::collections::HashSet<[[i32; 3]; 3]> {
        indices
            .chunks_exact(3)
            .map(|tri| {
                [
                    super::quantize3(points[tri[0] as usize], 1.0e4),
                    super::quantize3(points[tri[1] as usize], 1.0e4),
                    super::quantize3(points[tri[2] as usize], 1.0e4),
                ]
            })
            .collect()
    }

    #[test]
    fn test_material_grouping_spans_submeshes() {
        // Interleaved materials get grouped into two contiguous submeshes.
        let mut mesh = Mesh {
            points: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
            ],
            counts: vec![3, 3, 3, 3],
            indices: vec![0, 1, 2, 1, 3, 2, 0, 1, 3, 0, 3, 2],
            material_ids: vec![1, 0, 1, 0],
            ..Mesh::default()
        };
        refine_with(&mut mesh, RefineFlags::TRIANGULATE);

        assert_eq!(mesh.submeshes.len(), 2);
        assert_eq!(mesh.submeshes[0].material_id, 0);
        assert_eq!(mesh.submeshes[0].index_offset, 0);
        assert_eq!(mesh.submeshes[0].index_count, 6);
        assert_eq!(mesh.submeshes[1].material_id, 1);
        assert_eq!(mesh.submeshes[1].index_offset, 6);
        assert_eq!(mesh.submeshes[1].index_count, 6);

        // The single split carries the same grouping.
        assert_eq!(mesh.splits.len(), 1);
        assert_eq!(mesh.splits[0].submeshes.len(), 2);
    }

    #[test]
    fn test_no_flags_leaves_authoring_buffers_untouched() {
        // Already-triangulated mesh with interleaved materials. With nothing
        // enabled there is no destructive stage, so the authored buffers must
        // come out exactly as they went in; only derived outputs are built.
        let mut mesh = Mesh {
            points: vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
            ],
            counts: vec![3, 3],
            indices: vec![0, 1, 2, 1, 3, 2],
            material_ids: vec![1, 0],
            ..Mesh::default()
        };
        refine_with(&mut mesh, RefineFlags::empty());

        assert_eq!(mesh.indices, vec![0, 1, 2, 1, 3, 2]);
        assert_eq!(mesh.counts, vec![3, 3]);
        assert_eq!(mesh.material_ids, vec![1, 0]);
        // Submeshes follow the authored face order, one run per material.
        assert_eq!(mesh.submeshes.len(), 2);
        assert_eq!(mesh.submeshes[0].material_id, 1);
        assert_eq!(mesh.submeshes[1].material_id, 0);
    }

    #[test]
    fn test_undersized_skin_buffers_are_ignored() {
        // A decoded mesh can carry skin buffers shorter than
        // vertices x bones_per_vertex; the pipeline must treat it as
        // unskinned instead of slicing past the end.
        let mut mesh = Mesh {
            points: vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            counts: vec![3],
            indices: vec![0, 1, 2],
            bones_per_vertex: 2,
            bone_weights: vec![1.0],
            bone_indices: vec![0],
            bones: vec!["/root/bone".to_string()],
            bindposes: vec![Mat4::IDENTITY],
            ..Mesh::default()
        };
        mesh.refine_settings = RefineSettings {
            flags: RefineFlags::TRIANGULATE
                | RefineFlags::OPTIMIZE_TOPOLOGY
                | RefineFlags::GEN_NORMALS_WITH_SMOOTH_ANGLE,
            smooth_angle: 0.5,
            ..RefineSettings::default()
        };
        mesh.refine();

        assert_eq!(mesh.points.len(), 3);
        assert_eq!(mesh.normals.len(), 3);
        assert_eq!(mesh.indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_invert_v() {
        let mut mesh = quad();
        refine_with(&mut mesh, RefineFlags::INVERT_V);
        assert_eq!(mesh.uv[2], Vec2::new(1.0, 0.0));
    }

    #[test]
    fn test_local2world_wins_over_world2local() {
        let mut mesh = quad();
        mesh.refine_settings = RefineSettings {
            flags: RefineFlags::APPLY_LOCAL2WORLD | RefineFlags::APPLY_WORLD2LOCAL,
            local2world: Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)),
            world2local: Mat4::from_translation(Vec3::new(-99.0, 0.0, 0.0)),
            ..RefineSettings::default()
        };
        mesh.refine();
        assert_eq!(mesh.points[0], Vec3::new(10.0, 0.0, 0.0));
    }

    #[test]
    fn test_normals_transform_by_inverse_transpose() {
        let mut mesh = quad();
        mesh.normals = vec![Vec3::Z; 4];
        // Non-uniform scale: a raw-matrix transform would tilt the normal.
        mesh.apply_transform(&Mat4::from_scale(Vec3::new(2.0, 1.0, 0.5)));
        for n in &mesh.normals {
            assert!((*n - Vec3::Z).length() < 1.0e-6);
        }
    }
}
