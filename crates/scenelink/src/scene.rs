//! Scene aggregate: one sync snapshot
//!
//! Three ordered collections serialized as length-prefixed element sequences.
//! This layer performs no cross-collection validation and enforces no
//! uniqueness — the same path or id may legally appear more than once in a
//! snapshot; resolving that is the receiver's job.

use crate::codec::Wire;
use crate::entity::{Camera, Transform};
use crate::mesh::Mesh;
use std::io::{self, Read, Write};

/// A single synchronization snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scene {
    pub meshes: Vec<Mesh>,
    pub transforms: Vec<Transform>,
    pub cameras: Vec<Camera>,
}

impl Scene {
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty() && self.transforms.is_empty() && self.cameras.is_empty()
    }

    /// Total node count across all collections.
    pub fn node_count(&self) -> usize {
        self.meshes.len() + self.transforms.len() + self.cameras.len()
    }
}

impl Wire for Scene {
    fn size(&self) -> u32 {
        self.meshes.size() + self.transforms.size() + self.cameras.size()
    }

    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.meshes.encode(w)?;
        self.transforms.encode(w)?;
        self.cameras.encode(w)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            meshes: Vec::decode(r)?,
            transforms: Vec::decode(r)?,
            cameras: Vec::decode(r)?,
        })
    }
}
