//! Scene-graph data model and binary wire protocol for syncing 3D scene
//! content between a content-authoring tool and a receiving runtime
//!
//! The crate covers three things: a fixed-layout binary codec for scene
//! entities (transforms, cameras, meshes with skinning data), a mesh
//! refinement pipeline that normalizes arbitrary authoring geometry into
//! render-ready triangle chunks bounded by a vertex budget, and the framed
//! message protocol the two sides exchange. The transport carrying the bytes
//! and the dispatcher routing messages to handlers are external
//! collaborators.

pub mod codec;
pub mod entity;
pub mod mesh;
pub mod message;
pub mod refine;
pub mod scene;
pub mod signal;

// Re-export commonly used types
pub use codec::Wire;
pub use entity::{Camera, Entity, Transform, Trs};
pub use mesh::{
    Mesh, MeshDataFlags, RefineFlags, RefineSettings, Split, Submesh, Weights4,
};
pub use message::{
    DeleteMessage, GetFlags, GetMessage, Identifier, Message, MessageType, Protocol,
    ProtocolError, ScreenshotMessage, SetMessage, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use scene::Scene;
pub use signal::CompletionSignal;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
