//! Simple exchange example for scenelink
//!
//! Plays both sides of a Get/Set exchange over in-memory buffers: the
//! requester asks for triangulated points and indices, the responder refines
//! an authored quad and replies with a scene snapshot.

use glam::{Vec2, Vec3};
use scenelink::{
    GetFlags, GetMessage, Mesh, MeshDataFlags, Message, Protocol, RefineFlags, RefineSettings,
    Scene, SetMessage,
};
use std::io::Cursor;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let protocol = Protocol::default();

    // Requester: ask for triangulated points and indices.
    let mut get = GetMessage::default();
    get.flags = GetFlags::GET_POINTS | GetFlags::GET_INDICES;
    get.refine_settings = RefineSettings {
        flags: RefineFlags::TRIANGULATE | RefineFlags::GEN_NORMALS,
        ..RefineSettings::default()
    };
    let mut request = Vec::new();
    protocol.write_message(&mut request, &Message::Get(get))?;
    println!("Sent Get request ({} bytes)", request.len());

    // Responder: read the request, refine the authored mesh, reply.
    let Message::Get(get) = protocol.read_message(&mut Cursor::new(request))? else {
        unreachable!()
    };

    let mut mesh = Mesh {
        flags: MeshDataFlags::VISIBLE,
        refine_settings: get.refine_settings,
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
    };
    mesh.transform.entity.path = "/root/quad".to_string();
    mesh.refine();

    let mut reply = Vec::new();
    protocol.write_message(
        &mut reply,
        &Message::Set(SetMessage {
            scene: Scene {
                meshes: vec![mesh],
                ..Scene::default()
            },
        }),
    )?;
    println!("Sent Set reply ({} bytes)", reply.len());

    // Requester: consume the snapshot.
    let Message::Set(set) = protocol.read_message(&mut Cursor::new(reply))? else {
        unreachable!()
    };
    let mesh = &set.scene.meshes[0];
    println!(
        "Received {} with {} triangles in {} split(s)",
        mesh.path(),
        mesh.indices.len() / 3,
        mesh.splits.len()
    );

    Ok(())
}
