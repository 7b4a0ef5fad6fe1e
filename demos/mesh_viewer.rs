//! Opens a mesh file (.off/.obj/.ply/.stl) in an interactive viewer.

use anyhow::{Context as _, Result};
use tenview::{nodes, read_3dobject, CameraManipulator, Context, Scene};

fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .context("usage: mesh_viewer <mesh file>")?;
    let geometry = read_3dobject(&path)?;
    println!(
        "{path}: {} vertices, {} faces",
        geometry.verts.len(),
        geometry.faces.len()
    );

    let ctx = Context::new(1024, 768)?;
    let mut scene = Scene::new();
    {
        let _guard = ctx.current()?;
        scene.add(nodes::create_mesh_from_geo(&ctx, &geometry)?);
    }

    ctx.show(scene, CameraManipulator::TrackBall)?;
    Ok(())
}
