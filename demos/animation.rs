//! Animated point cloud: a worker thread streams new positions over a
//! channel while the viewer thread re-uploads the vertex buffer.

use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use tenview::{
    Buffer, CameraManipulator, Context, DrawMode, DrawProgram, MatPlaceholder, Scene,
    ShaderProgram, Tensor,
};

const GRID: usize = 64;

const WAVE_WGSL: &str = r#"
@group(0) @binding(0) var<uniform> ProjModelview: mat4x4<f32>;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) height: f32,
};

@vertex
fn vs_main(@location(0) in_position: vec3<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = ProjModelview * vec4<f32>(in_position, 1.0);
    out.height = in_position.y;
    return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let t = clamp(input.height * 2.0 + 0.5, 0.0, 1.0);
    return vec4<f32>(t, 0.3, 1.0 - t, 1.0);
}
"#;

fn wave_frame(time: f32) -> Vec<f32> {
    let mut verts = Vec::with_capacity(GRID * GRID * 3);
    for i in 0..GRID {
        for j in 0..GRID {
            let x = i as f32 / (GRID - 1) as f32 * 2.0 - 1.0;
            let z = j as f32 / (GRID - 1) as f32 * 2.0 - 1.0;
            let y = 0.25 * ((x * 6.0 + time).sin() + (z * 6.0 + time * 1.3).cos());
            verts.extend_from_slice(&[x, y, z]);
        }
    }
    verts
}

fn main() -> Result<()> {
    env_logger::init();

    let (tx, rx) = mpsc::channel::<Vec<f32>>();
    let producer = std::thread::spawn(move || {
        let mut time = 0.0f32;
        while tx.send(wave_frame(time)).is_ok() {
            time += 0.05;
            std::thread::sleep(Duration::from_millis(16));
        }
    });

    let ctx = Context::new(1024, 768)?;
    let positions;
    let mut scene = Scene::new();
    {
        let _guard = ctx.current()?;
        let initial = Tensor::from_vec(wave_frame(0.0), &[GRID * GRID, 3])?;
        positions = Buffer::from_tensor(&ctx, &initial)?;

        let program = ShaderProgram::from_source(&ctx, WAVE_WGSL)?;
        let node = DrawProgram::new(&ctx, program, DrawMode::Points)?;
        {
            let mut draw = node.borrow_mut();
            draw.set("in_position", positions.clone())?;
            draw.set("ProjModelview", MatPlaceholder::ProjectionModelview)?;
            draw.set_bounds(&initial)?;
        }
        scene.add(node);
    }

    let mut viewer = ctx.viewer(scene, CameraManipulator::TrackBall)?;
    loop {
        if let Some(frame) = rx.try_iter().last() {
            let tensor = Tensor::from_vec(frame, &[GRID * GRID, 3])?;
            let _guard = ctx.current()?;
            positions.borrow_mut().upload(&tensor)?;
        }
        if viewer.wait_key(16)? < 0 {
            break;
        }
    }
    viewer.release();
    drop(rx);
    let _ = producer.join();
    Ok(())
}
