// src/lib.rs
//! Tenview
//!
//! Interactive 3D visualization of tensor data, built on wgpu and winit.
//! Tensors become vertex buffers, textures and uniforms of name-addressed
//! draw programs; scenes render off-screen into framebuffers or into a
//! windowed viewer.

pub mod buffer;
pub mod camera;
pub mod context;
pub mod error;
pub mod framebuffer;
pub mod geometry;
pub mod io;
pub mod nodes;
pub mod program;
pub mod projection;
pub mod scene;
pub mod tensor;
pub mod texture;
pub mod viewer;

// Re-export main types for convenience
pub use buffer::{Buffer, BufferRef, BufferTarget, BufferUsage};
pub use camera::{min_bounding_distance, sphere_view, CameraManipulator};
pub use context::{Context, DEFAULT_CLEAR_COLOR};
pub use error::{Error, Result};
pub use framebuffer::{AttachmentFormat, Framebuffer};
pub use geometry::{Bounds, Geometry};
pub use io::{read_3dobject, write_3dobject};
pub use program::{
    DrawMode, DrawProgram, MatPlaceholder, NodeRef, PolygonMode, ProgramInput, ShaderProgram,
    ShaderRef, Style, UniformValue,
};
pub use projection::{Projection, SensorFit};
pub use scene::{Scene, SceneNode, SceneRef};
pub use tensor::{DType, Device, Tensor};
pub use texture::{TexTarget, Texture, TextureRef};
pub use viewer::Viewer;
