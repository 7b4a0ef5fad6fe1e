//! Shader programs and draw nodes.

mod draw;
mod reflect;
mod shader;
mod style;

pub use draw::{DrawMode, DrawProgram, MatPlaceholder, NodeRef, ProgramInput, UniformValue};
pub use shader::{ShaderProgram, ShaderRef};
pub use style::{PolygonMode, Style};

pub(crate) use draw::RenderTargets;
