//! Per-node rasterizer style.

/// How triangle faces are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonMode {
    Fill,
    /// Requires the adapter to support line fill mode; falls back to
    /// `Fill` with a warning otherwise.
    Wireframe,
}

/// Rasterizer state attached to a draw program.
///
/// `point_size` and `line_width` are kept for API compatibility with
/// fixed-function pipelines; wgpu rasterizes 1px points and lines, so
/// shaders that want fat points must scale geometry themselves.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    pub point_size: f32,
    pub line_width: f32,
    pub polygon_mode: PolygonMode,
    /// Depth bias `(constant, slope_scale)` applied to polygon fills,
    /// the depth-fighting workaround for coplanar overlays.
    pub polygon_offset: Option<(i32, f32)>,
}

impl Default for Style {
    fn default() -> Self {
        Style {
            point_size: 1.0,
            line_width: 1.0,
            polygon_mode: PolygonMode::Fill,
            polygon_offset: None,
        }
    }
}

impl Style {
    pub(crate) fn depth_bias(&self) -> wgpu::DepthBiasState {
        match self.polygon_offset {
            Some((constant, slope_scale)) => wgpu::DepthBiasState {
                constant,
                slope_scale,
                clamp: 0.0,
            },
            None => wgpu::DepthBiasState::default(),
        }
    }
}
