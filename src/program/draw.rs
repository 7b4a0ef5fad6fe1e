//! Draw programs: shader + name-keyed inputs + draw state.
//!
//! A [`DrawProgram`] is a renderable scene node. Inputs are assigned by
//! shader variable name and dispatched on their kind: vertex buffers to
//! attributes, textures to texture bindings, matrices/scalars to uniforms,
//! and [`MatPlaceholder`] markers to uniforms that are resolved from the
//! camera state on every draw.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use cgmath::{Matrix, Matrix3, Matrix4, SquareMatrix, Vector3};

use crate::buffer::BufferRef;
use crate::context::{Context, GpuState};
use crate::error::{Error, Result};
use crate::geometry::Bounds;
use crate::program::reflect::UniformType;
use crate::program::shader::ShaderRef;
use crate::program::style::{PolygonMode, Style};
use crate::tensor::{DType, Tensor};
use crate::texture::{SampleKind, TextureRef};

/// Shared handle to a draw program, as stored in scenes.
pub type NodeRef = Rc<std::cell::RefCell<DrawProgram>>;

/// Primitive interpretation of the vertex stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Points,
    Lines,
    Triangles,
    /// Expanded to triangle pairs at index upload; modern pipelines have
    /// no quad primitive.
    Quads,
}

impl DrawMode {
    fn face_width(self) -> usize {
        match self {
            DrawMode::Points => 1,
            DrawMode::Lines => 2,
            DrawMode::Triangles => 3,
            DrawMode::Quads => 4,
        }
    }

    fn topology(self) -> wgpu::PrimitiveTopology {
        match self {
            DrawMode::Points => wgpu::PrimitiveTopology::PointList,
            DrawMode::Lines => wgpu::PrimitiveTopology::LineList,
            DrawMode::Triangles | DrawMode::Quads => wgpu::PrimitiveTopology::TriangleList,
        }
    }
}

/// Camera-derived matrices resolved per draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatPlaceholder {
    Modelview,
    Projection,
    ProjectionModelview,
    /// Inverse-transpose of the modelview rotation, for normals.
    NormalModelview,
}

/// A concrete uniform value.
#[derive(Debug, Clone, Copy)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    UInt(u32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat3(Matrix3<f32>),
    Mat4(Matrix4<f32>),
}

impl UniformValue {
    fn ty(&self) -> UniformType {
        match self {
            UniformValue::Float(_) => UniformType::F32,
            UniformValue::Int(_) => UniformType::I32,
            UniformValue::UInt(_) => UniformType::U32,
            UniformValue::Vec2(_) => UniformType::Vec2,
            UniformValue::Vec3(_) => UniformType::Vec3,
            UniformValue::Vec4(_) => UniformType::Vec4,
            UniformValue::Mat3(_) => UniformType::Mat3,
            UniformValue::Mat4(_) => UniformType::Mat4,
        }
    }

    /// Std140-style bytes; mat3x3 columns are padded to vec4.
    fn bytes(&self) -> Vec<u8> {
        match self {
            UniformValue::Float(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Int(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::UInt(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec2(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec3(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec4(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Mat3(m) => {
                let cols: [[f32; 4]; 3] = [
                    [m.x.x, m.x.y, m.x.z, 0.0],
                    [m.y.x, m.y.y, m.y.z, 0.0],
                    [m.z.x, m.z.y, m.z.z, 0.0],
                ];
                bytemuck::cast_slice(&cols).to_vec()
            }
            UniformValue::Mat4(m) => {
                let cols: [[f32; 4]; 4] = (*m).into();
                bytemuck::cast_slice(&cols).to_vec()
            }
        }
    }

    /// Infers a uniform value from a small host/GPU tensor, following
    /// element count: 1 scalar, 2..=4 vector, 9 mat3 (row-major input),
    /// 16 mat4 (row-major input).
    pub fn from_tensor(tensor: &Tensor) -> Result<UniformValue> {
        if tensor.dtype() == DType::Int32 && tensor.numel() == 1 {
            return Ok(UniformValue::Int(tensor.to_f32_components()?[0] as i32));
        }
        let v = tensor.to_f32_components()?;
        match v.len() {
            1 => Ok(UniformValue::Float(v[0])),
            2 => Ok(UniformValue::Vec2([v[0], v[1]])),
            3 => Ok(UniformValue::Vec3([v[0], v[1], v[2]])),
            4 => Ok(UniformValue::Vec4([v[0], v[1], v[2], v[3]])),
            9 => Ok(UniformValue::Mat3(
                Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]).transpose(),
            )),
            16 => {
                let m = Matrix4::new(
                    v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8], v[9], v[10], v[11],
                    v[12], v[13], v[14], v[15],
                );
                Ok(UniformValue::Mat4(m.transpose()))
            }
            n => Err(Error::Shape(format!(
                "cannot infer a uniform from a tensor of {n} elements"
            ))),
        }
    }
}

/// Tagged input accepted by [`DrawProgram::set`].
pub enum ProgramInput {
    Buffer(BufferRef),
    Texture(TextureRef),
    Placeholder(MatPlaceholder),
    Uniform(UniformValue),
}

impl From<BufferRef> for ProgramInput {
    fn from(v: BufferRef) -> Self {
        ProgramInput::Buffer(v)
    }
}
impl From<TextureRef> for ProgramInput {
    fn from(v: TextureRef) -> Self {
        ProgramInput::Texture(v)
    }
}
impl From<MatPlaceholder> for ProgramInput {
    fn from(v: MatPlaceholder) -> Self {
        ProgramInput::Placeholder(v)
    }
}
impl From<UniformValue> for ProgramInput {
    fn from(v: UniformValue) -> Self {
        ProgramInput::Uniform(v)
    }
}
impl From<f32> for ProgramInput {
    fn from(v: f32) -> Self {
        ProgramInput::Uniform(UniformValue::Float(v))
    }
}
impl From<i32> for ProgramInput {
    fn from(v: i32) -> Self {
        ProgramInput::Uniform(UniformValue::Int(v))
    }
}
impl From<u32> for ProgramInput {
    fn from(v: u32) -> Self {
        ProgramInput::Uniform(UniformValue::UInt(v))
    }
}
impl From<[f32; 2]> for ProgramInput {
    fn from(v: [f32; 2]) -> Self {
        ProgramInput::Uniform(UniformValue::Vec2(v))
    }
}
impl From<[f32; 3]> for ProgramInput {
    fn from(v: [f32; 3]) -> Self {
        ProgramInput::Uniform(UniformValue::Vec3(v))
    }
}
impl From<[f32; 4]> for ProgramInput {
    fn from(v: [f32; 4]) -> Self {
        ProgramInput::Uniform(UniformValue::Vec4(v))
    }
}
impl From<Vector3<f32>> for ProgramInput {
    fn from(v: Vector3<f32>) -> Self {
        ProgramInput::Uniform(UniformValue::Vec3(v.into()))
    }
}
impl From<Matrix3<f32>> for ProgramInput {
    fn from(v: Matrix3<f32>) -> Self {
        ProgramInput::Uniform(UniformValue::Mat3(v))
    }
}
impl From<Matrix4<f32>> for ProgramInput {
    fn from(v: Matrix4<f32>) -> Self {
        ProgramInput::Uniform(UniformValue::Mat4(v))
    }
}

/// Render target signature handed down from the render dispatch.
pub(crate) struct RenderTargets<'a> {
    pub color_formats: &'a [Option<wgpu::TextureFormat>],
    pub depth_format: Option<wgpu::TextureFormat>,
}

struct IndexData {
    raw: wgpu::Buffer,
    count: u32,
}

#[derive(Clone, PartialEq)]
struct PipelineKey {
    generation: u64,
    color_formats: Vec<Option<wgpu::TextureFormat>>,
    depth_format: Option<wgpu::TextureFormat>,
    polygon_mode: wgpu::PolygonMode,
    depth_bias_constant: i32,
    depth_bias_slope: f32,
    vertex_layout: Vec<(u32, wgpu::VertexFormat, u64)>,
}

struct PipelineState {
    key: PipelineKey,
    pipeline: wgpu::RenderPipeline,
    bind_group_layouts: Vec<(u32, wgpu::BindGroupLayout)>,
}

/// A renderable node binding tensor-backed GPU data to a shader.
pub struct DrawProgram {
    gpu: Arc<GpuState>,
    program: ShaderRef,
    mode: DrawMode,
    ignore_missing: bool,

    attributes: BTreeMap<String, BufferRef>,
    uniforms: BTreeMap<String, UniformValue>,
    placeholders: BTreeMap<String, MatPlaceholder>,
    textures: BTreeMap<String, TextureRef>,
    indices: Option<IndexData>,

    /// Model-to-world matrix applied before the view matrix.
    pub transform: Matrix4<f32>,
    pub style: Style,
    /// Visibility toggle; hidden nodes are skipped by the render pass.
    pub visible: bool,

    bounds: Option<Bounds>,
    max_draw_elements: Option<u32>,

    pipeline: Option<PipelineState>,
    uniform_buffers: BTreeMap<String, wgpu::Buffer>,
    bind_groups: Option<Vec<(u32, wgpu::BindGroup)>>,
    bind_dirty: bool,
    dummy_vertex: Option<wgpu::Buffer>,

    draw_count: u64,
    last_draw_seq: u64,
}

impl DrawProgram {
    /// Creates a node from a compiled shader program. Assigning a name
    /// the shader does not declare is an error.
    pub fn new(ctx: &Context, program: ShaderRef, mode: DrawMode) -> Result<NodeRef> {
        DrawProgram::with_options(ctx, program, mode, false)
    }

    /// As [`DrawProgram::new`], with `ignore_missing` turning unknown
    /// input names into logged no-ops.
    pub fn with_options(
        ctx: &Context,
        program: ShaderRef,
        mode: DrawMode,
        ignore_missing: bool,
    ) -> Result<NodeRef> {
        let gpu = ctx.gpu();
        gpu.ensure_current()?;
        Ok(Rc::new(std::cell::RefCell::new(DrawProgram {
            gpu,
            program,
            mode,
            ignore_missing,
            attributes: BTreeMap::new(),
            uniforms: BTreeMap::new(),
            placeholders: BTreeMap::new(),
            textures: BTreeMap::new(),
            indices: None,
            transform: Matrix4::identity(),
            style: Style::default(),
            visible: true,
            bounds: None,
            max_draw_elements: None,
            pipeline: None,
            uniform_buffers: BTreeMap::new(),
            bind_groups: None,
            bind_dirty: false,
            dummy_vertex: None,
            draw_count: 0,
            last_draw_seq: 0,
        })))
    }

    pub fn mode(&self) -> DrawMode {
        self.mode
    }

    /// Assigns a shader input by name, dispatching on the value kind.
    pub fn set(&mut self, name: &str, value: impl Into<ProgramInput>) -> Result<()> {
        let known = self.program.borrow().reflection().has_input(name);
        if !known {
            if self.ignore_missing {
                log::debug!("ignoring unknown program input `{name}`");
                return Ok(());
            }
            return Err(Error::UnknownProgramInput(name.to_string()));
        }

        match value.into() {
            ProgramInput::Buffer(buffer) => {
                if self.program.borrow().reflection().attribute(name).is_none() {
                    return self.reject(name);
                }
                self.attributes.insert(name.to_string(), buffer);
                self.pipeline = None;
            }
            ProgramInput::Texture(texture) => {
                if self.program.borrow().reflection().texture(name).is_none() {
                    return self.reject(name);
                }
                self.textures.insert(name.to_string(), texture);
                self.bind_dirty = true;
            }
            ProgramInput::Placeholder(placeholder) => {
                if self.program.borrow().reflection().uniform(name).is_none() {
                    return self.reject(name);
                }
                self.placeholders.insert(name.to_string(), placeholder);
                self.uniforms.remove(name);
            }
            ProgramInput::Uniform(value) => {
                let decl_ty = self
                    .program
                    .borrow()
                    .reflection()
                    .uniform(name)
                    .map(|u| u.ty);
                let Some(decl_ty) = decl_ty else {
                    return self.reject(name);
                };
                if !types_compatible(decl_ty, value.ty()) {
                    return Err(Error::Shape(format!(
                        "uniform `{name}` expects {decl_ty:?}, got {:?}",
                        value.ty()
                    )));
                }
                self.uniforms.insert(name.to_string(), value);
                self.placeholders.remove(name);
            }
        }
        Ok(())
    }

    fn reject(&self, name: &str) -> Result<()> {
        if self.ignore_missing {
            log::debug!("input `{name}` exists but with a different kind; ignoring");
            Ok(())
        } else {
            Err(Error::UnknownProgramInput(name.to_string()))
        }
    }

    /// Assigns a uniform inferred from a tensor's element count.
    pub fn set_tensor(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        self.set(name, UniformValue::from_tensor(tensor)?)
    }

    /// Uploads face indices. The face width must match the draw mode;
    /// quads become two triangles each.
    pub fn set_indices(&mut self, faces: &Tensor) -> Result<()> {
        self.gpu.ensure_current()?;
        let width = self.mode.face_width();
        let flat: Vec<usize> = match faces.rank() {
            1 => faces.index_values()?,
            2 => {
                if faces.cols() != width {
                    return Err(Error::Shape(format!(
                        "{:?} faces must have {} indices per row, got {}",
                        self.mode,
                        width,
                        faces.cols()
                    )));
                }
                let flattened = Tensor::from_bytes(
                    faces.dtype(),
                    &[faces.numel()],
                    faces.host_bytes()?,
                );
                flattened.index_values()?
            }
            _ => {
                return Err(Error::Shape(format!(
                    "face tensor must be rank 1 or 2, got shape {:?}",
                    faces.shape()
                )))
            }
        };
        if flat.len() % width != 0 {
            return Err(Error::Shape(format!(
                "face index count {} is not a multiple of {width}",
                flat.len()
            )));
        }

        let mut indices: Vec<u32> = Vec::with_capacity(flat.len());
        if self.mode == DrawMode::Quads {
            for quad in flat.chunks_exact(4) {
                let [a, b, c, d] = [quad[0], quad[1], quad[2], quad[3]];
                indices.extend([a as u32, b as u32, c as u32, c as u32, d as u32, a as u32]);
            }
        } else {
            indices.extend(flat.iter().map(|&v| v as u32));
        }

        let raw = self
            .gpu
            .upload_bytes(bytemuck::cast_slice(&indices), wgpu::BufferUsages::INDEX);
        self.indices = Some(IndexData {
            raw,
            count: indices.len() as u32,
        });
        Ok(())
    }

    pub fn clear_indices(&mut self) {
        self.indices = None;
    }

    /// Sets the axis-aligned bounds from a `[N, 3]` float tensor, used
    /// by viewers to frame the scene.
    pub fn set_bounds(&mut self, points: &Tensor) -> Result<()> {
        self.bounds = Bounds::from_tensor(points)?;
        Ok(())
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Clamps the number of elements drawn; `None` draws everything.
    pub fn set_max_draw_elements(&mut self, max: Option<u32>) {
        self.max_draw_elements = max;
    }

    /// Number of times this node has been drawn.
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    /// Position of the node's latest draw within its render pass,
    /// starting at 1.
    pub fn last_draw_seq(&self) -> u64 {
        self.last_draw_seq
    }

    fn resolve_placeholder(
        &self,
        placeholder: MatPlaceholder,
        projection: &Matrix4<f32>,
        modelview: &Matrix4<f32>,
    ) -> UniformValue {
        match placeholder {
            MatPlaceholder::Modelview => UniformValue::Mat4(*modelview),
            MatPlaceholder::Projection => UniformValue::Mat4(*projection),
            MatPlaceholder::ProjectionModelview => UniformValue::Mat4(projection * modelview),
            MatPlaceholder::NormalModelview => UniformValue::Mat3(normal_matrix(modelview)),
        }
    }

    fn effective_polygon_mode(&self) -> wgpu::PolygonMode {
        match self.style.polygon_mode {
            PolygonMode::Fill => wgpu::PolygonMode::Fill,
            PolygonMode::Wireframe => {
                if self.gpu.polygon_mode_line {
                    wgpu::PolygonMode::Line
                } else {
                    log::warn!("wireframe fill not supported by this adapter, drawing solid");
                    wgpu::PolygonMode::Fill
                }
            }
        }
    }

    /// Records this node into a render pass.
    pub(crate) fn encode(
        &mut self,
        pass: &mut wgpu::RenderPass<'_>,
        targets: &RenderTargets<'_>,
        projection: &Matrix4<f32>,
        view: &Matrix4<f32>,
        seq: &mut u64,
    ) -> Result<()> {
        if !self.visible {
            return Ok(());
        }
        self.gpu.ensure_current()?;

        if self.program.borrow_mut().reload_if_changed()? {
            self.pipeline = None;
            self.bind_groups = None;
        }
        let reflection = self.program.borrow().reflection().clone();

        // vertex layout and row-count consistency
        let mut vertex_layout = Vec::new();
        let mut vertex_rows: Option<usize> = None;
        for attr in &reflection.attributes {
            match self.attributes.get(&attr.name) {
                Some(buffer) => {
                    let buffer = buffer.borrow();
                    let format = buffer.vertex_format()?;
                    vertex_layout.push((attr.location, format, buffer.row_byte_len() as u64));
                    match vertex_rows {
                        None => vertex_rows = Some(buffer.rows()),
                        Some(rows) if rows != buffer.rows() => {
                            return Err(Error::Shape(format!(
                                "attribute `{}` has {} rows, other attributes have {rows}",
                                attr.name,
                                buffer.rows()
                            )))
                        }
                        Some(_) => {}
                    }
                }
                None => {
                    // unbound attribute reads zeros
                    vertex_layout.push((attr.location, wgpu::VertexFormat::Float32x4, 0));
                }
            }
        }

        let key = PipelineKey {
            generation: self.program.borrow().generation(),
            color_formats: targets.color_formats.to_vec(),
            depth_format: targets.depth_format,
            polygon_mode: self.effective_polygon_mode(),
            depth_bias_constant: self.style.depth_bias().constant,
            depth_bias_slope: self.style.depth_bias().slope_scale,
            vertex_layout: vertex_layout.clone(),
        };

        let rebuild = self
            .pipeline
            .as_ref()
            .map(|state| state.key != key)
            .unwrap_or(true);
        if rebuild {
            self.pipeline = Some(self.build_pipeline(&reflection, key)?);
            self.bind_groups = None;
        }

        if self.bind_groups.is_none() || self.bind_dirty {
            self.build_bind_groups(&reflection)?;
            self.bind_dirty = false;
        }

        // uniform uploads, placeholders last so they win
        let modelview = view * self.transform;
        for decl in &reflection.uniforms {
            let value = match self.placeholders.get(&decl.name) {
                Some(&placeholder) => {
                    Some(self.resolve_placeholder(placeholder, projection, &modelview))
                }
                None => self.uniforms.get(&decl.name).copied(),
            };
            if let (Some(value), Some(buffer)) = (value, self.uniform_buffers.get(&decl.name)) {
                self.gpu.write_bytes(buffer, &value.bytes());
            }
        }

        let state = self.pipeline.as_ref().expect("pipeline built above");
        pass.set_pipeline(&state.pipeline);
        for (group, bind_group) in self.bind_groups.as_ref().expect("bind groups built above") {
            pass.set_bind_group(*group, bind_group, &[]);
        }

        for (slot, attr) in reflection.attributes.iter().enumerate() {
            match self.attributes.get(&attr.name) {
                Some(buffer) => {
                    let buffer = buffer.borrow();
                    pass.set_vertex_buffer(slot as u32, buffer.raw_wgpu()?.slice(..));
                }
                None => {
                    let dummy = self.dummy_vertex.get_or_insert_with(|| {
                        self.gpu
                            .upload_bytes(&[0u8; 16], wgpu::BufferUsages::VERTEX)
                    });
                    pass.set_vertex_buffer(slot as u32, dummy.slice(..));
                }
            }
        }

        match &self.indices {
            Some(indices) => {
                let mut count = indices.count;
                if let Some(max) = self.max_draw_elements {
                    count = count.min(max);
                }
                pass.set_index_buffer(indices.raw.slice(..), wgpu::IndexFormat::Uint32);
                pass.draw_indexed(0..count, 0, 0..1);
            }
            None => {
                let mut count = vertex_rows.unwrap_or(0) as u32;
                if let Some(max) = self.max_draw_elements {
                    count = count.min(max);
                }
                pass.draw(0..count, 0..1);
            }
        }

        self.draw_count += 1;
        *seq += 1;
        self.last_draw_seq = *seq;
        Ok(())
    }

    fn build_pipeline(
        &self,
        reflection: &crate::program::reflect::Reflection,
        key: PipelineKey,
    ) -> Result<PipelineState> {
        let device = &self.gpu.device;

        // bind group layouts per group index
        let mut group_entries: BTreeMap<u32, Vec<wgpu::BindGroupLayoutEntry>> = BTreeMap::new();
        for decl in &reflection.uniforms {
            group_entries
                .entry(decl.group)
                .or_default()
                .push(wgpu::BindGroupLayoutEntry {
                    binding: decl.binding,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                });
        }
        let filterable = reflection.textures.iter().all(|decl| {
            match self.textures.get(&decl.name) {
                Some(texture) => matches!(
                    texture.borrow().sample_kind(),
                    SampleKind::Float { filterable: true }
                ),
                None => true,
            }
        });
        for decl in &reflection.textures {
            let sample_type = match self.textures.get(&decl.name) {
                Some(texture) => match texture.borrow().sample_kind() {
                    SampleKind::Float { filterable } => {
                        wgpu::TextureSampleType::Float { filterable }
                    }
                    SampleKind::Sint => wgpu::TextureSampleType::Sint,
                    SampleKind::Uint => wgpu::TextureSampleType::Uint,
                },
                None => wgpu::TextureSampleType::Float { filterable: true },
            };
            group_entries
                .entry(decl.group)
                .or_default()
                .push(wgpu::BindGroupLayoutEntry {
                    binding: decl.binding,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                });
        }
        for decl in &reflection.samplers {
            group_entries
                .entry(decl.group)
                .or_default()
                .push(wgpu::BindGroupLayoutEntry {
                    binding: decl.binding,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Sampler(if filterable {
                        wgpu::SamplerBindingType::Filtering
                    } else {
                        wgpu::SamplerBindingType::NonFiltering
                    }),
                    count: None,
                });
        }

        let bind_group_layouts: Vec<(u32, wgpu::BindGroupLayout)> = group_entries
            .into_iter()
            .map(|(group, entries)| {
                let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("tenview draw bind group layout"),
                    entries: &entries,
                });
                (group, layout)
            })
            .collect();

        let layout_refs: Vec<&wgpu::BindGroupLayout> =
            bind_group_layouts.iter().map(|(_, l)| l).collect();
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("tenview draw pipeline layout"),
            bind_group_layouts: &layout_refs,
            push_constant_ranges: &[],
        });

        let vertex_attrs: Vec<[wgpu::VertexAttribute; 1]> = key
            .vertex_layout
            .iter()
            .map(|&(location, format, _)| {
                [wgpu::VertexAttribute {
                    format,
                    offset: 0,
                    shader_location: location,
                }]
            })
            .collect();
        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = key
            .vertex_layout
            .iter()
            .zip(&vertex_attrs)
            .map(|(&(_, _, stride), attrs)| wgpu::VertexBufferLayout {
                array_stride: stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: attrs,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .map(|format| {
                format.map(|format| wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let program = self.program.borrow();
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("tenview draw pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: program.module(),
                entry_point: Some(&reflection.vertex_entry),
                buffers: &vertex_buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: program.module(),
                entry_point: Some(&reflection.fragment_entry),
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: self.mode.topology(),
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: key.polygon_mode,
                conservative: false,
            },
            depth_stencil: key.depth_format.map(|format| wgpu::DepthStencilState {
                format,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState {
                    constant: key.depth_bias_constant,
                    slope_scale: key.depth_bias_slope,
                    clamp: 0.0,
                },
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        drop(program);

        Ok(PipelineState {
            key,
            pipeline,
            bind_group_layouts,
        })
    }

    fn build_bind_groups(
        &mut self,
        reflection: &crate::program::reflect::Reflection,
    ) -> Result<()> {
        // one uniform buffer per declaration, zero-filled until assigned
        for decl in &reflection.uniforms {
            if !self.uniform_buffers.contains_key(&decl.name) {
                let size = crate::context::pad4(decl.ty.byte_size()).max(16);
                let buffer = self.gpu.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("tenview uniform"),
                    size: size as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                self.uniform_buffers.insert(decl.name.clone(), buffer);
            }
        }

        let mut texture_views: BTreeMap<String, wgpu::TextureView> = BTreeMap::new();
        for decl in &reflection.textures {
            if let Some(texture) = self.textures.get(&decl.name) {
                texture_views.insert(decl.name.clone(), texture.borrow().view()?);
            }
        }

        let state = self
            .pipeline
            .as_ref()
            .ok_or_else(|| Error::Gpu("bind groups built before pipeline".into()))?;

        let mut groups = Vec::new();
        for (group, layout) in &state.bind_group_layouts {
            let mut entries: Vec<wgpu::BindGroupEntry> = Vec::new();
            for decl in reflection.uniforms.iter().filter(|u| u.group == *group) {
                entries.push(wgpu::BindGroupEntry {
                    binding: decl.binding,
                    resource: self.uniform_buffers[&decl.name].as_entire_binding(),
                });
            }
            for decl in reflection.textures.iter().filter(|t| t.group == *group) {
                let view = texture_views
                    .get(&decl.name)
                    .unwrap_or(&self.gpu.fallback_texture_view);
                entries.push(wgpu::BindGroupEntry {
                    binding: decl.binding,
                    resource: wgpu::BindingResource::TextureView(view),
                });
            }
            for decl in reflection.samplers.iter().filter(|s| s.group == *group) {
                entries.push(wgpu::BindGroupEntry {
                    binding: decl.binding,
                    resource: wgpu::BindingResource::Sampler(&self.gpu.default_sampler),
                });
            }
            let bind_group = self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("tenview draw bind group"),
                layout,
                entries: &entries,
            });
            groups.push((*group, bind_group));
        }
        self.bind_groups = Some(groups);
        Ok(())
    }
}

fn types_compatible(declared: UniformType, provided: UniformType) -> bool {
    if declared == provided {
        return true;
    }
    matches!(
        (declared, provided),
        (UniformType::F32, UniformType::I32)
            | (UniformType::I32, UniformType::U32)
            | (UniformType::U32, UniformType::I32)
    )
}

fn normal_matrix(modelview: &Matrix4<f32>) -> Matrix3<f32> {
    let m = Matrix3::from_cols(
        modelview.x.truncate(),
        modelview.y.truncate(),
        modelview.z.truncate(),
    );
    m.invert()
        .map(|inv| inv.transpose())
        .unwrap_or_else(Matrix3::identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    const FLAT: &str = r#"
        @group(0) @binding(0) var<uniform> ProjModelview: mat4x4<f32>;
        @group(0) @binding(1) var<uniform> Color: vec3<f32>;
        @vertex
        fn vs_main(@location(0) in_position: vec3<f32>) -> @builtin(position) vec4<f32> {
            return ProjModelview * vec4<f32>(in_position, 1.0);
        }
        @fragment
        fn fs_main() -> @location(0) vec4<f32> {
            return vec4<f32>(Color, 1.0);
        }
    "#;

    fn flat_node(ctx: &Context) -> NodeRef {
        let shader = crate::program::ShaderProgram::from_source(ctx, FLAT).unwrap();
        DrawProgram::new(ctx, shader, DrawMode::Triangles).unwrap()
    }

    #[test]
    fn test_unknown_input_errors() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let node = flat_node(&ctx);
        let err = node.borrow_mut().set("NoSuchThing", 1.0f32).unwrap_err();
        assert!(matches!(err, Error::UnknownProgramInput(name) if name == "NoSuchThing"));
    }

    #[test]
    fn test_ignore_missing_is_noop() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let shader = crate::program::ShaderProgram::from_source(&ctx, FLAT).unwrap();
        let node = DrawProgram::with_options(&ctx, shader, DrawMode::Triangles, true).unwrap();
        node.borrow_mut().set("NoSuchThing", 1.0f32).unwrap();
    }

    #[test]
    fn test_uniform_type_mismatch() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let node = flat_node(&ctx);
        assert!(matches!(
            node.borrow_mut().set("Color", 3.0f32),
            Err(Error::Shape(_))
        ));
        node.borrow_mut().set("Color", [1.0f32, 0.0, 0.0]).unwrap();
    }

    #[test]
    fn test_quad_expansion() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let shader = crate::program::ShaderProgram::from_source(&ctx, FLAT).unwrap();
        let node = DrawProgram::new(&ctx, shader, DrawMode::Quads).unwrap();
        let faces = Tensor::from_vec(vec![0i32, 1, 2, 3], &[1, 4]).unwrap();
        node.borrow_mut().set_indices(&faces).unwrap();
        assert_eq!(node.borrow().indices.as_ref().unwrap().count, 6);
    }

    #[test]
    fn test_face_width_check() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let node = flat_node(&ctx);
        let faces = Tensor::from_vec(vec![0i32, 1], &[1, 2]).unwrap();
        assert!(matches!(
            node.borrow_mut().set_indices(&faces),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_tensor_uniform_inference() {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[4]).unwrap();
        assert!(matches!(
            UniformValue::from_tensor(&t).unwrap(),
            UniformValue::Vec4(_)
        ));
        let t = Tensor::from_vec(vec![0.5f64], &[1]).unwrap();
        assert!(matches!(
            UniformValue::from_tensor(&t).unwrap(),
            UniformValue::Float(_)
        ));
        let t = Tensor::zeros(DType::Float32, &[4, 4]);
        assert!(matches!(
            UniformValue::from_tensor(&t).unwrap(),
            UniformValue::Mat4(_)
        ));
        let t = Tensor::zeros(DType::Float32, &[5]);
        assert!(UniformValue::from_tensor(&t).is_err());
    }
}
