//! WGSL shader compilation with live reload.
//!
//! A program is one wgpu module assembled from one or two source files
//! (passing the same path for both stages yields a single-module program;
//! distinct paths are concatenated). Compile diagnostics are mirrored to
//! `<source>.out` next to each file so an editor can watch them; the file
//! is truncated on success.
//!
//! Reload policy: the first compile must succeed or the load call fails.
//! Afterwards, file modifications are picked up before the next draw. A
//! broken edit keeps the previous module running and logs a warning.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::SystemTime;

use crate::context::{Context, GpuState};
use crate::error::{Error, Result};
use crate::program::reflect::{reflect, Reflection};

/// Shared handle to a [`ShaderProgram`], as held by draw programs.
pub type ShaderRef = Rc<RefCell<ShaderProgram>>;

struct SourceFile {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

/// A compiled shader module plus its reflection data.
pub struct ShaderProgram {
    gpu: Arc<GpuState>,
    sources: Vec<SourceFile>,
    module: wgpu::ShaderModule,
    reflection: Reflection,
    generation: u64,
}

impl ShaderProgram {
    /// Loads and compiles a program from WGSL files.
    pub fn load(
        ctx: &Context,
        vertex_path: impl AsRef<Path>,
        fragment_path: impl AsRef<Path>,
    ) -> Result<ShaderRef> {
        let gpu = ctx.gpu();
        gpu.ensure_current()?;

        let mut paths = vec![vertex_path.as_ref().to_path_buf()];
        if fragment_path.as_ref() != vertex_path.as_ref() {
            paths.push(fragment_path.as_ref().to_path_buf());
        }

        let source = read_concat(&paths)?;
        let compiled = compile(&gpu, &source);
        write_logs(&paths, compiled.as_ref().err().map(String::as_str));
        let (module, reflection) = compiled.map_err(|log| Error::ShaderCompile {
            path: paths[0].clone(),
            log,
        })?;

        let sources = paths
            .into_iter()
            .map(|path| {
                let mtime = mtime_of(&path);
                SourceFile { path, mtime }
            })
            .collect();

        Ok(Rc::new(RefCell::new(ShaderProgram {
            gpu,
            sources,
            module,
            reflection,
            generation: 0,
        })))
    }

    /// Compiles a program from an in-memory source. No reload tracking.
    pub fn from_source(ctx: &Context, source: &str) -> Result<ShaderRef> {
        let gpu = ctx.gpu();
        gpu.ensure_current()?;
        let (module, reflection) = compile(&gpu, source).map_err(|log| Error::ShaderCompile {
            path: PathBuf::from("<inline>"),
            log,
        })?;
        Ok(Rc::new(RefCell::new(ShaderProgram {
            gpu,
            sources: Vec::new(),
            module,
            reflection,
            generation: 0,
        })))
    }

    pub(crate) fn module(&self) -> &wgpu::ShaderModule {
        &self.module
    }

    pub(crate) fn reflection(&self) -> &Reflection {
        &self.reflection
    }

    /// Bumped on every successful reload; pipeline caches key on it.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Recompiles if any source file changed on disk since the last
    /// (re)compile. Returns whether a new module was installed.
    pub fn reload_if_changed(&mut self) -> Result<bool> {
        if self.sources.is_empty() {
            return Ok(false);
        }
        self.gpu.ensure_current()?;

        let mut changed = false;
        for source in &self.sources {
            if mtime_of(&source.path) != source.mtime {
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }
        for source in &mut self.sources {
            source.mtime = mtime_of(&source.path);
        }

        let paths: Vec<PathBuf> = self.sources.iter().map(|s| s.path.clone()).collect();
        let source = read_concat(&paths)?;
        let compiled = compile(&self.gpu, &source);
        write_logs(&paths, compiled.as_ref().err().map(String::as_str));
        match compiled {
            Ok((module, reflection)) => {
                self.module = module;
                self.reflection = reflection;
                self.generation += 1;
                log::info!("reloaded shader {}", paths[0].display());
                Ok(true)
            }
            Err(log) => {
                log::warn!(
                    "shader reload failed, keeping previous module ({}): {}",
                    paths[0].display(),
                    log
                );
                Ok(false)
            }
        }
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_concat(paths: &[PathBuf]) -> Result<String> {
    let mut out = String::new();
    for path in paths {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::file_format(path.clone(), format!("cannot read shader source: {e}"))
        })?;
        out.push_str(&text);
        out.push('\n');
    }
    Ok(out)
}

fn write_logs(paths: &[PathBuf], error: Option<&str>) {
    for path in paths {
        let mut log_path = path.as_os_str().to_owned();
        log_path.push(".out");
        if let Err(e) = fs::write(&log_path, error.unwrap_or("")) {
            log::debug!("cannot write shader log {log_path:?}: {e}");
        }
    }
}

/// Compiles and validates WGSL, returning the module and its reflection
/// or the diagnostic text.
fn compile(
    gpu: &GpuState,
    source: &str,
) -> std::result::Result<(wgpu::ShaderModule, Reflection), String> {
    let reflection = reflect(source)?;

    gpu.device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = gpu
        .device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("tenview shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });
    if let Some(error) = pollster::block_on(gpu.device.pop_error_scope()) {
        return Err(error.to_string());
    }
    Ok((module, reflection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    const GOOD: &str = r#"
        @group(0) @binding(0) var<uniform> Transform: mat4x4<f32>;
        @vertex
        fn vs_main(@location(0) pos: vec3<f32>) -> @builtin(position) vec4<f32> {
            return Transform * vec4<f32>(pos, 1.0);
        }
        @fragment
        fn fs_main() -> @location(0) vec4<f32> {
            return vec4<f32>(0.5, 0.5, 0.5, 1.0);
        }
    "#;

    const BROKEN: &str = r#"
        @vertex
        fn vs_main(@location(0) pos: vec3<f32>) -> @builtin(position) vec4<f32> {
            return no_such_fn(pos);
        }
        @fragment
        fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }
    "#;

    fn temp_shader(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tenview_{}_{}.wgsl", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_from_source_reflection() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();
        let program = ShaderProgram::from_source(&ctx, GOOD).unwrap();
        let program = program.borrow();
        assert_eq!(program.reflection().vertex_entry, "vs_main");
        assert!(program.reflection().has_input("Transform"));
    }

    #[test]
    fn test_compile_failure_raises() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();
        assert!(matches!(
            ShaderProgram::from_source(&ctx, BROKEN).map(|_| ()),
            Err(Error::ShaderCompile { .. })
        ));
    }

    #[test]
    fn test_load_writes_empty_log() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let path = temp_shader("load_ok", GOOD);
        let program = ShaderProgram::load(&ctx, &path, &path).unwrap();
        assert_eq!(program.borrow().generation(), 0);

        let mut log_path = path.clone().into_os_string();
        log_path.push(".out");
        assert_eq!(fs::read_to_string(&log_path).unwrap(), "");

        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(&log_path);
    }

    #[test]
    fn test_broken_reload_keeps_previous_module() {
        let Some(ctx) = test_context() else { return };
        let _guard = ctx.current().unwrap();

        let path = temp_shader("reload", GOOD);
        let program = ShaderProgram::load(&ctx, &path, &path).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&path, BROKEN).unwrap();
        let reloaded = program.borrow_mut().reload_if_changed().unwrap();
        assert!(!reloaded);
        assert_eq!(program.borrow().generation(), 0);

        let mut log_path = path.clone().into_os_string();
        log_path.push(".out");
        assert!(!fs::read_to_string(&log_path).unwrap().is_empty());

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&path, GOOD).unwrap();
        let reloaded = program.borrow_mut().reload_if_changed().unwrap();
        assert!(reloaded);
        assert_eq!(program.borrow().generation(), 1);

        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(&log_path);
    }
}
