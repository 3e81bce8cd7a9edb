//! Shader compilation, reflection and caching.
//!
//! Shaders are loaded from `<root>/<file>.wgsl` and compiled with naga for a single
//! entry point. SPIR-V targets use `<root>/<file>.bin` instead if it exists. DXIL
//! targets go through HLSL and the external `dxc` compiler.

pub mod dxc;
pub mod reflect;
mod watcher;

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use naga::back::{hlsl, spv};
use naga::valid::{
    Capabilities, ModuleInfo, ShaderStages, SubgroupOperationSet, ValidationFlags, Validator,
};
use naga::Module;
use tandem_tracing::trace_span;

use crate::backend::{
    DescriptorRange, RootTable, ShaderBytecode, ShaderStage, ShaderTarget,
};
use crate::error::{AssetError, AssetErrorKind, Error, Result, ShaderCompileError};

pub use reflect::Reflection;
pub use watcher::ShaderWatcher;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderKey {
    /// File name without extension.
    pub file: String,
    pub entry: String,
}

impl ShaderKey {
    pub fn new(file: &str, entry: &str) -> Self {
        Self {
            file: file.to_owned(),
            entry: entry.to_owned(),
        }
    }
}

impl Display for ShaderKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.entry)
    }
}

/// A compiled entry point.
#[derive(Clone, Debug)]
pub struct Shader {
    key: ShaderKey,
    stage: ShaderStage,
    bytecode: ShaderBytecode,
    reflection: Reflection,
}

impl Shader {
    pub fn key(&self) -> &ShaderKey {
        &self.key
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn bytecode(&self) -> &ShaderBytecode {
        &self.bytecode
    }

    pub fn reflection(&self) -> &Reflection {
        &self.reflection
    }
}

#[derive(Clone, Debug)]
pub struct ShaderCompiler {
    root: PathBuf,
    target: ShaderTarget,
    debug: bool,
}

impl ShaderCompiler {
    pub fn new(root: impl Into<PathBuf>, target: ShaderTarget, debug: bool) -> Self {
        Self {
            root: root.into(),
            target,
            debug,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target(&self) -> ShaderTarget {
        self.target
    }

    /// Loads and compiles the shader identified by `key`.
    pub fn compile(&self, key: &ShaderKey) -> Result<Shader> {
        let _span = trace_span!("ShaderCompiler::compile").entered();

        let binary = self.root.join(format!("{}.bin", key.file));
        let res = if self.target == ShaderTarget::SpirV && binary.is_file() {
            tracing::debug!("loading precompiled shader {}", binary.display());
            let bytes = std::fs::read(&binary).map_err(|err| AssetError {
                path: binary.clone(),
                kind: AssetErrorKind::Io(err),
            })?;
            self.compile_spirv(key, &bytes)
        } else {
            let path = self.root.join(format!("{}.wgsl", key.file));
            let source = std::fs::read_to_string(&path).map_err(|err| AssetError {
                path,
                kind: AssetErrorKind::Io(err),
            })?;
            self.compile_wgsl(key, &source)
        };

        match &res {
            Ok(_) => tracing::info!("compiled shader {} for {:?}", key, self.target),
            Err(Error::ShaderCompile(err)) => tracing::error!("{}", err),
            Err(_) => (),
        }

        res
    }

    /// Compiles entry point `key.entry` of WGSL `source`.
    pub fn compile_wgsl(&self, key: &ShaderKey, source: &str) -> Result<Shader> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|err| compile_error(key, err.emit_to_string(source)))?;
        let info = validate(&module, ValidationFlags::all())
            .map_err(|err| compile_error(key, err.emit_to_string(source)))?;

        self.compile_module(key, &module, &info)
    }

    /// Uses precompiled SPIR-V `bytes` for entry point `key.entry`.
    pub fn compile_spirv(&self, key: &ShaderKey, bytes: &[u8]) -> Result<Shader> {
        if bytes.len() % 4 != 0 {
            return Err(compile_error(key, "SPIR-V length is not a multiple of 4".to_owned()).into());
        }

        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(compile_error(key, "invalid SPIR-V magic number".to_owned()).into());
        }

        let module = naga::front::spv::parse_u8_slice(bytes, &naga::front::spv::Options::default())
            .map_err(|err| compile_error(key, err.to_string()))?;
        // Validation only computes resource usage, the binary was validated when it
        // was built.
        let info = validate(&module, ValidationFlags::empty())
            .map_err(|err| compile_error(key, err.to_string()))?;

        let (index, stage) = find_entry_point(key, &module)?;
        Ok(Shader {
            key: key.clone(),
            stage,
            bytecode: ShaderBytecode::SpirV(words),
            reflection: reflect::reflect(&module, &info, index),
        })
    }

    fn compile_module(&self, key: &ShaderKey, module: &Module, info: &ModuleInfo) -> Result<Shader> {
        let (index, stage) = find_entry_point(key, module)?;
        let reflection = reflect::reflect(module, info, index);

        let bytecode = match self.target {
            ShaderTarget::SpirV => {
                let mut options = spv::Options::default();
                if self.debug {
                    options.flags |= spv::WriterFlags::DEBUG;
                }

                let pipeline = spv::PipelineOptions {
                    shader_stage: module.entry_points[index].stage,
                    entry_point: key.entry.clone(),
                };

                let words = spv::write_vec(module, info, &options, Some(&pipeline))
                    .map_err(|err| compile_error(key, err.to_string()))?;
                ShaderBytecode::SpirV(words)
            }
            ShaderTarget::Dxil => {
                let options = hlsl::Options {
                    shader_model: hlsl::ShaderModel::V6_0,
                    ..Default::default()
                };

                let mut source = String::new();
                let names = {
                    let mut writer = hlsl::Writer::new(&mut source, &options);
                    writer
                        .write(module, info, None)
                        .map_err(|err| compile_error(key, err.to_string()))?
                        .entry_point_names
                };

                let name = match names.into_iter().nth(index) {
                    Some(Ok(name)) => name,
                    Some(Err(err)) => return Err(compile_error(key, err.to_string()).into()),
                    None => return Err(compile_error(key, "missing HLSL entry point".to_owned()).into()),
                };

                let dxil = dxc::compile(&source, &name, stage, self.debug)
                    .map_err(|log| compile_error(key, log))?;
                ShaderBytecode::Dxil(dxil)
            }
        };

        Ok(Shader {
            key: key.clone(),
            stage,
            bytecode,
            reflection,
        })
    }
}

fn validate(
    module: &Module,
    flags: ValidationFlags,
) -> std::result::Result<ModuleInfo, naga::WithSpan<naga::valid::ValidationError>> {
    Validator::new(flags, Capabilities::all())
        .subgroup_stages(ShaderStages::all())
        .subgroup_operations(SubgroupOperationSet::all())
        .validate(module)
}

fn find_entry_point(key: &ShaderKey, module: &Module) -> Result<(usize, ShaderStage)> {
    let Some((index, entry)) = module
        .entry_points
        .iter()
        .enumerate()
        .find(|(_, entry)| entry.name == key.entry)
    else {
        return Err(compile_error(key, format!("no entry point named {:?}", key.entry)).into());
    };

    let stage = reflect::shader_stage(entry.stage).ok_or_else(|| {
        compile_error(key, format!("unsupported stage {:?}", entry.stage))
    })?;

    Ok((index, stage))
}

fn compile_error(key: &ShaderKey, log: String) -> ShaderCompileError {
    ShaderCompileError {
        file: key.file.clone(),
        entry: key.entry.clone(),
        log,
    }
}

/// Compiled shaders keyed by `(file, entry)`.
#[derive(Debug)]
pub struct ShaderCache {
    compiler: ShaderCompiler,
    shaders: HashMap<ShaderKey, Arc<Shader>>,
    dirty: HashSet<String>,
    watcher: Option<ShaderWatcher>,
}

impl ShaderCache {
    pub fn new(compiler: ShaderCompiler) -> Self {
        Self {
            compiler,
            shaders: HashMap::new(),
            dirty: HashSet::new(),
            watcher: None,
        }
    }

    pub fn compiler(&self) -> &ShaderCompiler {
        &self.compiler
    }

    /// Starts watching the shader directory for changes.
    pub fn enable_hot_reload(&mut self) -> Result<()> {
        if self.watcher.is_none() {
            self.watcher = Some(ShaderWatcher::new(self.compiler.root())?);
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    pub fn get(&self, key: &ShaderKey) -> Option<Arc<Shader>> {
        self.shaders.get(key).cloned()
    }

    /// Returns the cached shader or compiles it.
    pub fn get_or_compile(&mut self, file: &str, entry: &str) -> Result<Arc<Shader>> {
        let key = ShaderKey::new(file, entry);
        if let Some(shader) = self.shaders.get(&key) {
            return Ok(shader.clone());
        }

        let shader = Arc::new(self.compiler.compile(&key)?);
        self.shaders.insert(key, shader.clone());
        Ok(shader)
    }

    /// Marks every entry point of `file` for recompilation.
    pub fn mark_changed(&mut self, file: &str) {
        self.dirty.insert(file.to_owned());
    }

    /// Recompiles the shaders of changed files.
    ///
    /// A shader that fails to compile keeps its previous version. Returns the keys
    /// that were replaced.
    pub fn reload_changed(&mut self) -> Vec<ShaderKey> {
        if let Some(watcher) = &self.watcher {
            self.dirty.extend(watcher.take_changed());
        }

        if self.dirty.is_empty() {
            return Vec::new();
        }

        let _span = trace_span!("ShaderCache::reload_changed").entered();

        let mut keys: Vec<_> = self
            .shaders
            .keys()
            .filter(|key| self.dirty.contains(&key.file))
            .cloned()
            .collect();
        keys.sort();
        self.dirty.clear();

        keys.retain(|key| match self.compiler.compile(key) {
            Ok(shader) => {
                self.shaders.insert(key.clone(), Arc::new(shader));
                true
            }
            Err(err) => {
                tracing::error!("keeping previous version of {}: {}", key, err);
                false
            }
        });

        keys
    }
}

/// A compiled shader with the root tables derived from its reflection.
#[derive(Clone, Debug)]
pub struct ShaderHandle {
    shader: Arc<Shader>,
    tables: Vec<RootTable>,
}

impl ShaderHandle {
    fn new(shader: Arc<Shader>, stage: ShaderStage) -> Result<Self> {
        if shader.stage() != stage {
            return Err(compile_error(
                shader.key(),
                format!("expected a {:?} shader, got {:?}", stage, shader.stage()),
            )
            .into());
        }

        let tables = shader
            .reflection()
            .ranges
            .iter()
            .map(|range| RootTable {
                range: *range,
                visibility: stage.stages(),
            })
            .collect();

        Ok(Self { shader, tables })
    }

    pub fn shader(&self) -> &Arc<Shader> {
        &self.shader
    }

    /// One single-range table per reflected range, in declaration order.
    pub fn tables(&self) -> &[RootTable] {
        &self.tables
    }

    pub fn samplers(&self) -> &[DescriptorRange] {
        &self.shader.reflection().samplers
    }

    pub fn bytecode(&self) -> &ShaderBytecode {
        self.shader.bytecode()
    }

    pub fn entry(&self) -> &str {
        &self.shader.key().entry
    }
}

macro_rules! stage_handle {
    ($name:ident, $stage:expr) => {
        #[derive(Clone, Debug)]
        pub struct $name(ShaderHandle);

        impl $name {
            pub fn new(shader: Arc<Shader>) -> Result<Self> {
                ShaderHandle::new(shader, $stage).map(Self)
            }

            pub fn load(cache: &mut ShaderCache, file: &str, entry: &str) -> Result<Self> {
                Self::new(cache.get_or_compile(file, entry)?)
            }
        }

        impl Deref for $name {
            type Target = ShaderHandle;

            fn deref(&self) -> &ShaderHandle {
                &self.0
            }
        }
    };
}

stage_handle!(VertexShader, ShaderStage::Vertex);
stage_handle!(FragmentShader, ShaderStage::Fragment);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::backend::{RangeType, ShaderBytecode, ShaderStage, ShaderTarget};
    use crate::error::Error;

    use super::{FragmentShader, ShaderCache, ShaderCompiler, ShaderKey, VertexShader, SPIRV_MAGIC};

    const TRIANGLE: &str = r#"
        struct Object { transform: mat4x4<f32> }

        @group(0) @binding(0) var<uniform> view: mat4x4<f32>;
        @group(1) @binding(0) var<uniform> object: Object;
        @group(2) @binding(0) var color: texture_2d<f32>;
        @group(3) @binding(0) var color_sampler: sampler;

        struct VertexOutput {
            @builtin(position) position: vec4<f32>,
            @location(0) uv: vec2<f32>,
        }

        @vertex
        fn vs_main(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOutput {
            var out: VertexOutput;
            out.position = view * object.transform * vec4(position, 1.0);
            out.uv = uv;
            return out;
        }

        @fragment
        fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
            return textureSample(color, color_sampler, in.uv);
        }
    "#;

    fn cache_with(source: &str) -> (tempfile::TempDir, ShaderCache) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("triangle.wgsl"), source).unwrap();
        let compiler = ShaderCompiler::new(dir.path(), ShaderTarget::SpirV, false);
        (dir, ShaderCache::new(compiler))
    }

    #[test]
    fn compile_spirv_entry_points() {
        let (_dir, mut cache) = cache_with(TRIANGLE);

        let vs = VertexShader::load(&mut cache, "triangle", "vs_main").unwrap();
        let fs = FragmentShader::load(&mut cache, "triangle", "fs_main").unwrap();

        let ShaderBytecode::SpirV(words) = vs.bytecode() else {
            panic!("expected SPIR-V");
        };
        assert_eq!(words[0], SPIRV_MAGIC);

        assert_eq!(vs.tables().len(), 2);
        assert!(vs.tables().iter().all(|table| table.range.ty == RangeType::Cbv));

        assert_eq!(fs.tables().len(), 1);
        assert_eq!(fs.tables()[0].range.ty, RangeType::Srv);
        assert_eq!(fs.samplers().len(), 1);
        assert_eq!(
            fs.tables().len(),
            fs.shader().reflection().binding_count()
        );
    }

    #[test]
    fn cache_returns_same_shader() {
        let (_dir, mut cache) = cache_with(TRIANGLE);

        let a = cache.get_or_compile("triangle", "vs_main").unwrap();
        let b = cache.get_or_compile("triangle", "vs_main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stage_mismatch_is_rejected() {
        let (_dir, mut cache) = cache_with(TRIANGLE);
        assert!(matches!(
            VertexShader::load(&mut cache, "triangle", "fs_main"),
            Err(Error::ShaderCompile(_))
        ));
    }

    #[test]
    fn compile_errors_carry_log() {
        let (_dir, mut cache) = cache_with("fn broken( {");

        match cache.get_or_compile("triangle", "vs_main") {
            Err(Error::ShaderCompile(err)) => {
                assert_eq!(err.file, "triangle");
                assert_eq!(err.entry, "vs_main");
                assert!(!err.log.is_empty());
            }
            res => panic!("unexpected result {:?}", res.map(|_| ())),
        }

        assert!(matches!(
            cache.get_or_compile("missing", "vs_main"),
            Err(Error::Asset(_))
        ));
        assert!(matches!(
            cache.get_or_compile("triangle", "vs_main"),
            Err(Error::ShaderCompile(_))
        ));
    }

    #[test]
    fn precompiled_binary_is_preferred() {
        let (dir, mut cache) = cache_with(TRIANGLE);
        let compiled = cache.get_or_compile("triangle", "fs_main").unwrap();

        std::fs::write(
            dir.path().join("prebuilt.bin"),
            compiled.bytecode().as_bytes(),
        )
        .unwrap();

        let shader = cache.get_or_compile("prebuilt", "fs_main").unwrap();
        assert_eq!(shader.stage(), ShaderStage::Fragment);
        assert_eq!(shader.bytecode(), compiled.bytecode());
        assert_eq!(shader.reflection().ranges.len(), 1);
        assert_eq!(shader.reflection().samplers.len(), 1);
    }

    #[test]
    fn reload_keeps_previous_on_failure() {
        let (dir, mut cache) = cache_with(TRIANGLE);
        let before = cache.get_or_compile("triangle", "vs_main").unwrap();

        std::fs::write(dir.path().join("triangle.wgsl"), "not wgsl").unwrap();
        cache.mark_changed("triangle");
        assert!(cache.reload_changed().is_empty());
        let key = ShaderKey::new("triangle", "vs_main");
        assert!(Arc::ptr_eq(&before, &cache.get(&key).unwrap()));

        std::fs::write(dir.path().join("triangle.wgsl"), TRIANGLE).unwrap();
        cache.mark_changed("triangle");
        assert_eq!(cache.reload_changed(), [key.clone()]);
        assert!(!Arc::ptr_eq(&before, &cache.get(&key).unwrap()));

        assert!(cache.reload_changed().is_empty());
    }
}
