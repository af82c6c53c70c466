//! WebAssembly module loading and introspection.
//!
//! A [`Module`] is immutable once loaded: its compiled code, declared
//! imports and the export lookup built at load time never change.
//! Reloading means building a new `Module`.
//!
//! # Sources
//!
//! - [`ModuleSource::Path`]: a file on disk; `.wat` files are compiled from text
//! - [`ModuleSource::Bytes`]: an in-memory binary (must start with `\0asm`)
//! - [`ModuleSource::Wat`]: inline WebAssembly text, mostly for tests

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, instrument};
use uuid::Uuid;
use wasmtime::{Engine, ExternType};

use wasmbind_common::RuntimeError;

/// Import namespace whose functions the host must provide.
pub const ENV_NAMESPACE: &str = "env";

/// Where a module's bytes come from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A `.wasm` or `.wat` file.
    Path(PathBuf),
    /// A WebAssembly binary.
    Bytes(Vec<u8>),
    /// WebAssembly text.
    Wat(String),
}

impl ModuleSource {
    /// Human-readable locator used in logs.
    pub fn locator(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            Self::Wat(_) => "<inline wat>".to_string(),
        }
    }

    fn is_wat_path(path: &std::path::Path) -> bool {
        path.extension().is_some_and(|ext| ext == "wat")
    }
}

impl From<PathBuf> for ModuleSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

/// Kind of an import or export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Global,
    Table,
    Memory,
    Other,
}

impl ExternKind {
    fn of(ty: &ExternType) -> Self {
        match ty {
            ExternType::Func(_) => Self::Func,
            ExternType::Global(_) => Self::Global,
            ExternType::Table(_) => Self::Table,
            ExternType::Memory(_) => Self::Memory,
            #[allow(unreachable_patterns)]
            _ => Self::Other,
        }
    }
}

impl fmt::Display for ExternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Func => "func",
            Self::Global => "global",
            Self::Table => "table",
            Self::Memory => "memory",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A declared import, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecl {
    pub namespace: String,
    pub name: String,
    pub kind: ExternKind,
}

/// A declared export, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDecl {
    pub name: String,
    pub kind: ExternKind,
    pub index: usize,
}

/// Pre-resolved handle to an exported function.
///
/// Handles are tied to the module that produced them; calling one on an
/// instance of another module is a usage error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFunc {
    module_id: Uuid,
    name: String,
    index: usize,
}

impl ExportedFunc {
    /// Export name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the module's export list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity of the owning module.
    pub fn module_id(&self) -> Uuid {
        self.module_id
    }
}

/// A compiled, introspected WebAssembly module.
pub struct Module {
    id: Uuid,
    name: String,
    locator: String,
    inner: wasmtime::Module,
    content_hash: String,
    compiled_at: Instant,
    imports: Vec<ImportDecl>,
    exports: Vec<ExportDecl>,
    funcs: BTreeMap<String, ExportedFunc>,
    memory_idx: Option<usize>,
}

impl Module {
    /// Read, compile and introspect a module.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` for an empty name
    /// - `Io` if the source file cannot be read
    /// - `CompilationFailed` for malformed bytes
    /// - `UnsupportedModule` for non-function `env` imports or more than
    ///   one exported memory
    #[instrument(skip(engine, source), fields(locator = %source.locator()))]
    pub fn load(engine: &Engine, name: &str, source: &ModuleSource) -> Result<Self, RuntimeError> {
        if name.is_empty() {
            return Err(RuntimeError::invalid_config("invalid module name \"\""));
        }

        let start = Instant::now();

        info!(module = name, "loading module from \"{}\"", source.locator());

        let (inner, content_hash) = match source {
            ModuleSource::Path(path) if ModuleSource::is_wat_path(path) => {
                debug!(path = %path.display(), "compiling wat");
                let wat = std::fs::read_to_string(path)?;
                Self::from_wat(engine, &wat)?
            }
            ModuleSource::Path(path) => {
                let bytes = std::fs::read(path)?;
                Self::from_bytes(engine, &bytes)?
            }
            ModuleSource::Bytes(bytes) => Self::from_bytes(engine, bytes)?,
            ModuleSource::Wat(wat) => Self::from_wat(engine, wat)?,
        };

        let mut module = Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            locator: source.locator(),
            inner,
            content_hash,
            compiled_at: Instant::now(),
            imports: Vec::new(),
            exports: Vec::new(),
            funcs: BTreeMap::new(),
            memory_idx: None,
        };

        module.check_imports()?;
        module.cache_exports()?;

        info!(
            module = name,
            content_hash = %module.content_hash,
            imports = module.imports.len(),
            exports = module.exports.len(),
            duration_ms = start.elapsed().as_millis(),
            "module loaded"
        );

        Ok(module)
    }

    fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<(wasmtime::Module, String), RuntimeError> {
        Self::validate_wasm_header(bytes)?;

        let module = wasmtime::Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;

        Ok((module, compute_hash(bytes)))
    }

    fn from_wat(engine: &Engine, wat: &str) -> Result<(wasmtime::Module, String), RuntimeError> {
        let module = wasmtime::Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        Ok((module, compute_hash(wat.as_bytes())))
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }

    /// Record imports; `env` may only import functions.
    fn check_imports(&mut self) -> Result<(), RuntimeError> {
        let total = self.inner.imports().len();

        for (i, import) in self.inner.imports().enumerate() {
            let decl = ImportDecl {
                namespace: import.module().to_string(),
                name: import.name().to_string(),
                kind: ExternKind::of(&import.ty()),
            };

            debug!(
                module = %self.name,
                "checking module import \"{}.{}\" ({}/{})",
                decl.namespace,
                decl.name,
                i + 1,
                total
            );

            if decl.namespace == ENV_NAMESPACE && decl.kind != ExternKind::Func {
                return Err(RuntimeError::unsupported(
                    &self.name,
                    format!(
                        "{} import \"env.{}\" not supported",
                        decl.kind, decl.name
                    ),
                ));
            }

            self.imports.push(decl);
        }

        Ok(())
    }

    /// Build the name-keyed function lookup and find the memory export.
    fn cache_exports(&mut self) -> Result<(), RuntimeError> {
        for (index, export) in self.inner.exports().enumerate() {
            let decl = ExportDecl {
                name: export.name().to_string(),
                kind: ExternKind::of(&export.ty()),
                index,
            };

            debug!(module = %self.name, "caching module export \"{}\" ({})", decl.name, decl.kind);

            match decl.kind {
                ExternKind::Func => {
                    self.funcs.insert(
                        decl.name.clone(),
                        ExportedFunc {
                            module_id: self.id,
                            name: decl.name.clone(),
                            index,
                        },
                    );
                }
                ExternKind::Memory => {
                    if let Some(previous) = self.memory_idx {
                        return Err(RuntimeError::unsupported(
                            &self.name,
                            format!(
                                "multiple memory exports (\"{}\" and \"{}\")",
                                self.exports[previous].name, decl.name
                            ),
                        ));
                    }
                    self.memory_idx = Some(index);
                }
                _ => {}
            }

            self.exports.push(decl);
        }

        Ok(())
    }

    /// Unique identity of this load of the module.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the module was loaded from.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Get the content hash of the original bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Declared imports in declaration order.
    pub fn imports(&self) -> &[ImportDecl] {
        &self.imports
    }

    /// Declared exports in declaration order.
    pub fn exports(&self) -> &[ExportDecl] {
        &self.exports
    }

    /// Look up an exported function by name.
    pub fn func_lookup(&self, name: &str) -> Option<&ExportedFunc> {
        self.funcs.get(name)
    }

    /// The exported memory, if the module has one.
    pub fn memory_export(&self) -> Option<&ExportDecl> {
        self.memory_idx.map(|idx| &self.exports[idx])
    }

    /// Compiled Wasmtime module.
    pub fn inner(&self) -> &wasmtime::Module {
        &self.inner
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("locator", &self.locator)
            .field("content_hash", &self.content_hash)
            .field("imports", &self.imports.len())
            .field("exports", &self.exports.len())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
