//! Module/symbol registry and manifest export.
//!
//! Runtime events carry a 64-bit `function_id`; this registry assigns them
//! and remembers enough to emit the session `manifest.json` that an external
//! resolver joins against the trace files.
//!
//! # Identity scheme
//!
//! - `module_id = FNV-1a-32(lowercase(module_path))`, with 0 remapped to the
//!   golden-ratio constant `0x9E3779B9` so a zero id never appears.
//! - `symbol_index` is 1-based and monotonically assigned per module;
//!   registering the same symbol twice returns the existing index.
//! - `function_id = (module_id << 32) | symbol_index`.
//!
//! Case-insensitive hashing makes `/usr/lib/Foo` and `/usr/lib/foo` the same
//! module, matching filesystem semantics on the platforms the tracer targets.
//!
//! # Concurrency
//!
//! One mutex around the whole table. Registration happens at hook-install
//! time, not on the event fast path, so contention is irrelevant; the maps
//! are `BTreeMap`s so the manifest serializes deterministically.

use serde::Serialize;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use std::sync::Mutex;

/// Replacement for a zero FNV hash; never a valid natural module id of 0.
pub const MODULE_ID_ZERO_REMAP: u32 = 0x9E37_79B9;

/// Manifest schema version.
pub const MANIFEST_FORMAT_VERSION: &str = "1.0.0";

/// Case-insensitive (ASCII) FNV-1a 32-bit hash with the zero remap.
pub fn fnv1a32_ci(input: &str) -> u32 {
    const FNV_OFFSET: u32 = 2_166_136_261;
    const FNV_PRIME: u32 = 16_777_619;

    let mut hash = FNV_OFFSET;
    for byte in input.bytes() {
        let byte = byte.to_ascii_lowercase();
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if hash == 0 {
        hash = MODULE_ID_ZERO_REMAP;
    }
    hash
}

/// Packs a module id and 1-based symbol index into a function id.
#[inline]
pub fn make_function_id(module_id: u32, symbol_index: u32) -> u64 {
    ((module_id as u64) << 32) | symbol_index as u64
}

#[derive(Debug, Clone, Copy)]
struct ModuleMeta {
    base_address: u64,
    size: u64,
    uuid: [u8; 16],
}

struct ModuleEntry {
    module_id: u32,
    /// Path as first registered, for display in the manifest.
    path: String,
    next_index: u32,
    symbols: BTreeMap<String, u32>,
    meta: Option<ModuleMeta>,
}

/// Thread-safe registry of modules and symbols.
///
/// Keyed by the lowercased module path so differently-cased spellings of the
/// same path share one entry (and therefore one symbol table); the manifest
/// shows the spelling seen first.
pub struct SymbolRegistry {
    modules: Mutex<BTreeMap<String, ModuleEntry>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ModuleEntry>> {
        self.modules.lock().expect("symbol registry poisoned")
    }

    /// Registers (or looks up) `symbol` in `module_path` and returns its
    /// function id. Idempotent: repeated calls never allocate a new index,
    /// including calls that spell the module path with different case.
    pub fn register_symbol(&self, module_path: &str, symbol: &str) -> u64 {
        let mut modules = self.lock();
        let entry = modules
            .entry(module_path.to_ascii_lowercase())
            .or_insert_with(|| ModuleEntry {
                module_id: fnv1a32_ci(module_path),
                path: module_path.to_owned(),
                next_index: 1,
                symbols: BTreeMap::new(),
                meta: None,
            });

        if let Some(&index) = entry.symbols.get(symbol) {
            return make_function_id(entry.module_id, index);
        }
        let index = entry.next_index;
        entry.next_index += 1;
        entry.symbols.insert(symbol.to_owned(), index);
        make_function_id(entry.module_id, index)
    }

    /// Function id of an already-registered symbol, if present.
    pub fn lookup(&self, module_path: &str, symbol: &str) -> Option<u64> {
        let modules = self.lock();
        let entry = modules.get(&module_path.to_ascii_lowercase())?;
        let index = entry.symbols.get(symbol)?;
        Some(make_function_id(entry.module_id, *index))
    }

    /// Module id of a registered module, if present.
    pub fn module_id(&self, module_path: &str) -> Option<u32> {
        self.lock()
            .get(&module_path.to_ascii_lowercase())
            .map(|e| e.module_id)
    }

    /// Number of symbols registered in one module.
    pub fn symbol_count(&self, module_path: &str) -> usize {
        self.lock()
            .get(&module_path.to_ascii_lowercase())
            .map(|e| e.symbols.len())
            .unwrap_or(0)
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> usize {
        self.lock().len()
    }

    /// Attaches load metadata to a module, creating the entry if needed.
    pub fn set_module_metadata(
        &self,
        module_path: &str,
        base_address: u64,
        size: u64,
        uuid: [u8; 16],
    ) {
        let mut modules = self.lock();
        let entry = modules
            .entry(module_path.to_ascii_lowercase())
            .or_insert_with(|| ModuleEntry {
                module_id: fnv1a32_ci(module_path),
                path: module_path.to_owned(),
                next_index: 1,
                symbols: BTreeMap::new(),
                meta: None,
            });
        entry.meta = Some(ModuleMeta {
            base_address,
            size,
            uuid,
        });
    }

    /// Drops every module and symbol.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Builds the manifest document.
    pub fn manifest(&self) -> Manifest {
        let modules = self.lock();

        let mut module_docs = Vec::with_capacity(modules.len());
        let mut symbol_docs = Vec::new();

        for entry in modules.values() {
            module_docs.push(ModuleDoc {
                module_id: entry.module_id,
                path: entry.path.clone(),
                base_address: entry.meta.map(|m| format!("0x{:x}", m.base_address)),
                size: entry.meta.map(|m| m.size),
                uuid: entry.meta.map(|m| format_uuid(&m.uuid)),
            });

            for (name, &index) in entry.symbols.iter() {
                symbol_docs.push(SymbolDoc {
                    function_id: format!("0x{:016x}", make_function_id(entry.module_id, index)),
                    module_id: entry.module_id,
                    symbol_index: index,
                    name: name.clone(),
                });
            }
        }

        Manifest {
            format_version: MANIFEST_FORMAT_VERSION.to_owned(),
            modules: module_docs,
            symbols: symbol_docs,
        }
    }

    /// Serializes the manifest as pretty JSON into `<dir>/manifest.json`.
    pub fn write_manifest(&self, dir: &Path) -> io::Result<()> {
        let manifest = self.manifest();
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        std::fs::write(dir.join("manifest.json"), json)
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Uppercase hex UUID in 8-4-4-4-12 grouping.
fn format_uuid(uuid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            out.push('-');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}

/// Root document of `manifest.json`.
#[derive(Debug, Serialize)]
pub struct Manifest {
    pub format_version: String,
    pub modules: Vec<ModuleDoc>,
    pub symbols: Vec<SymbolDoc>,
}

/// One module entry in the manifest.
#[derive(Debug, Serialize)]
pub struct ModuleDoc {
    pub module_id: u32,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// One symbol entry in the manifest.
#[derive(Debug, Serialize)]
pub struct SymbolDoc {
    pub function_id: String,
    pub module_id: u32,
    pub symbol_index: u32,
    pub name: String,
}
