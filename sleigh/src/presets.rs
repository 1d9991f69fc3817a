//! Process-wide registry of named specifications.
//!
//! Lookups ignore case; a specification carrying an architecture tag is
//! reachable both by its name and by the tag (e.g. `toy16:BE:16:default`).

use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use sleigh_ir::Specification;
use static_init::dynamic;
use unicase::UniCase;
use walkdir::WalkDir;

use crate::error::{Error, Result};

#[dynamic(drop)]
static mut PRESETS: FxHashMap<UniCase<String>, Arc<Specification>> = FxHashMap::default();

/// Registers `specification` under `name`, replacing any previous entry.
pub fn register(name: impl Into<String>, specification: Arc<Specification>) -> Option<Arc<Specification>> {
    PRESETS.write().insert(UniCase::new(name.into()), specification)
}

/// Registers `specification` under its name and its architecture tag.
pub fn register_specification(specification: Specification) -> Arc<Specification> {
    let specification = Arc::new(specification);

    if let Some(arch) = specification.architecture() {
        register(arch.to_string(), specification.clone());
    }
    register(specification.name(), specification.clone());

    specification
}

pub fn lookup(name: &str) -> Result<Arc<Specification>> {
    PRESETS
        .read()
        .get(&UniCase::new(name.to_owned()))
        .cloned()
        .ok_or_else(|| Error::ArchNotFound(name.to_owned()))
}

pub fn contains(name: &str) -> bool {
    PRESETS.read().contains_key(&UniCase::new(name.to_owned()))
}

pub fn names() -> Vec<String> {
    let mut names = PRESETS
        .read()
        .keys()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    names.sort();
    names
}

/// Registers every `*.yaml`/`*.yml` specification below `path`, skipping
/// those that fail to load. Returns the number registered.
pub fn load_directory(path: impl AsRef<Path>) -> Result<usize> {
    load_directory_with(path, true)
}

pub fn load_directory_with(path: impl AsRef<Path>, ignore_errors: bool) -> Result<usize> {
    let mut loaded = 0;

    for entry in WalkDir::new(path.as_ref()).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue
        }

        let is_spec = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext, "yaml" | "yml"))
            .unwrap_or(false);
        if !is_spec {
            continue
        }

        match Specification::from_file(entry.path()) {
            Ok(specification) => {
                log::debug!("registered `{}` from `{}`", specification.name(), entry.path().display());
                register_specification(specification);
                loaded += 1;
            }
            Err(_) if ignore_errors => (),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(loaded)
}
