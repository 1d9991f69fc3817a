use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sleigh_arch::Mode;
use sleigh_ir::translator::{DEFAULT_MAX_DELAY_DEPTH, DEFAULT_WINDOW};
use sleigh_ir::Specification;

use crate::emit::{AssemblyEmit, CollectingAssemblyEmit, CollectingPcodeEmit, PcodeEmit};
use crate::error::{Error, Result};
use crate::loader::LoadImage;
use crate::presets;

/// Serialised session options.
///
/// ```yaml
/// arch: toy16:BE:16:default
/// mode: Mode32
/// max_delay_depth: 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SleighConfig {
    /// Preset name or architecture tag.
    pub arch: Option<String>,
    /// Specification file; takes precedence over `arch`.
    pub spec_path: Option<PathBuf>,
    pub mode: Mode,
    pub max_delay_depth: usize,
    pub window: usize,
}

impl Default for SleighConfig {
    fn default() -> Self {
        Self {
            arch: None,
            spec_path: None,
            mode: Mode::default(),
            max_delay_depth: DEFAULT_MAX_DELAY_DEPTH,
            window: DEFAULT_WINDOW,
        }
    }
}

impl SleighConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }
}

/// Everything a [`Sleigh`](crate::Sleigh) session is created from.
pub struct SleighSetting {
    pub(crate) asm_emit: Box<dyn AssemblyEmit>,
    pub(crate) pcode_emit: Box<dyn PcodeEmit>,
    pub(crate) loader: Box<dyn LoadImage>,
    pub(crate) spec: Option<Arc<Specification>>,
    pub(crate) mode: Mode,
    pub(crate) max_delay_depth: usize,
    pub(crate) window: usize,
}

impl SleighSetting {
    /// Collecting emitters, default mode and limits; no specification.
    pub fn new(loader: Box<dyn LoadImage>) -> Self {
        Self {
            asm_emit: Box::new(CollectingAssemblyEmit::default()),
            pcode_emit: Box::new(CollectingPcodeEmit::default()),
            loader,
            spec: None,
            mode: Mode::default(),
            max_delay_depth: DEFAULT_MAX_DELAY_DEPTH,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_spec(spec: Arc<Specification>, loader: Box<dyn LoadImage>) -> Self {
        let mut setting = Self::new(loader);
        setting.spec(spec);
        setting
    }

    pub fn with_arch(arch: &str, loader: Box<dyn LoadImage>) -> Result<Self> {
        let mut setting = Self::new(loader);
        setting.arch(arch)?;
        Ok(setting)
    }

    pub fn from_config(config: &SleighConfig, loader: Box<dyn LoadImage>) -> Result<Self> {
        let mut setting = Self::new(loader);

        if let Some(ref path) = config.spec_path {
            setting.spec(Arc::new(Specification::from_file(path)?));
        } else if let Some(ref arch) = config.arch {
            setting.arch(arch)?;
        } else {
            return Err(Error::MissingArg("one of `arch` or `spec_path`".to_owned()))
        }

        setting
            .mode(config.mode)
            .max_delay_depth(config.max_delay_depth)
            .window(config.window);

        Ok(setting)
    }

    pub fn asm_emit(&mut self, emit: Box<dyn AssemblyEmit>) -> &mut Self {
        self.asm_emit = emit;
        self
    }

    pub fn pcode_emit(&mut self, emit: Box<dyn PcodeEmit>) -> &mut Self {
        self.pcode_emit = emit;
        self
    }

    pub fn spec(&mut self, spec: Arc<Specification>) -> &mut Self {
        self.spec = Some(spec);
        self
    }

    pub fn arch(&mut self, arch: &str) -> Result<&mut Self> {
        self.spec = Some(presets::lookup(arch)?);
        Ok(self)
    }

    pub fn mode(&mut self, mode: Mode) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn max_delay_depth(&mut self, depth: usize) -> &mut Self {
        self.max_delay_depth = depth;
        self
    }

    pub fn window(&mut self, window: usize) -> &mut Self {
        self.window = window;
        self
    }
}
