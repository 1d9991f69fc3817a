pub mod builder;
pub use builder::{ConstructorBuilder, OperandSpec, SpecificationBuilder};

mod decision;

pub mod equation;
pub use equation::{ConstraintOp, PatternEquation};

pub mod error;
pub use error::SpecificationError;

pub mod template;
pub use template::{Statement, Value};

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sleigh_arch::ArchitectureDef;
use sleigh_bytes::Endian;
use ustr::Ustr;

use crate::disassembly::symbol::SymbolTable;
use crate::space_manager::SpaceManager;

/// A compiled instruction-set description: address spaces, symbols and
/// constructor tables with their decision trees.
#[derive(Debug, Clone)]
#[derive(serde::Deserialize, serde::Serialize)]
pub struct Specification {
    pub(crate) name: String,
    pub(crate) architecture: Option<ArchitectureDef>,
    pub(crate) endian: Endian,
    pub(crate) alignment: usize,
    pub(crate) unique_mask: u64,
    pub(crate) unique_span: u64,
    pub(crate) needs_next2: bool,
    pub(crate) sections: Vec<Ustr>,
    pub(crate) context_defaults: Vec<(Ustr, u32)>,
    pub(crate) program_counter: Option<Ustr>,
    pub(crate) manager: SpaceManager,
    pub(crate) symbols: SymbolTable,
}

impl Specification {
    pub fn from_yaml_str(input: &str) -> Result<Self, SpecificationError> {
        let spec: Self = serde_yaml::from_str(input)?;
        spec.manager.validate()?;
        if !spec.unique_span.is_power_of_two() || spec.unique_span <= spec.unique_mask {
            return Err(SpecificationError::template(
                "the unique space",
                format!("temporaries are spaced by {:#x}", spec.unique_span),
            ))
        }
        spec.symbols
            .validate(&spec.manager, spec.sections.len(), spec.unique_span)?;
        Ok(spec)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SpecificationError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|error| SpecificationError::ParseFile {
            path: path.to_owned(),
            error,
        })?;

        let mut input = String::new();
        file.read_to_string(&mut input)
            .map_err(|error| SpecificationError::ParseFile {
                path: path.to_owned(),
                error,
            })?;

        Self::from_yaml_str(&input).map_err(|e| {
            log::warn!("aborted loading `{}`: {}", path.display(), e);
            e
        })
    }

    pub fn to_yaml_string(&self) -> Result<String, SpecificationError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn architecture(&self) -> Option<&ArchitectureDef> {
        self.architecture.as_ref()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn unique_mask(&self) -> u64 {
        self.unique_mask
    }

    /// Distance between the temporaries of two parse-tree nodes of the
    /// same instruction.
    pub fn unique_span(&self) -> u64 {
        self.unique_span
    }

    /// True when some constructor refers to the address after the next
    /// instruction.
    pub fn needs_next2(&self) -> bool {
        self.needs_next2
    }

    /// Named semantic sections, indexed as constructors' named templates.
    pub fn sections(&self) -> &[Ustr] {
        &self.sections
    }

    pub fn section_index(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|section| section.as_str() == name)
    }

    pub fn context_defaults(&self) -> &[(Ustr, u32)] {
        &self.context_defaults
    }

    pub fn program_counter(&self) -> Option<&str> {
        self.program_counter.as_ref().map(Ustr::as_str)
    }

    pub fn manager(&self) -> &SpaceManager {
        &self.manager
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disassembly::Opcode;
    use crate::space::SpaceKind;

    fn tiny() -> Result<Specification, SpecificationError> {
        let mut builder = SpecificationBuilder::new("tiny", Endian::Little, 1);
        builder.default_space("ram", 4, 1)?;
        builder.space("register", SpaceKind::Register, 4, 1)?;
        builder.register("a", "register", 0, 1)?;
        builder.token("byte", 8, Endian::Little)?;
        builder.field("byte", "op", 0, 7, false, true)?;
        builder
            .constructor("instruction")
            .pattern(PatternEquation::equal("op", 0x3e))
            .print("INC a")
            .template(vec![Statement::op(
                Opcode::IntAdd,
                Some(Value::register("a")),
                vec![Value::register("a"), Value::constant(1, 1)],
            )])
            .finish()?;
        builder.build()
    }

    #[test]
    fn yaml_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let spec = tiny()?;
        let text = spec.to_yaml_string()?;
        let back = Specification::from_yaml_str(&text)?;

        assert_eq!(back.name(), "tiny");
        assert_eq!(back.endian(), Endian::Little);
        assert_eq!(back.symbols().len(), spec.symbols().len());
        assert_eq!(back.manager().default_space().name(), "ram");
        assert_eq!(back.symbols().root()?.constructors()?.len(), 1);
        Ok(())
    }

    #[test]
    fn corrupted_tables_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let text = tiny()?.to_yaml_string()?;

        let mut root: serde_yaml::Value = serde_yaml::from_str(&text)?;
        root["symbols"]["root"] = serde_yaml::Value::from(999u64);
        let err = Specification::from_yaml_str(&serde_yaml::to_string(&root)?).unwrap_err();
        assert!(matches!(err, SpecificationError::UnresolvedReference { .. }));

        // the only constructor takes no operands; point it at a non-operand
        assert_eq!(text.matches("operands: []").count(), 1);
        let err = Specification::from_yaml_str(&text.replace("operands: []", "operands: [0]")).unwrap_err();
        assert!(matches!(err, SpecificationError::IllFormedTemplate { .. }));

        let mut span: serde_yaml::Value = serde_yaml::from_str(&text)?;
        span["unique_span"] = serde_yaml::Value::from(3u64);
        let err = Specification::from_yaml_str(&serde_yaml::to_string(&span)?).unwrap_err();
        assert!(matches!(err, SpecificationError::IllFormedTemplate { .. }));
        Ok(())
    }

    #[test]
    fn missing_files_name_the_path() {
        let err = Specification::from_file("/nonexistent/spec.yaml").unwrap_err();
        assert!(matches!(err, SpecificationError::ParseFile { .. }));
        assert!(err.to_string().contains("/nonexistent/spec.yaml"));
    }
}
