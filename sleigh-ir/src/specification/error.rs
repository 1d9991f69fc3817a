use std::path::PathBuf;

use thiserror::Error;

/// A malformed specification, reported while it is built or loaded.
#[derive(Debug, Error)]
pub enum SpecificationError {
    #[error("symbol `{0}` is defined more than once")]
    DuplicateSymbol(String),
    #[error("no {0} space is defined")]
    MissingSpace(&'static str),
    #[error("undefined symbol `{name}` referenced by {context}")]
    UnresolvedReference {
        name: String,
        context: String,
    },
    #[error("field `{name}` covers bits {low}..={high}, outside of the {width} bits available")]
    IllFormedField {
        name: String,
        low: usize,
        high: usize,
        width: usize,
    },
    #[error("pattern of {context} is unsupported: {reason}")]
    IllFormedPattern {
        context: String,
        reason: String,
    },
    #[error("semantics of {context} are ill-formed: {reason}")]
    IllFormedTemplate {
        context: String,
        reason: String,
    },
    #[error("cannot read specification `{}`: {}", path.display(), error)]
    ParseFile {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl SpecificationError {
    pub(crate) fn unresolved(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            name: name.into(),
            context: context.into(),
        }
    }

    pub(crate) fn pattern(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IllFormedPattern {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn template(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IllFormedTemplate {
            context: context.into(),
            reason: reason.into(),
        }
    }
}
