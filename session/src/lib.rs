use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use ty::TargetLayout;

/// Session is a struct that holds the compiler options for a single compilation.
#[derive(Debug, Default)]
pub struct Session {
    pub compiler_option: CompilerOption,
}

impl Session {
    pub fn new(compiler_option: CompilerOption) -> Self {
        Self { compiler_option }
    }
}

/// Switches of the per-function pipeline. Every key is optional in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerOption {
    /// Evaluate arithmetic on literal operands while folding constants.
    pub fold_arithmetic: bool,
    /// Rebuild expression trees from single-use temporaries.
    pub stackify: bool,
    /// Mark pointer variables that must survive a collection.
    pub analyze_gc: bool,
    /// Log the IR after every stage.
    pub emit_ir: bool,
    pub layout: TargetLayout,
}

impl Default for CompilerOption {
    fn default() -> Self {
        Self {
            fold_arithmetic: false,
            stackify: true,
            analyze_gc: true,
            emit_ir: false,
            layout: TargetLayout::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file `{}`", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config")]
    Parse(#[from] toml::de::Error),
}

impl CompilerOption {
    pub fn from_toml_str(config: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        let option = CompilerOption::from_toml_str("").unwrap();
        assert_eq!(option, CompilerOption::default());
        assert!(option.stackify);
        assert!(!option.fold_arithmetic);
    }

    #[test]
    fn partial_config() {
        let option = CompilerOption::from_toml_str(
            r#"
            fold_arithmetic = true
            emit_ir = true

            [layout]
            ptr_size = 4
            "#,
        )
        .unwrap();
        assert!(option.fold_arithmetic);
        assert!(option.emit_ir);
        assert!(option.analyze_gc);
        assert_eq!(option.layout.ptr_size, 4);
        assert_eq!(option.layout.int_size, 4);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = CompilerOption::from_toml_str("inline_size_limit = 10").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file() {
        let err = CompilerOption::load("/nonexistent/cfg-ir.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
