use crate::registers::MismatchBehavior;
use std::path::{Path, PathBuf};

/// Engine-wide configuration, constructed exactly once at process start
/// and passed by reference into the components that need it. There is no
/// global instance and no runtime init guard: single construction is
/// enforced by `EngineConfigBuilder::build` consuming the builder.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directory holding checksum files and memory dumps for the current
    /// trace.
    trace_dir: PathBuf,
    /// What to do when VALIDATE finds a checksum divergence.
    checksum_mismatch_behavior: MismatchBehavior,
    /// Suppress warnings about environmental conditions outside the
    /// engine's control (e.g. shared writable mappings).
    suppress_environment_warnings: bool,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            trace_dir: None,
            checksum_mismatch_behavior: MismatchBehavior::BailOnMismatch,
            suppress_environment_warnings: false,
        }
    }

    pub fn trace_dir(&self) -> &Path {
        &self.trace_dir
    }

    pub fn checksum_mismatch_behavior(&self) -> MismatchBehavior {
        self.checksum_mismatch_behavior
    }

    pub fn suppress_environment_warnings(&self) -> bool {
        self.suppress_environment_warnings
    }
}

/// Builder consumed by value; `build` can therefore only be called once
/// per builder, and the resulting config is immutable.
pub struct EngineConfigBuilder {
    trace_dir: Option<PathBuf>,
    checksum_mismatch_behavior: MismatchBehavior,
    suppress_environment_warnings: bool,
}

impl EngineConfigBuilder {
    pub fn trace_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    pub fn checksum_mismatch_behavior(mut self, behavior: MismatchBehavior) -> Self {
        self.checksum_mismatch_behavior = behavior;
        self
    }

    pub fn suppress_environment_warnings(mut self, suppress: bool) -> Self {
        self.suppress_environment_warnings = suppress;
        self
    }

    pub fn build(self) -> EngineConfig {
        let trace_dir = match self.trace_dir {
            Some(dir) => dir,
            None => fatal!("EngineConfig requires a trace directory"),
        };
        EngineConfig {
            trace_dir,
            checksum_mismatch_behavior: self.checksum_mismatch_behavior,
            suppress_environment_warnings: self.suppress_environment_warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_round_trip() {
        let config = EngineConfig::builder()
            .trace_dir("/tmp/trace")
            .checksum_mismatch_behavior(MismatchBehavior::LogMismatches)
            .suppress_environment_warnings(true)
            .build();
        assert_eq!(config.trace_dir(), Path::new("/tmp/trace"));
        assert_eq!(
            config.checksum_mismatch_behavior(),
            MismatchBehavior::LogMismatches
        );
        assert!(config.suppress_environment_warnings());
    }
}
