//! Environment-derived configuration (spec §6 "Environment and
//! configuration"), read once at process-listener construction.

use std::path::{Path, PathBuf};

const TRACE_NAME_VAR: &str = "SEEC_TRACE_NAME";
const WRITE_INSTRUMENTED_VAR: &str = "SEEC_WRITE_INSTRUMENTED";

const DEFAULT_TRACE_FILENAME_PREFIX: &str = "p";

/// Resolved trace destination, following the override rules in spec §6: an
/// absolute path overrides the directory, a bare filename overrides only
/// the filename; with nothing set, the default is `p.<pid>.seec` in the
/// working directory, later renamed to `<argv0>.seec` on `notifyArgs`.
#[derive(Clone, Debug)]
pub struct TraceConfig {
    path: PathBuf,
    /// Whether `SEEC_TRACE_NAME` was set by the user: if so, the automatic
    /// rename-on-`notifyArgs` behaviour does not apply (spec §6).
    user_specified: bool,
    /// Destination to additionally write the instrumented module bitcode
    /// to, if `SEEC_WRITE_INSTRUMENTED` was set.
    pub write_instrumented: Option<PathBuf>,
}

impl TraceConfig {
    /// Reads the environment once. Infallible: a missing/unset variable
    /// simply selects the documented default.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::var(TRACE_NAME_VAR).ok(), std::env::var(WRITE_INSTRUMENTED_VAR).ok(), std::process::id())
    }

    fn from_vars(trace_name: Option<String>, write_instrumented: Option<String>, pid: u32) -> Self {
        let default_name = format!("{DEFAULT_TRACE_FILENAME_PREFIX}.{pid}.seec");
        let (path, user_specified) = match trace_name {
            Some(name) => {
                let candidate = Path::new(&name);
                if candidate.is_absolute() {
                    (candidate.to_path_buf(), true)
                } else {
                    // A bare filename overrides only the filename, keeping
                    // the working directory.
                    (PathBuf::from(&name), true)
                }
            }
            None => (PathBuf::from(default_name), false),
        };
        TraceConfig { path, user_specified, write_instrumented: write_instrumented.map(PathBuf::from) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn user_specified(&self) -> bool {
        self.user_specified
    }

    /// Renames the trace destination to `<argv0>.seec` on `notifyArgs`,
    /// unless the user already picked a name (spec §6). `argv0` is the
    /// traced program's own `argv[0]`.
    pub fn rename_for_argv0(&mut self, argv0: &str) {
        if self.user_specified {
            return;
        }
        let stem = Path::new(argv0).file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_else(|| argv0.to_string());
        self.path.set_file_name(format!("{stem}.seec"));
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig::from_vars(None, None, std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_uses_pid() {
        let cfg = TraceConfig::from_vars(None, None, 1234);
        assert_eq!(cfg.path(), Path::new("p.1234.seec"));
        assert!(!cfg.user_specified());
    }

    #[test]
    fn absolute_override_replaces_whole_path() {
        let cfg = TraceConfig::from_vars(Some("/tmp/custom.seec".to_string()), None, 1234);
        assert_eq!(cfg.path(), Path::new("/tmp/custom.seec"));
        assert!(cfg.user_specified());
    }

    #[test]
    fn bare_filename_override() {
        let cfg = TraceConfig::from_vars(Some("custom.seec".to_string()), None, 1234);
        assert_eq!(cfg.path(), Path::new("custom.seec"));
    }

    #[test]
    fn rename_on_argv0_only_without_user_override() {
        let mut cfg = TraceConfig::from_vars(None, None, 1234);
        cfg.rename_for_argv0("/usr/bin/myprog");
        assert_eq!(cfg.path(), Path::new("myprog.seec"));

        let mut user_cfg = TraceConfig::from_vars(Some("fixed.seec".to_string()), None, 1234);
        user_cfg.rename_for_argv0("/usr/bin/myprog");
        assert_eq!(user_cfg.path(), Path::new("fixed.seec"));
    }

    #[test]
    fn write_instrumented_is_optional() {
        assert!(TraceConfig::from_vars(None, None, 1).write_instrumented.is_none());
        let cfg = TraceConfig::from_vars(None, Some("out.bc".to_string()), 1);
        assert_eq!(cfg.write_instrumented, Some(PathBuf::from("out.bc")));
    }
}
