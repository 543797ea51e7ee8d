use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Ordered, deduplicated list of directories probed for tool binaries.
///
/// Desktop launchers and IDE terminals often start the hub with a trimmed
/// `PATH`, so user-local and package-manager locations are prepended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new<I>(dirs: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut unique: Vec<PathBuf> = Vec::new();
        for dir in dirs {
            if dir.as_os_str().is_empty() || unique.contains(&dir) {
                continue;
            }
            unique.push(dir);
        }
        Self { dirs: unique }
    }

    pub fn from_env() -> Self {
        let cwd = env::current_dir().ok();
        Self::extended(dirs::home_dir().as_deref(), cwd.as_deref(), env::var_os("PATH"))
    }

    pub fn extended(home: Option<&Path>, cwd: Option<&Path>, inherited: Option<OsString>) -> Self {
        let mut dirs = Vec::new();
        if let Some(home) = home {
            dirs.push(home.join(".local").join("bin"));
            dirs.push(home.join("bin"));
        }
        for system in [
            "/usr/local/bin",
            "/opt/homebrew/bin",
            "/usr/bin",
            "/bin",
            "/usr/sbin",
            "/sbin",
        ] {
            dirs.push(PathBuf::from(system));
        }
        if let Some(cwd) = cwd {
            dirs.push(cwd.join("node_modules").join(".bin"));
        }
        if let Some(inherited) = inherited {
            dirs.extend(env::split_paths(&inherited));
        }
        Self::new(dirs)
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Value for a child's `PATH` variable.
    pub fn to_env_value(&self) -> OsString {
        env::join_paths(&self.dirs).unwrap_or_else(|_| {
            let joined: Vec<String> = self
                .dirs
                .iter()
                .map(|dir| dir.to_string_lossy().to_string())
                .collect();
            OsString::from(joined.join(":"))
        })
    }

    /// Locates the executable for `command`; only the first token is used so
    /// multi-token commands such as `codex exec` resolve to `codex`.
    pub fn find(&self, command: &str) -> Option<PathBuf> {
        let program = command.split_whitespace().next()?;
        if program.contains(std::path::MAIN_SEPARATOR) {
            let candidate = PathBuf::from(program);
            return is_executable(&candidate).then_some(candidate);
        }
        self.dirs
            .iter()
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }

    pub fn is_available(&self, command: &str) -> bool {
        self.find(command).is_some()
    }

    /// Absolute path of the executable, or the program token unchanged when
    /// it cannot be found.
    pub fn resolve_path(&self, command: &str) -> String {
        match self.find(command) {
            Some(path) => path.to_string_lossy().to_string(),
            None => command
                .split_whitespace()
                .next()
                .unwrap_or(command)
                .to_string(),
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn extended_path_keeps_order_and_drops_duplicates() {
        let inherited = env::join_paths(["/usr/bin", "/custom/bin"]).unwrap();
        let search = SearchPath::extended(
            Some(Path::new("/home/dev")),
            Some(Path::new("/work/app")),
            Some(inherited),
        );
        let dirs = search.dirs();
        assert_eq!(dirs[0], PathBuf::from("/home/dev/.local/bin"));
        assert_eq!(dirs[1], PathBuf::from("/home/dev/bin"));
        assert!(dirs.contains(&PathBuf::from("/work/app/node_modules/.bin")));
        assert_eq!(dirs.last(), Some(&PathBuf::from("/custom/bin")));
        assert_eq!(
            dirs.iter()
                .filter(|dir| dir.as_path() == Path::new("/usr/bin"))
                .count(),
            1
        );
    }

    #[test]
    fn missing_binary_is_reported_not_raised() {
        let dir = tempdir().unwrap();
        let search = SearchPath::new(vec![dir.path().to_path_buf()]);
        assert!(!search.is_available("definitely-not-a-tool"));
        assert_eq!(search.resolve_path("definitely-not-a-tool exec"), "definitely-not-a-tool");
    }

    #[cfg(unix)]
    #[test]
    fn finds_executables_by_first_token() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let bin = dir.path().join("codex");
        std::fs::write(&bin, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        let plain = dir.path().join("notes");
        std::fs::write(&plain, "text").unwrap();

        let search = SearchPath::new(vec![dir.path().to_path_buf()]);
        assert!(search.is_available("codex exec"));
        assert_eq!(search.resolve_path("codex"), bin.to_string_lossy());
        assert!(!search.is_available("notes"));
    }
}
