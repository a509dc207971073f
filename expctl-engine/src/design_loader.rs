//! Design Loader - File-based design loading from directories.
//!
//! Designs are `.json5` files named after the experiment they describe
//! (`ping.json5` is the design `ping`). Several directories are scanned in
//! priority order so a user design can shadow a system one of the same name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use expctl_shared::design_json::{NamedDesign, parse_design_file};

/// Default system design directory (installed via package)
pub const SYSTEM_DESIGN_DIR: &str = "/usr/share/expctl/designs";

/// Default user design directory, relative to the home directory
pub const USER_DESIGN_DIR: &str = ".config/expctl/designs";

/// Design loader that scans directories for .json5 design files.
#[derive(Debug, Clone)]
pub struct DesignLoader {
    /// Directories to scan, in priority order (later overrides earlier)
    directories: Vec<PathBuf>,
}

impl Default for DesignLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DesignLoader {
    /// Loader over the default directories, lowest priority first:
    /// 1. System: `/usr/share/expctl/designs`
    /// 2. User: `~/.config/expctl/designs`
    /// 3. Local: `./designs`
    pub fn new() -> Self {
        let mut directories = vec![PathBuf::from(SYSTEM_DESIGN_DIR)];
        if let Some(home) = dirs::home_dir() {
            directories.push(home.join(USER_DESIGN_DIR));
        }
        directories.push(PathBuf::from("./designs"));
        Self { directories }
    }

    /// Loader over `directories` only
    pub fn with_directories(directories: Vec<PathBuf>) -> Self {
        Self { directories }
    }

    /// Add directories with the highest priority
    pub fn add_directories(&mut self, dirs: impl IntoIterator<Item = PathBuf>) {
        self.directories.extend(dirs);
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Every design found, by name. Unreadable files are skipped with a
    /// warning.
    pub fn load_all(&self) -> BTreeMap<String, NamedDesign> {
        let mut designs = BTreeMap::new();

        for dir in &self.directories {
            if !dir.exists() {
                debug!("Design directory does not exist, skipping: {:?}", dir);
                continue;
            }

            match self.load_from_directory(dir) {
                Ok(loaded) => {
                    let count = loaded.len();
                    for (name, design) in loaded {
                        if designs.insert(name.clone(), design).is_some() {
                            debug!("Design '{}' from {:?} overrides previous definition", name, dir);
                        }
                    }
                    if count > 0 {
                        info!("Loaded {} designs from {:?}", count, dir);
                    }
                }
                Err(e) => warn!("Failed to load designs from {:?}: {}", dir, e),
            }
        }

        designs
    }

    fn load_from_directory(&self, dir: &Path) -> Result<Vec<(String, NamedDesign)>> {
        let mut designs = Vec::new();
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("Failed to read directory: {:?}", dir))?;

        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read directory entry in {:?}", dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json5") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            match load_design_file(&path) {
                Ok(design) => designs.push((name, design)),
                Err(e) => warn!("Failed to load design from {:?}: {:#}", path, e),
            }
        }

        Ok(designs)
    }

    /// Find a design by name
    pub fn get_design(&self, name: &str) -> Option<NamedDesign> {
        self.load_all().remove(name)
    }

    /// Resolve a `--design` argument: an existing file path is loaded
    /// directly, anything else is looked up by name
    pub fn resolve(&self, design: &str) -> Result<NamedDesign> {
        let path = Path::new(design);
        if path.is_file() {
            return load_design_file(path);
        }
        self.get_design(design).with_context(|| {
            format!(
                "Design '{}' is neither a file nor found in {:?}",
                design, self.directories
            )
        })
    }
}

/// Load a single design file
pub fn load_design_file(path: &Path) -> Result<NamedDesign> {
    debug!("Loading design from {:?}", path);
    parse_design_file(path).with_context(|| format!("Failed to parse design file: {:?}", path))
}
