use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Watches the shader directory and records the names of changed files.
///
/// The notify thread only inserts into the dirty set. Recompilation happens on the
/// render thread in [`ShaderCache::reload_changed`].
///
/// [`ShaderCache::reload_changed`]: super::ShaderCache::reload_changed
pub struct ShaderWatcher {
    dirty: Arc<Mutex<HashSet<String>>>,
    // Dropping the watcher stops the notify thread.
    _watcher: RecommendedWatcher,
}

impl ShaderWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        let dirty = Arc::new(Mutex::new(HashSet::new()));

        let event_handler = {
            let dirty = dirty.clone();
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if event.need_rescan()
                        || event.kind.is_create()
                        || event.kind.is_modify()
                        || event.kind.is_remove()
                    {
                        let mut dirty = dirty.lock();
                        for path in &event.paths {
                            if let Some(name) = file_name(path) {
                                dirty.insert(name);
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("shader watcher error: {}", err);
                }
            }
        };

        let mut watcher = notify::recommended_watcher(event_handler)
            .map_err(|err| Error::Backend(format!("failed to create file watcher: {}", err)))?;
        watcher
            .watch(root, RecursiveMode::NonRecursive)
            .map_err(|err| {
                Error::Backend(format!("failed to watch {}: {}", root.display(), err))
            })?;

        tracing::info!("watching {} for shader changes", root.display());

        Ok(Self {
            dirty,
            _watcher: watcher,
        })
    }

    /// Marks `file` as changed.
    pub fn mark_dirty(&self, file: &str) {
        self.dirty.lock().insert(file.to_owned());
    }

    /// Returns and clears the file names that changed since the last call.
    pub fn take_changed(&self) -> Vec<String> {
        self.dirty.lock().drain().collect()
    }
}

impl std::fmt::Debug for ShaderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderWatcher")
            .field("dirty", &*self.dirty.lock())
            .finish_non_exhaustive()
    }
}

/// Returns the shader file name a path refers to: `model.wgsl` and `model.bin` both
/// map to `model`.
fn file_name(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    if ext != "wgsl" && ext != "bin" {
        return None;
    }

    path.file_stem()?.to_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::file_name;

    #[test]
    fn shader_file_names() {
        assert_eq!(file_name(Path::new("a/model.wgsl")).as_deref(), Some("model"));
        assert_eq!(file_name(Path::new("a/model.bin")).as_deref(), Some("model"));
        assert_eq!(file_name(Path::new("a/model.txt")), None);
        assert_eq!(file_name(Path::new("a/model")), None);
    }
}
