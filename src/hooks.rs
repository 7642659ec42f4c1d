//! Applier and tear hooks.
//!
//! The coordinator never writes sysfs itself; every write goes through the
//! capability record attached to the resource descriptor. The default pair
//! resolves the descriptor's path template, writes the requested value, and
//! on tear restores the node content the registry captured at startup.
//! Extensions may install custom records through the resource builder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use log::warn;

use crate::resource::ResourceDescriptor;

/// Everything a hook gets to see for one invocation.
pub struct HookContext<'a> {
    pub resource: &'a ResourceDescriptor,
    /// Physical core, cluster or cgroup id; 0 for global resources.
    pub sub_index: u32,
    /// Post-clamp value to write. Unused by tear hooks.
    pub value: i32,
    pub sysfs_root: &'a Path,
    pub defaults: &'a DefaultStore,
}

impl HookContext<'_> {
    /// Concrete filesystem path of the node this invocation targets.
    pub fn node_path(&self) -> PathBuf {
        resolve_path(self.sysfs_root, &self.resource.path, self.sub_index)
    }
}

pub type HookFn = Arc<dyn Fn(&HookContext) -> Result<()> + Send + Sync>;

/// Capability record stored in a resource descriptor: one applier, one tear.
#[derive(Clone)]
pub struct ResourceHooks {
    pub apply: HookFn,
    pub tear: HookFn,
}

impl std::fmt::Debug for ResourceHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResourceHooks { .. }")
    }
}

/// Node contents captured once at startup, before any request can write,
/// keyed by the resolved path. Tear hooks restore from here; the snapshot
/// survives the tear so every tune/untune cycle keeps restoring the
/// boot-time value.
pub struct DefaultStore {
    inner: RwLock<HashMap<PathBuf, String>>,
}

impl DefaultStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Records `value` for `path` unless a snapshot already exists.
    pub fn capture_once(&self, path: &Path, value: String) {
        let mut map = self.inner.write().unwrap();
        map.entry(path.to_path_buf()).or_insert(value);
    }

    pub fn get(&self, path: &Path) -> Option<String> {
        self.inner.read().unwrap().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

impl Default for DefaultStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn resolve_path(root: &Path, template: &str, sub_index: u32) -> PathBuf {
    let relative = if template.contains("{}") {
        template.replace("{}", &sub_index.to_string())
    } else {
        template.to_string()
    };
    root.join(relative.trim_start_matches('/'))
}

/// The stock sysfs applier/tear pair. Path resolution covers all four apply
/// types, so one record serves core, cluster, cgroup and global resources.
/// Defaults are captured by the registry at startup
/// ([`ResourceRegistry::capture_defaults`](crate::resource::ResourceRegistry::capture_defaults));
/// the tear hook restores them from the shared store.
pub fn default_hooks() -> ResourceHooks {
    let apply: HookFn = Arc::new(|ctx: &HookContext| {
        let path = ctx.node_path();
        std::fs::write(&path, ctx.value.to_string())
            .with_context(|| format!("Failed to write {} to {}", ctx.value, path.display()))
    });

    let tear: HookFn = Arc::new(|ctx: &HookContext| {
        let path = ctx.node_path();
        match ctx.defaults.get(&path) {
            Some(original) => std::fs::write(&path, original)
                .with_context(|| format!("Failed to restore {}", path.display())),
            None => {
                warn!("No captured default for {}, leaving node as-is", path.display());
                Ok(())
            }
        }
    });

    ResourceHooks { apply, tear }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceBuilder;

    #[test]
    fn path_template_substitution() {
        let root = Path::new("/");
        assert_eq!(
            resolve_path(root, "sys/devices/system/cpu/cpu{}/cpufreq/scaling_max_freq", 3),
            PathBuf::from("/sys/devices/system/cpu/cpu3/cpufreq/scaling_max_freq")
        );
        assert_eq!(
            resolve_path(Path::new("/tmp/fake"), "/proc/sys/kernel/sched_knob", 0),
            PathBuf::from("/tmp/fake/proc/sys/kernel/sched_knob")
        );
    }

    #[test]
    fn default_hooks_write_and_restore_boot_value() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("sys/kernel");
        std::fs::create_dir_all(&dir).unwrap();
        let node = dir.join("knob");
        std::fs::write(&node, "200").unwrap();

        let desc = ResourceBuilder::new("knob", 0x1)
            .path("sys/kernel/knob")
            .bounds(0, 1000)
            .build()
            .unwrap();
        let defaults = DefaultStore::new();
        // Startup capture, as the registry does it before any writer runs.
        defaults.capture_once(&node, std::fs::read_to_string(&node).unwrap());

        let mut ctx = HookContext {
            resource: &desc,
            sub_index: 0,
            value: 700,
            sysfs_root: root.path(),
            defaults: &defaults,
        };
        (desc.hooks.apply)(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "700");

        ctx.value = 900;
        (desc.hooks.apply)(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "900");

        (desc.hooks.tear)(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "200");
    }

    #[test]
    fn boot_default_survives_intervening_writes() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("sys/kernel");
        std::fs::create_dir_all(&dir).unwrap();
        let node = dir.join("knob");
        std::fs::write(&node, "200").unwrap();

        let desc = ResourceBuilder::new("knob", 0x1)
            .path("sys/kernel/knob")
            .bounds(0, 1000)
            .build()
            .unwrap();
        let defaults = DefaultStore::new();
        defaults.capture_once(&node, std::fs::read_to_string(&node).unwrap());

        // Something else touches the node between startup and the first
        // tune; the tear must still restore the boot-time value.
        std::fs::write(&node, "555").unwrap();

        let ctx = HookContext {
            resource: &desc,
            sub_index: 0,
            value: 700,
            sysfs_root: root.path(),
            defaults: &defaults,
        };
        (desc.hooks.apply)(&ctx).unwrap();
        (desc.hooks.tear)(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&node).unwrap(), "200");
    }

    #[test]
    fn tear_without_snapshot_is_harmless() {
        let root = tempfile::tempdir().unwrap();
        let desc = ResourceBuilder::new("ghost", 0x2)
            .path("sys/kernel/missing")
            .build()
            .unwrap();
        let defaults = DefaultStore::new();
        let ctx = HookContext {
            resource: &desc,
            sub_index: 0,
            value: 0,
            sysfs_root: root.path(),
            defaults: &defaults,
        };
        assert!((desc.hooks.tear)(&ctx).is_ok());
    }
}
