//! Resource catalog.
//!
//! A [`ResourceDescriptor`] captures everything the coordinator needs to know
//! about one tunable knob: where it lives, which values are legal, who may
//! touch it, at which scope it applies and which arbitration policy orders
//! competing writers. The registry is built once at startup and never
//! mutated afterwards, so lookups need no locking; only the captured-default
//! store behind it is interior-mutable.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::hooks::{default_hooks, resolve_path, DefaultStore, ResourceHooks};
use crate::target::TargetRegistry;

/// Scope at which a resource value applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyType {
    Core,
    Cluster,
    #[default]
    Global,
    CGroup,
}

/// Arbitration rule ordering concurrent writers of one resource slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// The latest request wins the slot outright.
    #[default]
    InstantApply,
    /// The numerically largest pending value owns the slot.
    HigherIsBetter,
    /// The numerically smallest pending value owns the slot.
    LowerIsBetter,
    /// First in, first honored; later requests wait their turn.
    LazyApply,
}

/// Access level required to tune a resource, and granted to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionClass {
    System,
    #[default]
    ThirdParty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueUnit {
    #[default]
    Plain,
    KiloHertz,
    MegaHertz,
    KiloBytes,
    MegaBytes,
    Percent,
}

/// Immutable description of one tunable knob.
#[derive(Clone)]
pub struct ResourceDescriptor {
    pub name: String,
    /// Unique 32-bit code, encoding type and id bits assigned by the config.
    pub code: u32,
    /// Path template relative to the sysfs root; `{}` stands for the
    /// physical sub-target id of non-global resources.
    pub path: String,
    pub low: i32,
    pub high: i32,
    pub permissions: PermissionClass,
    /// Bitmap of device modes (display on, doze, ...) under which the
    /// resource may be provisioned. Enforcement is left to the integrator.
    pub modes: u8,
    pub apply_type: ApplyType,
    pub policy: Policy,
    pub unit: ValueUnit,
    pub hooks: ResourceHooks,
}

impl std::fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("name", &self.name)
            .field("code", &format_args!("{:#010x}", self.code))
            .field("path", &self.path)
            .field("bounds", &(self.low, self.high))
            .field("apply_type", &self.apply_type)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`ResourceDescriptor`]. Unset fields fall back to the
/// defaults a generic global knob would use; hooks default to the sysfs
/// applier/tear pair for the chosen apply type.
pub struct ResourceBuilder {
    name: String,
    code: u32,
    path: String,
    low: i32,
    high: i32,
    permissions: PermissionClass,
    modes: u8,
    apply_type: ApplyType,
    policy: Policy,
    unit: ValueUnit,
    hooks: Option<ResourceHooks>,
}

impl ResourceBuilder {
    pub fn new(name: impl Into<String>, code: u32) -> Self {
        Self {
            name: name.into(),
            code,
            path: String::new(),
            low: i32::MIN,
            high: i32::MAX,
            permissions: PermissionClass::default(),
            modes: 0,
            apply_type: ApplyType::default(),
            policy: Policy::default(),
            unit: ValueUnit::default(),
            hooks: None,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn bounds(mut self, low: i32, high: i32) -> Self {
        self.low = low;
        self.high = high;
        self
    }

    pub fn permissions(mut self, permissions: PermissionClass) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn modes(mut self, modes: u8) -> Self {
        self.modes = modes;
        self
    }

    pub fn apply_type(mut self, apply_type: ApplyType) -> Self {
        self.apply_type = apply_type;
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn unit(mut self, unit: ValueUnit) -> Self {
        self.unit = unit;
        self
    }

    /// Replaces the default sysfs hooks with a custom capability record,
    /// e.g. one supplied by a business-unit extension.
    pub fn hooks(mut self, hooks: ResourceHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> Result<ResourceDescriptor> {
        if self.low > self.high {
            bail!(
                "resource {:#010x} has inverted bounds [{}, {}]",
                self.code,
                self.low,
                self.high
            );
        }
        let hooks = match self.hooks {
            Some(hooks) => hooks,
            None => {
                if self.path.is_empty() {
                    bail!(
                        "resource {:#010x} needs a path to use the default hooks",
                        self.code
                    );
                }
                default_hooks()
            }
        };
        Ok(ResourceDescriptor {
            name: self.name,
            code: self.code,
            path: self.path,
            low: self.low,
            high: self.high,
            permissions: self.permissions,
            modes: self.modes,
            apply_type: self.apply_type,
            policy: self.policy,
            unit: self.unit,
            hooks,
        })
    }
}

/// Catalog of every resource known to the daemon, frozen after init.
pub struct ResourceRegistry {
    table: Vec<ResourceDescriptor>,
    by_code: HashMap<u32, usize>,
    defaults: DefaultStore,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            table: Vec::new(),
            by_code: HashMap::new(),
            defaults: DefaultStore::new(),
        }
    }

    /// Adds a descriptor to the catalog. Codes must be unique.
    pub fn register(&mut self, descriptor: ResourceDescriptor) -> Result<()> {
        if self.by_code.contains_key(&descriptor.code) {
            bail!("duplicate resource code {:#010x}", descriptor.code);
        }
        self.by_code.insert(descriptor.code, self.table.len());
        self.table.push(descriptor);
        Ok(())
    }

    pub fn lookup(&self, code: u32) -> Option<&ResourceDescriptor> {
        self.table_index(code).map(|idx| &self.table[idx])
    }

    /// Dense slot index of a resource code inside the coordinator table.
    pub fn table_index(&self, code: u32) -> Option<usize> {
        self.by_code.get(&code).copied()
    }

    pub fn get(&self, index: usize) -> &ResourceDescriptor {
        &self.table[index]
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.table.iter()
    }

    /// Store of node contents captured at startup.
    pub fn defaults(&self) -> &DefaultStore {
        &self.defaults
    }

    /// Reads and caches the current content of every concrete node the
    /// registered resources can touch. Runs once at startup, before any
    /// request can write, so tear hooks restore the true boot-time values
    /// rather than whatever happened to be on a node at its first tune.
    pub fn capture_defaults(&self, sysfs_root: &Path, targets: &TargetRegistry) {
        for desc in self.iter() {
            if desc.path.is_empty() {
                continue;
            }
            for sub in targets.physical_targets(desc.apply_type) {
                let path = resolve_path(sysfs_root, &desc.path, sub);
                match std::fs::read_to_string(&path) {
                    Ok(current) => self.defaults.capture_once(&path, current),
                    Err(err) => {
                        warn!(
                            "Could not capture boot default of {}: {}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_dense_indices() {
        let mut registry = ResourceRegistry::new();
        for (i, code) in [0x0001_0000u32, 0x0001_0001, 0x0002_0000].iter().enumerate() {
            registry
                .register(
                    ResourceBuilder::new(format!("res{i}"), *code)
                        .path("sys/kernel/test")
                        .bounds(0, 100)
                        .build()
                        .unwrap(),
                )
                .unwrap();
            assert_eq!(registry.table_index(*code), Some(i));
        }
        assert_eq!(registry.len(), 3);
        assert!(registry.lookup(0xffff_ffff).is_none());
    }

    #[test]
    fn duplicate_codes_are_rejected() {
        let mut registry = ResourceRegistry::new();
        let build = || {
            ResourceBuilder::new("dup", 0x7)
                .path("sys/kernel/test")
                .build()
                .unwrap()
        };
        registry.register(build()).unwrap();
        assert!(registry.register(build()).is_err());
    }

    #[test]
    fn capture_defaults_snapshots_every_physical_node() {
        let root = tempfile::tempdir().unwrap();
        for cpu in 0..2 {
            let dir = root.path().join(format!("sys/devices/system/cpu/cpu{cpu}"));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("knob"), format!("{}", 100 + cpu)).unwrap();
        }

        let mut registry = ResourceRegistry::new();
        registry
            .register(
                ResourceBuilder::new("per-core-knob", 0x5)
                    .path("sys/devices/system/cpu/cpu{}/knob")
                    .bounds(0, 1000)
                    .apply_type(ApplyType::Core)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let targets = TargetRegistry::with_layout(vec![0, 1], vec![0], vec![]);
        registry.capture_defaults(root.path(), &targets);

        let node0 = root.path().join("sys/devices/system/cpu/cpu0/knob");
        let node1 = root.path().join("sys/devices/system/cpu/cpu1/knob");
        assert_eq!(registry.defaults().get(&node0).as_deref(), Some("100"));
        assert_eq!(registry.defaults().get(&node1).as_deref(), Some("101"));

        // Re-running never clobbers the first snapshot.
        std::fs::write(&node0, "999").unwrap();
        registry.capture_defaults(root.path(), &targets);
        assert_eq!(registry.defaults().get(&node0).as_deref(), Some("100"));
    }

    #[test]
    fn builder_rejects_inverted_bounds_and_missing_path() {
        assert!(ResourceBuilder::new("bad", 1)
            .path("p")
            .bounds(5, 1)
            .build()
            .is_err());
        assert!(ResourceBuilder::new("no-path", 2).build().is_err());
    }
}
