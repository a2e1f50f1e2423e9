use std::collections::HashMap;

use protocol::config::TargetClass;
use system_utils::ssh::SshTarget;

/// A remote host or application instance operations run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub id: String,
    pub class: TargetClass,
    pub desc: String,
    pub ssh: SshTarget,
}

impl TargetSpec {
    pub fn new(id: impl Into<String>, class: TargetClass, ssh: SshTarget) -> Self {
        Self {
            id: id.into(),
            class,
            desc: String::new(),
            ssh,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TargetDirectory {
    targets: HashMap<String, TargetSpec>,
    order: Vec<String>,
}

impl TargetDirectory {
    pub fn new(targets: Vec<TargetSpec>) -> Self {
        let mut directory = Self::default();
        for target in targets {
            if !directory.targets.contains_key(&target.id) {
                directory.order.push(target.id.clone());
            }
            directory.targets.insert(target.id.clone(), target);
        }
        directory
    }

    pub fn get(&self, id: &str) -> Option<&TargetSpec> {
        self.targets.get(id)
    }

    /// Targets in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &TargetSpec> {
        self.order.iter().filter_map(|id| self.targets.get(id))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
