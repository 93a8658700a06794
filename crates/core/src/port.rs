//! Port identity and the port arena
//!
//! Ports live in a flat arena (`Vec<Port>`), addressed by the `PortId`
//! newtype rather than by reference, so the dependency graph and the
//! scheduler's state registry can both hold cheap `Copy` handles instead of
//! fighting the borrow checker over a self-referential graph (§9).

use indexmap::IndexMap;
use std::fmt;

/// Opaque handle into the `PortRegistry` arena. Never constructed outside
/// this module; stable for the lifetime of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The six dependency kinds tracked per port, in phase-sequence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    Fetch,
    Extract,
    Patch,
    Build,
    Lib,
    Run,
}

/// A directed edge from a dependent port to a provider port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepEdge {
    pub provider: PortId,
    pub kind: DepKind,
}

/// Immutable metadata derived from a port directory by the metadata
/// extractor. Never mutated after dependency resolution.
#[derive(Debug, Clone)]
pub struct Port {
    pub portdir: String,
    pub category: String,
    pub name: String,
    pub flavor: Option<String>,
    pub version: String,
    pub pkgfile: String,
    pub dep_fetch: String,
    pub dep_extract: String,
    pub dep_patch: String,
    pub dep_build: String,
    pub dep_lib: String,
    pub dep_run: String,
}

impl Port {
    /// `category/name[@flavor]`
    pub fn canonical(&self) -> String {
        match &self.flavor {
            Some(f) => format!("{}@{}", self.portdir, f),
            None => self.portdir.clone(),
        }
    }
}

/// Terminal and transient state tracked per port, outside the immutable
/// `Port` struct, so the resolver's arena stays read-only once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    NoBuildIgnore,
}

impl PortStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PortStatus::Success
                | PortStatus::Failed
                | PortStatus::Skipped
                | PortStatus::NoBuildIgnore
        )
    }
}

/// Independent boolean flags plus the mutable run state for one port,
/// stored in a side table keyed by `PortId` (§3 Port flags).
#[derive(Debug, Clone)]
pub struct PortFlags {
    pub manually_selected: bool,
    pub meta: bool,
    pub dummy: bool,
    pub not_found: bool,
    pub corrupt: bool,
    pub ignored: Option<String>,
    pub no_build_ignore: bool,
    pub packaged_already: bool,
    pub pkg_manager_port: bool,
    pub status: PortStatus,
    pub last_phase: Option<String>,
    pub build_uuid: Option<uuid::Uuid>,
}

impl Default for PortFlags {
    fn default() -> Self {
        PortFlags {
            manually_selected: false,
            meta: false,
            dummy: false,
            not_found: false,
            corrupt: false,
            ignored: None,
            no_build_ignore: false,
            packaged_already: false,
            pkg_manager_port: false,
            status: PortStatus::Pending,
            last_phase: None,
            build_uuid: None,
        }
    }
}

/// Arena of all ports known to one run, plus the bidirectional edge sets
/// and the per-port flag side table.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: Vec<Port>,
    by_portdir: IndexMap<String, PortId>,
    depends_on: Vec<Vec<DepEdge>>,
    depended_on_by: Vec<Vec<DepEdge>>,
    flags: Vec<PortFlags>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a port, returning its existing id if `portdir` is already
    /// present (the resolver re-enqueues providers idempotently).
    pub fn insert(&mut self, port: Port) -> PortId {
        if let Some(&id) = self.by_portdir.get(&port.portdir) {
            return id;
        }
        let id = PortId(self.ports.len() as u32);
        self.by_portdir.insert(port.portdir.clone(), id);
        self.ports.push(port);
        self.depends_on.push(Vec::new());
        self.depended_on_by.push(Vec::new());
        self.flags.push(PortFlags::default());
        id
    }

    pub fn lookup(&self, portdir: &str) -> Option<PortId> {
        self.by_portdir.get(portdir).copied()
    }

    pub fn get(&self, id: PortId) -> &Port {
        &self.ports[id.0 as usize]
    }

    pub fn flags(&self, id: PortId) -> &PortFlags {
        &self.flags[id.0 as usize]
    }

    pub fn flags_mut(&mut self, id: PortId) -> &mut PortFlags {
        &mut self.flags[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PortId> + '_ {
        (0..self.ports.len()).map(|i| PortId(i as u32))
    }

    /// Adds a bidirectional edge `dependent -> provider` tagged with `kind`,
    /// updating both `IDependOn` and `DependsOnMe` sides (§3 Dep edge).
    pub fn add_edge(&mut self, dependent: PortId, provider: PortId, kind: DepKind) {
        self.depends_on[dependent.0 as usize].push(DepEdge { provider, kind });
        self.depended_on_by[provider.0 as usize].push(DepEdge {
            provider: dependent,
            kind,
        });
    }

    /// Outgoing edges: the ports this port depends on (`IDependOn`).
    pub fn depends_on(&self, id: PortId) -> &[DepEdge] {
        &self.depends_on[id.0 as usize]
    }

    /// Incoming edges: the ports that depend on this port (`DependsOnMe`).
    pub fn depended_on_by(&self, id: PortId) -> &[DepEdge] {
        &self.depended_on_by[id.0 as usize]
    }

    /// Package filenames of `id`'s direct dependencies that already built
    /// successfully this run, for `install-pkgs` (§4.6). A dependency whose
    /// package predates this run (CRC-fresh, skipped rather than rebuilt)
    /// still reports `Success`, so this also covers the cached-fresh case.
    pub fn successful_dependency_pkgfiles(&self, id: PortId) -> Vec<String> {
        self.depends_on(id)
            .iter()
            .filter(|edge| self.flags(edge.provider).status == PortStatus::Success)
            .map(|edge| self.get(edge.provider).pkgfile.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(portdir: &str) -> Port {
        Port {
            portdir: portdir.to_string(),
            category: portdir.split('/').next().unwrap().to_string(),
            name: portdir.split('/').nth(1).unwrap().to_string(),
            flavor: None,
            version: "1.0".to_string(),
            pkgfile: format!("{}-1.0.pkg", portdir.replace('/', "_")),
            dep_fetch: String::new(),
            dep_extract: String::new(),
            dep_patch: String::new(),
            dep_build: String::new(),
            dep_lib: String::new(),
            dep_run: String::new(),
        }
    }

    #[test]
    fn insert_is_idempotent_by_portdir() {
        let mut reg = PortRegistry::new();
        let a1 = reg.insert(port("lang/rust"));
        let a2 = reg.insert(port("lang/rust"));
        assert_eq!(a1, a2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn edges_are_bidirectional() {
        let mut reg = PortRegistry::new();
        let dependent = reg.insert(port("www/serde"));
        let provider = reg.insert(port("lang/rust"));
        reg.add_edge(dependent, provider, DepKind::Build);

        assert_eq!(reg.depends_on(dependent).len(), 1);
        assert_eq!(reg.depends_on(dependent)[0].provider, provider);
        assert_eq!(reg.depended_on_by(provider).len(), 1);
        assert_eq!(reg.depended_on_by(provider)[0].provider, dependent);
    }

    #[test]
    fn default_flags_are_pending_and_not_terminal() {
        let mut reg = PortRegistry::new();
        let id = reg.insert(port("lang/rust"));
        assert_eq!(reg.flags(id).status, PortStatus::Pending);
        assert!(!reg.flags(id).status.is_terminal());
    }

    #[test]
    fn successful_dependency_pkgfiles_excludes_unfinished_providers() {
        let mut reg = PortRegistry::new();
        let dependent = reg.insert(port("www/serde"));
        let built = reg.insert(port("lang/rust"));
        let pending = reg.insert(port("devel/pkgconf"));
        reg.add_edge(dependent, built, DepKind::Build);
        reg.add_edge(dependent, pending, DepKind::Build);
        reg.flags_mut(built).status = PortStatus::Success;

        let pkgfiles = reg.successful_dependency_pkgfiles(dependent);
        assert_eq!(pkgfiles, vec![reg.get(built).pkgfile.clone()]);
    }
}
