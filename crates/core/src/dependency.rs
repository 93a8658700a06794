//! Dependency string parsing and topological resolution
//!
//! Turns the six raw dependency strings on each `Port` into a bidirectional
//! edge graph over the `PortRegistry` arena (§4.4), then computes `depi_depth`
//! and a deterministic topological order via Kahn's algorithm.

use crate::errors::{BuildError, Result};
use crate::port::{DepKind, PortId, PortRegistry};
use indexmap::{IndexMap, IndexSet};
use tracing::{debug, instrument, warn};

/// One dependency token, resolved to `category/name[@flavor]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepToken {
    pub portdir: String,
}

/// Parses one dependency string into its provider tokens.
///
/// Tokens are space-delimited; each is split on `:`, the right-hand side is
/// stripped of a leading ports-root prefix and any trailing `:tag`, then
/// parsed as `category/name[@flavor]`. Tokens whose right-hand side starts
/// with `/nonexistent:` are dropped (§4.4 phase 1).
pub fn parse_dep_string(dep_string: &str, ports_root: &str) -> Vec<DepToken> {
    let mut out = Vec::new();
    for token in dep_string.split_whitespace() {
        let Some((_lhs, rhs)) = token.split_once(':') else {
            continue;
        };
        if rhs.starts_with("/nonexistent:") || rhs == "/nonexistent" {
            continue;
        }

        // Strip ports-root prefix, then a trailing ":tag" if any remained
        // embedded in rhs from a second colon.
        let stripped = rhs.strip_prefix(ports_root).unwrap_or(rhs);
        let stripped = stripped.trim_start_matches('/');
        let portdir = stripped.split(':').next().unwrap_or(stripped);
        if portdir.is_empty() {
            continue;
        }
        out.push(DepToken {
            portdir: portdir.to_string(),
        });
    }
    out
}

/// All six dependency kinds in the fixed order they appear on a `Port`.
fn dep_kinds_and_strings(port: &crate::port::Port) -> [(DepKind, &str); 6] {
    [
        (DepKind::Fetch, port.dep_fetch.as_str()),
        (DepKind::Extract, port.dep_extract.as_str()),
        (DepKind::Patch, port.dep_patch.as_str()),
        (DepKind::Build, port.dep_build.as_str()),
        (DepKind::Lib, port.dep_lib.as_str()),
        (DepKind::Run, port.dep_run.as_str()),
    ]
}

/// Links every dependency string on every port already in `registry` into
/// bidirectional edges. A referenced provider that is not present in the
/// registry is logged and its edge omitted (§4.4 phase 2) — callers
/// resolving a full set are expected to have already inserted every
/// transitively reachable port before calling this.
#[instrument(skip(registry))]
pub fn link_edges(registry: &mut PortRegistry, ports_root: &str) {
    let ids: Vec<PortId> = registry.ids().collect();
    for id in ids {
        let port = registry.get(id).clone();
        for (kind, dep_string) in dep_kinds_and_strings(&port) {
            for token in parse_dep_string(dep_string, ports_root) {
                match registry.lookup(&token.portdir) {
                    Some(provider) => registry.add_edge(id, provider, kind),
                    None => warn!(
                        dependent = %port.portdir,
                        provider = %token.portdir,
                        "dependency provider not found in registry, edge omitted"
                    ),
                }
            }
        }
    }
}

/// Computes `depi_depth` for every port via memoised reverse DFS:
/// `depth(p) = 1 + max(depth(q) for q in DependsOnMe(p))`, 1 for leaves.
pub fn compute_depths(registry: &PortRegistry) -> IndexMap<PortId, u32> {
    let mut depths = IndexMap::new();
    for id in registry.ids() {
        depth_of(registry, id, &mut depths, &mut IndexSet::new());
    }
    depths
}

fn depth_of(
    registry: &PortRegistry,
    id: PortId,
    memo: &mut IndexMap<PortId, u32>,
    in_progress: &mut IndexSet<PortId>,
) -> u32 {
    if let Some(&d) = memo.get(&id) {
        return d;
    }
    // A cycle here just bottoms out at depth 1 for the back-edge; the
    // strict topo sort below is what actually reports cycles.
    if !in_progress.insert(id) {
        return 1;
    }

    let mut max_child = 0u32;
    for edge in registry.depended_on_by(id) {
        max_child = max_child.max(depth_of(registry, edge.provider, memo, in_progress));
    }
    in_progress.shift_remove(&id);

    let depth = 1 + max_child;
    memo.insert(id, depth);
    depth
}

/// Whether `resolve_order` fails on a cycle (`Strict`) or returns the
/// partial order plus a logged warning (`Permissive`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoMode {
    Strict,
    Permissive,
}

/// Kahn's algorithm over `IDependOn`, with ties within the same in-degree
/// class broken by higher `depi_depth` first, then lexicographic `portdir`
/// (§4.4). The ready set is kept in an `IndexMap` so iteration order is
/// reproducible before the tie-break sort.
#[instrument(skip(registry, depths))]
pub fn topo_order(
    registry: &PortRegistry,
    depths: &IndexMap<PortId, u32>,
    mode: TopoMode,
) -> Result<Vec<PortId>> {
    let mut in_degree: IndexMap<PortId, u32> = IndexMap::new();
    for id in registry.ids() {
        in_degree.insert(id, registry.depends_on(id).len() as u32);
    }

    let mut ready: IndexMap<PortId, ()> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| (id, ()))
        .collect();

    let mut order = Vec::with_capacity(registry.len());

    while !ready.is_empty() {
        let mut batch: Vec<PortId> = ready.keys().copied().collect();
        batch.sort_by(|a, b| {
            let da = depths.get(a).copied().unwrap_or(1);
            let db = depths.get(b).copied().unwrap_or(1);
            db.cmp(&da)
                .then_with(|| registry.get(*a).portdir.cmp(&registry.get(*b).portdir))
        });
        ready.clear();

        for id in batch {
            order.push(id);
            for edge in registry.depended_on_by(id) {
                let dependent = edge.provider;
                if let Some(deg) = in_degree.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent, ());
                    }
                }
            }
        }
    }

    if order.len() < registry.len() {
        let emitted: IndexSet<PortId> = order.iter().copied().collect();
        let missing: Vec<String> = registry
            .ids()
            .filter(|id| !emitted.contains(id))
            .map(|id| registry.get(id).portdir.clone())
            .collect();

        match mode {
            TopoMode::Strict => {
                return Err(BuildError::DependencyCycle { portdirs: missing });
            }
            TopoMode::Permissive => {
                warn!(?missing, "dependency cycle detected, returning partial order");
            }
        }
    }

    debug!(count = order.len(), "topological order computed");
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;

    fn port(portdir: &str, build_dep: &str) -> Port {
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
            dep_build: build_dep.to_string(),
            dep_lib: String::new(),
            dep_run: String::new(),
        }
    }

    #[test]
    fn parses_simple_dep_token() {
        let tokens = parse_dep_string("pkg-config>=0:devel/pkgconf", "/xports");
        assert_eq!(tokens, vec![DepToken { portdir: "devel/pkgconf".to_string() }]);
    }

    #[test]
    fn strips_ports_root_prefix() {
        let tokens = parse_dep_string("x>0:/xports/devel/pkgconf", "/xports");
        assert_eq!(tokens[0].portdir, "devel/pkgconf");
    }

    #[test]
    fn drops_nonexistent_tokens() {
        let tokens = parse_dep_string("x>0:/nonexistent:devel/pkgconf", "/xports");
        assert!(tokens.is_empty());
    }

    #[test]
    fn multiple_tokens_in_one_string() {
        let tokens = parse_dep_string(
            "a>0:devel/pkgconf b>0:devel/cmake",
            "/xports",
        );
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn topo_order_respects_dependencies_and_is_deterministic() {
        let mut reg = PortRegistry::new();
        reg.insert(port("devel/pkgconf", ""));
        reg.insert(port("devel/cmake", "x>0:devel/pkgconf"));
        reg.insert(port("www/app", "x>0:devel/cmake x>0:devel/pkgconf"));

        link_edges(&mut reg, "/xports");
        let depths = compute_depths(&reg);
        let order = topo_order(&reg, &depths, TopoMode::Strict).unwrap();

        let pos = |portdir: &str| {
            order
                .iter()
                .position(|&id| reg.get(id).portdir == portdir)
                .unwrap()
        };
        assert!(pos("devel/pkgconf") < pos("devel/cmake"));
        assert!(pos("devel/cmake") < pos("www/app"));
    }

    #[test]
    fn strict_mode_reports_cycle() {
        let mut reg = PortRegistry::new();
        let a = reg.insert(port("a/a", ""));
        let b = reg.insert(port("b/b", ""));
        reg.add_edge(a, b, DepKind::Build);
        reg.add_edge(b, a, DepKind::Build);

        let depths = compute_depths(&reg);
        let err = topo_order(&reg, &depths, TopoMode::Strict).unwrap_err();
        assert!(matches!(err, BuildError::DependencyCycle { .. }));
    }

    #[test]
    fn permissive_mode_returns_partial_order_on_cycle() {
        let mut reg = PortRegistry::new();
        let a = reg.insert(port("a/a", ""));
        let b = reg.insert(port("b/b", ""));
        reg.add_edge(a, b, DepKind::Build);
        reg.add_edge(b, a, DepKind::Build);

        let depths = compute_depths(&reg);
        let order = topo_order(&reg, &depths, TopoMode::Permissive).unwrap();
        assert!(order.len() < reg.len());
    }

    #[test]
    fn leaf_depth_is_one() {
        let mut reg = PortRegistry::new();
        reg.insert(port("devel/pkgconf", ""));
        link_edges(&mut reg, "/xports");
        let depths = compute_depths(&reg);
        assert_eq!(*depths.values().next().unwrap(), 1);
    }
}
