//! Finding the builds a build triggered, so their causes can be shown
//! alongside its own.
//!
//! Two finders are provided: [`FlowGraphFinder`] reads a recorded job
//! invocation graph; [`UpstreamLinkFinder`] walks the build store for builds
//! whose upstream cause points back at the root.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::Result;
use crate::model::{BuildRef, BuildStore};

pub trait DownstreamBuildFinder: Send + Sync {
    fn downstream_builds(&self, build: &BuildRef) -> Result<Vec<BuildRef>>;
}

/// One vertex of an invocation graph.  `Err` holds the reason the
/// invocation never produced a build.
pub type Invocation = std::result::Result<BuildRef, String>;

/// Downstream builds from invocation graphs recorded per flow build.
#[derive(Default)]
pub struct FlowGraphFinder {
    graphs: RwLock<HashMap<BuildRef, Vec<Invocation>>>,
}

impl FlowGraphFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the invocation graph of `root`.  The graph may or may not
    /// contain `root` itself, at any position.
    pub fn record(&self, root: BuildRef, vertices: Vec<Invocation>) {
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(root, vertices);
    }
}

impl DownstreamBuildFinder for FlowGraphFinder {
    fn downstream_builds(&self, build: &BuildRef) -> Result<Vec<BuildRef>> {
        let graphs = self.graphs.read().unwrap_or_else(|e| e.into_inner());
        let Some(vertices) = graphs.get(build) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(vertices.len());
        for v in vertices {
            match v {
                Ok(b) if b == build => {}
                Ok(b) => out.push(b.clone()),
                Err(reason) => debug!(root = %build, reason = %reason, "skipping unresolved invocation"),
            }
        }
        Ok(out)
    }
}

/// Downstream builds are those whose recorded upstream cause is the root.
pub struct UpstreamLinkFinder {
    builds: Arc<dyn BuildStore>,
}

impl UpstreamLinkFinder {
    pub fn new(builds: Arc<dyn BuildStore>) -> Self {
        Self { builds }
    }
}

impl DownstreamBuildFinder for UpstreamLinkFinder {
    fn downstream_builds(&self, build: &BuildRef) -> Result<Vec<BuildRef>> {
        let mut out = Vec::new();
        for candidate in self.builds.builds()? {
            let info = self.builds.info(&candidate)?;
            if let Some(up) = info.upstream {
                if up.project == build.project && up.build == build.number {
                    out.push(candidate);
                }
            }
        }
        Ok(out)
    }
}

/// Union of every finder's answer, first occurrence wins.
pub fn all_downstream(finders: &[Box<dyn DownstreamBuildFinder>], build: &BuildRef) -> Result<Vec<BuildRef>> {
    let mut out: Vec<BuildRef> = Vec::new();
    for f in finders {
        for b in f.downstream_builds(build)? {
            if !out.contains(&b) {
                out.push(b);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildInfo, BuildResult, InMemoryBuildStore, UpstreamCause};

    fn b(p: &str, n: u64) -> BuildRef {
        BuildRef::new(p, n)
    }

    #[test]
    fn root_excluded_by_identity_not_position() {
        let f = FlowGraphFinder::new();
        // Root is not first: the first genuine downstream build must stay.
        f.record(b("flow", 1), vec![Ok(b("compile", 4)), Ok(b("flow", 1)), Ok(b("test", 9))]);
        assert_eq!(f.downstream_builds(&b("flow", 1)).unwrap(), vec![b("compile", 4), b("test", 9)]);
    }

    #[test]
    fn graph_without_root_keeps_everything() {
        let f = FlowGraphFinder::new();
        f.record(b("flow", 1), vec![Ok(b("compile", 4)), Ok(b("test", 9))]);
        assert_eq!(f.downstream_builds(&b("flow", 1)).unwrap().len(), 2);
    }

    #[test]
    fn unresolved_invocations_skipped() {
        let f = FlowGraphFinder::new();
        f.record(b("flow", 1), vec![Ok(b("flow", 1)), Err("cancelled".into()), Ok(b("deploy", 2))]);
        assert_eq!(f.downstream_builds(&b("flow", 1)).unwrap(), vec![b("deploy", 2)]);
        assert!(f.downstream_builds(&b("other", 1)).unwrap().is_empty());
    }

    #[test]
    fn upstream_links_and_union() {
        let store = Arc::new(InMemoryBuildStore::new());
        store.insert(BuildInfo::new(b("root", 3), BuildResult::Failure), vec![]);
        let mut child = BuildInfo::new(b("child", 1), BuildResult::Failure);
        child.upstream = Some(UpstreamCause {
            project: "root".into(),
            build: 3,
        });
        store.insert(child, vec![]);
        store.insert(BuildInfo::new(b("unrelated", 1), BuildResult::Failure), vec![]);

        let flow = FlowGraphFinder::new();
        flow.record(b("root", 3), vec![Ok(b("child", 1)), Ok(b("extra", 2))]);
        let finders: Vec<Box<dyn DownstreamBuildFinder>> =
            vec![Box::new(UpstreamLinkFinder::new(store)), Box::new(flow)];
        assert_eq!(all_downstream(&finders, &b("root", 3)).unwrap(), vec![b("child", 1), b("extra", 2)]);
    }
}
