//! File ownership registry.
//!
//! Each worker has a base boundary (path globs it may mutate). While it holds
//! a task, the task's own boundary replaces the base one, and the task's
//! boundary is registered as an active claim. Two claims never overlap: the
//! orchestrator checks [`OwnershipRegistry::conflicting_claim`] before it
//! assigns, and [`OwnershipRegistry::claim`] refuses an overlapping claim.
//!
//! Overlap between glob patterns is decided conservatively: patterns overlap
//! if either matches the other's text, or if both contain wildcards and their
//! literal prefixes are prefix-related. False positives only serialize work.

use crate::error::{Result, TandemError};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

const GLOB_META: &[char] = &['*', '?', '[', '{'];

// ---------------------------------------------------------------------------
// Boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Boundary {
    patterns: Vec<String>,
    matchers: Vec<GlobMatcher>,
}

impl Boundary {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut normalized = Vec::with_capacity(patterns.len());
        let mut matchers = Vec::with_capacity(patterns.len());
        for p in patterns {
            let pattern = normalize(p.as_ref());
            let glob = GlobBuilder::new(&pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| TandemError::InvalidGlob {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
            matchers.push(glob.compile_matcher());
            normalized.push(pattern);
        }
        Ok(Self {
            patterns: normalized,
            matchers,
        })
    }

    /// A boundary that matches nothing (read-only roles).
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            matchers: Vec::new(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_read_only(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = normalize(path);
        self.matchers.iter().any(|m| m.is_match(&path))
    }

    pub fn overlaps(&self, other: &Boundary) -> bool {
        self.patterns.iter().zip(&self.matchers).any(|(a, ma)| {
            other
                .patterns
                .iter()
                .zip(&other.matchers)
                .any(|(b, mb)| patterns_overlap(a, ma, b, mb))
        })
    }
}

fn patterns_overlap(a: &str, ma: &GlobMatcher, b: &str, mb: &GlobMatcher) -> bool {
    if ma.is_match(b) || mb.is_match(a) {
        return true;
    }
    if !has_meta(a) || !has_meta(b) {
        return false;
    }
    let pa = literal_prefix(a);
    let pb = literal_prefix(b);
    pa.starts_with(pb) || pb.starts_with(pa)
}

fn has_meta(pattern: &str) -> bool {
    pattern.contains(GLOB_META)
}

fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(GLOB_META) {
        Some(i) => &pattern[..i],
        None => pattern,
    }
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.strip_prefix("./").unwrap_or(&path).to_string()
}

// ---------------------------------------------------------------------------
// Shared change requests
// ---------------------------------------------------------------------------

/// A worker's request to alter a path outside its own boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedChangeRequest {
    pub id: Uuid,
    pub worker_id: String,
    pub path: String,
    pub change: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SharedChangeDecision {
    Approved,
    /// Another active task owns the path; the change waits for it to finish.
    Deferred { held_by: String },
}

// ---------------------------------------------------------------------------
// OwnershipRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Claim {
    worker_id: String,
    boundary: Boundary,
}

#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    workers: BTreeMap<String, Boundary>,
    claims: BTreeMap<String, Claim>,
    queue: VecDeque<SharedChangeRequest>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_worker<S: AsRef<str>>(&mut self, worker_id: &str, patterns: &[S]) -> Result<()> {
        let boundary = Boundary::new(patterns)?;
        self.workers.insert(worker_id.to_string(), boundary);
        Ok(())
    }

    /// The boundary currently in force for `worker_id`: its active claim if
    /// it holds a task, otherwise its base boundary.
    pub fn boundary_of(&self, worker_id: &str) -> Option<&Boundary> {
        self.claims
            .values()
            .find(|c| c.worker_id == worker_id)
            .map(|c| &c.boundary)
            .or_else(|| self.workers.get(worker_id))
    }

    pub fn can_write(&self, worker_id: &str, path: &str) -> bool {
        self.boundary_of(worker_id)
            .is_some_and(|b| b.matches(path))
    }

    /// Verify every reported file lies inside the worker's boundary.
    pub fn check_report<S: AsRef<str>>(&self, worker_id: &str, files: &[S]) -> Result<()> {
        if !self.workers.contains_key(worker_id) {
            return Err(TandemError::WorkerNotFound(worker_id.to_string()));
        }
        match files.iter().find(|f| !self.can_write(worker_id, f.as_ref())) {
            Some(path) => Err(TandemError::OwnershipViolation {
                worker: worker_id.to_string(),
                path: path.as_ref().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Boundary a task would claim for `worker_id`: the task's own patterns,
    /// or the worker's base boundary when the task declares none.
    pub fn effective_boundary<S: AsRef<str>>(
        &self,
        worker_id: &str,
        task_patterns: &[S],
    ) -> Result<Boundary> {
        if task_patterns.is_empty() {
            return self
                .workers
                .get(worker_id)
                .cloned()
                .ok_or_else(|| TandemError::WorkerNotFound(worker_id.to_string()));
        }
        Boundary::new(task_patterns)
    }

    /// Id of an active task whose claim overlaps `boundary`, if any.
    pub fn conflicting_claim(&self, task_id: &str, boundary: &Boundary) -> Option<&str> {
        self.claims
            .iter()
            .find(|(id, c)| id.as_str() != task_id && c.boundary.overlaps(boundary))
            .map(|(id, _)| id.as_str())
    }

    pub fn claim<S: AsRef<str>>(
        &mut self,
        task_id: &str,
        worker_id: &str,
        task_patterns: &[S],
    ) -> Result<()> {
        let boundary = self.effective_boundary(worker_id, task_patterns)?;
        if let Some(active) = self.conflicting_claim(task_id, &boundary) {
            return Err(TandemError::OwnershipOverlap {
                task: task_id.to_string(),
                active: active.to_string(),
            });
        }
        self.claims.insert(
            task_id.to_string(),
            Claim {
                worker_id: worker_id.to_string(),
                boundary,
            },
        );
        Ok(())
    }

    /// Drop the claim for `task_id`. Returns the worker that held it.
    pub fn release(&mut self, task_id: &str) -> Option<String> {
        self.claims.remove(task_id).map(|c| c.worker_id)
    }

    // -----------------------------------------------------------------------
    // Shared changes
    // -----------------------------------------------------------------------

    /// Queue a change to a path outside the worker's boundary for review.
    /// Nothing is applied here.
    pub fn request_shared_change(
        &mut self,
        worker_id: &str,
        path: &str,
        change: impl Into<String>,
    ) -> Result<Uuid> {
        if !self.workers.contains_key(worker_id) {
            return Err(TandemError::WorkerNotFound(worker_id.to_string()));
        }
        let request = SharedChangeRequest {
            id: Uuid::new_v4(),
            worker_id: worker_id.to_string(),
            path: normalize(path),
            change: change.into(),
            requested_at: Utc::now(),
        };
        let id = request.id;
        self.queue.push_back(request);
        Ok(id)
    }

    /// Take every queued request in arrival order.
    pub fn drain_shared_changes(&mut self) -> Vec<SharedChangeRequest> {
        self.queue.drain(..).collect()
    }

    /// Put a deferred request back at the end of the queue.
    pub fn requeue(&mut self, request: SharedChangeRequest) {
        self.queue.push_back(request);
    }

    /// Approve unless the path is claimed by a task held by another worker.
    pub fn decide(&self, request: &SharedChangeRequest) -> SharedChangeDecision {
        let held_by = self.claims.iter().find(|(_, c)| {
            c.worker_id != request.worker_id && c.boundary.matches(&request.path)
        });
        match held_by {
            Some((task_id, _)) => SharedChangeDecision::Deferred {
                held_by: task_id.clone(),
            },
            None => SharedChangeDecision::Approved,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(patterns: &[&str]) -> Boundary {
        Boundary::new(patterns).unwrap()
    }

    #[test]
    fn boundary_matches_paths() {
        let b = boundary(&["src/auth/**", "./docs/auth.md"]);
        assert!(b.matches("src/auth/login.rs"));
        assert!(b.matches("src/auth/deep/nested.rs"));
        assert!(b.matches("docs/auth.md"));
        assert!(!b.matches("src/lib.rs"));
        assert!(!boundary(&["src/*.rs"]).matches("src/nested/lib.rs"));
    }

    #[test]
    fn invalid_glob_is_reported() {
        let err = Boundary::new(&["src/[oops"]).unwrap_err();
        assert!(matches!(err, TandemError::InvalidGlob { .. }));
    }

    #[test]
    fn overlap_detection() {
        assert!(boundary(&["src/**"]).overlaps(&boundary(&["src/auth/mod.rs"])));
        assert!(boundary(&["src/auth/**"]).overlaps(&boundary(&["src/**/*.rs"])));
        assert!(!boundary(&["tests/**"]).overlaps(&boundary(&["src/**"])));
        assert!(!boundary(&["src/a/**"]).overlaps(&boundary(&["src/b/**"])));
        assert!(!boundary(&["src/lib.rs"]).overlaps(&boundary(&["src/main.rs"])));
        assert!(!Boundary::empty().overlaps(&boundary(&["**"])));
    }

    #[test]
    fn can_write_uses_active_claim() {
        let mut reg = OwnershipRegistry::new();
        reg.register_worker("tester", &["tests/**"]).unwrap();
        assert!(reg.can_write("tester", "tests/auth_test.rs"));
        assert!(!reg.can_write("tester", "src/auth.rs"));
        assert!(!reg.can_write("ghost", "tests/auth_test.rs"));

        reg.claim("auth-red", "tester", &["tests/auth/**"]).unwrap();
        assert!(reg.can_write("tester", "tests/auth/login.rs"));
        assert!(!reg.can_write("tester", "tests/billing/charge.rs"));

        reg.release("auth-red");
        assert!(reg.can_write("tester", "tests/billing/charge.rs"));
    }

    #[test]
    fn overlapping_claims_are_refused() {
        let mut reg = OwnershipRegistry::new();
        reg.register_worker("a", &["src/**"]).unwrap();
        reg.register_worker("b", &["src/**"]).unwrap();
        reg.claim("t1", "a", &["src/auth/**"]).unwrap();
        let err = reg.claim("t2", "b", &["src/auth/session.rs"]).unwrap_err();
        assert!(matches!(err, TandemError::OwnershipOverlap { ref active, .. } if active == "t1"));
        reg.claim("t3", "b", &["src/billing/**"]).unwrap();
        assert_eq!(
            reg.conflicting_claim("t4", &boundary(&["src/billing/invoice.rs"])),
            Some("t3")
        );
        reg.release("t3");
        assert_eq!(
            reg.conflicting_claim("t4", &boundary(&["src/billing/invoice.rs"])),
            None
        );
    }

    #[test]
    fn read_only_claims_never_conflict() {
        let mut reg = OwnershipRegistry::new();
        reg.register_worker("reviewer", &[] as &[&str]).unwrap();
        reg.register_worker("dev", &["src/**"]).unwrap();
        reg.claim("review", "reviewer", &[] as &[&str]).unwrap();
        reg.claim("impl", "dev", &[] as &[&str]).unwrap();
        assert!(!reg.can_write("reviewer", "src/lib.rs"));
    }

    #[test]
    fn report_outside_boundary_is_a_violation() {
        let mut reg = OwnershipRegistry::new();
        reg.register_worker("dev", &["src/**"]).unwrap();
        reg.check_report("dev", &["src/lib.rs"]).unwrap();
        let err = reg
            .check_report("dev", &["src/lib.rs", "tests/lib_test.rs"])
            .unwrap_err();
        match err {
            TandemError::OwnershipViolation { worker, path } => {
                assert_eq!(worker, "dev");
                assert_eq!(path, "tests/lib_test.rs");
            }
            other => panic!("expected OwnershipViolation, got {other:?}"),
        }
    }

    #[test]
    fn shared_changes_queue_in_order() {
        let mut reg = OwnershipRegistry::new();
        reg.register_worker("dev", &["src/**"]).unwrap();
        reg.register_worker("tester", &["tests/**"]).unwrap();
        reg.claim("red", "tester", &["tests/**"]).unwrap();

        reg.request_shared_change("dev", "Cargo.toml", "add dev-dependency")
            .unwrap();
        reg.request_shared_change("dev", "tests/common/mod.rs", "export helper")
            .unwrap();
        assert!(reg.request_shared_change("ghost", "x", "y").is_err());
        let drained = reg.drain_shared_changes();
        assert_eq!(drained.len(), 2);
        assert!(reg.drain_shared_changes().is_empty());
        assert_eq!(drained[0].path, "Cargo.toml");
        assert_eq!(reg.decide(&drained[0]), SharedChangeDecision::Approved);
        assert_eq!(
            reg.decide(&drained[1]),
            SharedChangeDecision::Deferred {
                held_by: "red".to_string()
            }
        );
    }
}
