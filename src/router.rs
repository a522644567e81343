//! # Router
//!
//! Maps `(method, path)` to a [`Route`] and extracts path parameters.
//! Patterns are `/`-separated segments; a segment starting with `:` binds a
//! named parameter, everything else is a literal. Matching requires equal
//! segment counts and positional agreement.
//!
//! When several patterns match, precedence is deterministic:
//! 1. more literal segments wins,
//! 2. then fewer parameter segments,
//! 3. then earlier registration.
//!
//! Duplicate `(method, pattern)` registrations are rejected;
//! conflicting-prefix patterns are accepted and resolved by precedence.

use std::fmt;
use std::sync::Arc;

use crate::request::Method;
use crate::step::StepDescriptor;

/// Registration-time router errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("duplicate route {method} {pattern}")]
    DuplicateRoute { method: Method, pattern: String },
}

/// One pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    /// Compile a pattern; the zero-segment pattern matches exactly `/`
    pub fn parse(pattern: &str) -> Result<Self, RouterError> {
        let invalid = |reason: &str| RouterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let mut segments = Vec::new();
        let mut param_names: Vec<&str> = Vec::new();
        for part in pattern.split('/').skip(1) {
            if part.is_empty() {
                if pattern == "/" {
                    break;
                }
                return Err(invalid("empty segment"));
            }
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(invalid("empty parameter name"));
                }
                if param_names.contains(&name) {
                    return Err(invalid("duplicate parameter name"));
                }
                param_names.push(name);
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    pub fn param_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(_)))
            .count()
    }

    /// Match a path, binding parameters positionally
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = if path == "/" {
            Vec::new()
        } else {
            path.strip_prefix('/')?.split('/').collect()
        };
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Param(name) => params.push((name.clone(), part.to_string())),
            }
        }
        Some(params)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Optional per-route resource budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteBudget {
    pub cpu_ms: Option<u64>,
    pub memory_bytes: Option<usize>,
    pub max_concurrent_effects: Option<usize>,
}

/// A continuation target plus its exclusivity group.
///
/// Continuations sharing a group name are mutually exclusive alternatives:
/// the issuing step's `Need::resume` picks exactly one of them at run time,
/// so members of one group may declare writes to the same slot without
/// tripping the duplicate-writer check.
#[derive(Clone)]
pub struct Continuation {
    pub step: Arc<StepDescriptor>,
    pub group: Option<String>,
}

/// A pipeline bound to a method and pattern
#[derive(Clone)]
pub struct Route {
    pub method: Method,
    pub pattern: String,
    /// Route-scoped steps run before `steps`
    pub before: Vec<Arc<StepDescriptor>>,
    pub steps: Vec<Arc<StepDescriptor>>,
    /// Steps reachable only as continuations of a need
    pub continuations: Vec<Continuation>,
    pub budget: Option<RouteBudget>,
}

impl Route {
    pub fn new(method: Method, pattern: impl Into<String>) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            before: Vec::new(),
            steps: Vec::new(),
            continuations: Vec::new(),
            budget: None,
        }
    }

    pub fn before(mut self, desc: StepDescriptor) -> Self {
        self.before.push(Arc::new(desc));
        self
    }

    pub fn step(mut self, desc: StepDescriptor) -> Self {
        self.steps.push(Arc::new(desc));
        self
    }

    /// Register a continuation target referenced by `Need::resume`
    pub fn continuation(mut self, desc: StepDescriptor) -> Self {
        self.continuations.push(Continuation {
            step: Arc::new(desc),
            group: None,
        });
        self
    }

    /// Register a continuation as one of a set of mutually exclusive
    /// alternatives; at most one member of a group runs per need
    pub fn exclusive_continuation(
        mut self,
        group: impl Into<String>,
        desc: StepDescriptor,
    ) -> Self {
        self.continuations.push(Continuation {
            step: Arc::new(desc),
            group: Some(group.into()),
        });
        self
    }

    pub fn budget(mut self, budget: RouteBudget) -> Self {
        self.budget = Some(budget);
        self
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("before", &self.before.len())
            .field("steps", &self.steps.len())
            .field("continuations", &self.continuations.len())
            .finish()
    }
}

struct CompiledRoute {
    route: Arc<Route>,
    pattern: RoutePattern,
    index: usize,
}

/// A successful lookup
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: Vec<(String, String)>,
}

/// Process-scoped route table
#[derive(Default)]
pub struct Router {
    routes: Vec<CompiledRoute>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: Route) -> Result<(), RouterError> {
        let pattern = RoutePattern::parse(&route.pattern)?;
        if self
            .routes
            .iter()
            .any(|r| r.route.method == route.method && r.pattern.raw() == pattern.raw())
        {
            return Err(RouterError::DuplicateRoute {
                method: route.method,
                pattern: route.pattern.clone(),
            });
        }
        let index = self.routes.len();
        self.routes.push(CompiledRoute {
            route: Arc::new(route),
            pattern,
            index,
        });
        Ok(())
    }

    /// Find the winning route for `(method, path)`, or `None` for a miss
    pub fn route(&self, method: Method, path: &str) -> Option<RouteMatch> {
        let mut best: Option<(&CompiledRoute, Vec<(String, String)>)> = None;
        for candidate in &self.routes {
            if candidate.route.method != method {
                continue;
            }
            let Some(params) = candidate.pattern.matches(path) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    let a = (
                        std::cmp::Reverse(candidate.pattern.literal_count()),
                        candidate.pattern.param_count(),
                        candidate.index,
                    );
                    let b = (
                        std::cmp::Reverse(current.pattern.literal_count()),
                        current.pattern.param_count(),
                        current.index,
                    );
                    a < b
                }
            };
            if better {
                best = Some((candidate, params));
            }
        }
        best.map(|(compiled, params)| RouteMatch {
            route: compiled.route.clone(),
            params,
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
