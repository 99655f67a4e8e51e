// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Route table mapping (method, path) pairs to handlers.
//!
//! A route pattern is a `/`-separated template made of literal segments and
//! at most one wildcard segment written `{name}`. A wildcard matches exactly
//! one non-empty path component; literals match case-sensitively.
//!
//! Patterns are checked for ambiguity as they are registered. Two patterns
//! with the same number of segments *overlap* if some concrete path matches
//! both of them. Overlap is tolerated only when one of the two is made
//! entirely of literals: the literal route is then strictly more specific
//! and always wins. Any other overlap (the same literal path twice, or two
//! wildcard patterns that can match one path) is rejected, so resolution
//! never has to guess.

use std::collections::HashMap;
use std::fmt;

use http::Method;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error(
        "route {method} {pattern} is ambiguous with already registered \
        route {method} {existing}"
    )]
    Ambiguous { method: Method, pattern: String, existing: String },

    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard(String),
}

/// A parsed route template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        let invalid = |reason| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let rest = pattern
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;
        if rest.is_empty() {
            return Ok(Self {
                raw: pattern.to_string(),
                segments: vec![Segment::Literal(String::new())],
            });
        }

        let mut segments = Vec::new();
        let mut wildcards = 0;
        for seg in rest.split('/') {
            if seg.is_empty() {
                return Err(invalid("empty path segment"));
            }
            match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    if name.is_empty() || name.contains(['{', '}']) {
                        return Err(invalid("malformed wildcard segment"));
                    }
                    wildcards += 1;
                    segments.push(Segment::Wildcard(name.to_string()));
                }
                None if seg.contains(['{', '}']) => {
                    return Err(invalid("braces in a literal segment"));
                }
                None => segments.push(Segment::Literal(seg.to_string())),
            }
        }
        if wildcards > 1 {
            return Err(invalid("more than one wildcard segment"));
        }

        Ok(Self { raw: pattern.to_string(), segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Name of the wildcard segment, if the pattern has one.
    pub fn wildcard(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::Wildcard(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn is_literal(&self) -> bool {
        self.wildcard().is_none()
    }

    /// Matches `path`, returning the captured wildcard value (if any).
    ///
    /// `Some(None)` is a match of a literal-only pattern.
    fn matches<'p>(&self, path: &'p str) -> Option<Option<&'p str>> {
        let rest = path.strip_prefix('/')?;
        let mut captured = None;
        let mut components = rest.split('/');
        for seg in &self.segments {
            let component = components.next()?;
            match seg {
                Segment::Literal(lit) if lit == component => {}
                Segment::Literal(_) => return None,
                Segment::Wildcard(_) if component.is_empty() => return None,
                Segment::Wildcard(_) => captured = Some(component),
            }
        }
        if components.next().is_some() {
            return None;
        }
        Some(captured)
    }

    /// Returns true if some concrete path matches both patterns.
    fn overlaps(&self, other: &RoutePattern) -> bool {
        self.segments.len() == other.segments.len()
            && self.segments.iter().zip(&other.segments).all(|pair| {
                match pair {
                    (Segment::Literal(a), Segment::Literal(b)) => a == b,
                    // A wildcard never matches an empty component.
                    (Segment::Wildcard(_), Segment::Literal(l))
                    | (Segment::Literal(l), Segment::Wildcard(_)) => {
                        !l.is_empty()
                    }
                    (Segment::Wildcard(_), Segment::Wildcard(_)) => true,
                }
            })
    }

    /// Returns true if registering both patterns would leave some path
    /// without a single most-specific match.
    fn conflicts_with(&self, other: &RoutePattern) -> bool {
        self.overlaps(other) && self.is_literal() == other.is_literal()
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}

struct Route<H> {
    pattern: RoutePattern,
    handler: H,
}

/// The outcome of a successful [`RouteTable::resolve`].
#[derive(Debug)]
pub struct Resolved<'t, 'p, H> {
    pub handler: &'t H,
    pub pattern: &'t RoutePattern,
    /// The path component bound to the pattern's wildcard segment.
    pub captured: Option<&'p str>,
}

/// An ordered set of (method, pattern) to handler bindings.
///
/// The table is filled in during startup and then handed, immutably, to the
/// request dispatcher.
pub struct RouteTable<H> {
    routes: HashMap<Method, Vec<Route<H>>>,
}

impl<H> Default for RouteTable<H> {
    fn default() -> Self {
        Self { routes: HashMap::new() }
    }
}

impl<H> RouteTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `method` and `pattern`.
    ///
    /// Fails if the pattern is malformed or is ambiguous with a pattern
    /// already registered for the same method.
    pub fn register(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
    ) -> Result<(), RouteError> {
        let pattern = RoutePattern::parse(pattern)?;
        let routes = self.routes.entry(method.clone()).or_default();
        if let Some(existing) =
            routes.iter().find(|r| r.pattern.conflicts_with(&pattern))
        {
            return Err(RouteError::Ambiguous {
                method,
                pattern: pattern.raw,
                existing: existing.pattern.raw.clone(),
            });
        }
        routes.push(Route { pattern, handler });
        Ok(())
    }

    /// Finds the handler for `path`.
    ///
    /// A literal-only pattern takes precedence over a wildcard pattern that
    /// matches the same path. Returns `None` if nothing matches.
    pub fn resolve<'t, 'p>(
        &'t self,
        method: &Method,
        path: &'p str,
    ) -> Option<Resolved<'t, 'p, H>> {
        let mut wildcard_match = None;
        for route in self.routes.get(method)? {
            let Some(captured) = route.pattern.matches(path) else {
                continue;
            };
            let resolved = Resolved {
                handler: &route.handler,
                pattern: &route.pattern,
                captured,
            };
            if route.pattern.is_literal() {
                return Some(resolved);
            }
            wildcard_match.get_or_insert(resolved);
        }
        wildcard_match
    }

    /// Lists every registered (method, pattern) pair in registration order
    /// per method.
    pub fn patterns(&self) -> impl Iterator<Item = (&Method, &RoutePattern)> {
        self.routes.iter().flat_map(|(method, routes)| {
            routes.iter().map(move |r| (method, &r.pattern))
        })
    }
}
