//! Route authorization against a compiled role table.
//!
//! Patterns are `/`-separated segments; a segment starting with `:` is a
//! parameter matching any single non-empty segment. Matching is anchored on
//! both ends: `/bookings/:id` matches `/bookings/abc123` but neither
//! `/bookings` nor `/bookings/abc123/extra`.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::Error;
use crate::session::{Session, SessionStatus};
use crate::types::Role;

pub const LOGIN_PATH: &str = "/login";
pub const UNAUTHORIZED_PATH: &str = "/unauthorized";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compiles a pattern such as `/admin/bookings/:id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the pattern does not start with `/`, has
    /// an empty segment, or has an unnamed parameter.
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        if !pattern.starts_with('/') {
            return Err(Error::Config(format!("route pattern must start with '/': {pattern}")));
        }
        let segments = split_segments(pattern)
            .into_iter()
            .map(|seg| match seg.strip_prefix(':') {
                Some("") => Err(Error::Config(format!("unnamed parameter in {pattern}"))),
                Some(name) => Ok(Segment::Param(name.to_owned())),
                None if seg.is_empty() => {
                    Err(Error::Config(format!("empty segment in {pattern}")))
                }
                None => Ok(Segment::Literal(seg.to_owned())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_owned(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Full-path match. Query string and fragment of `path` are ignored.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let parts = split_segments(strip_query(path));
        parts.len() == self.segments.len()
            && self.segments.iter().zip(parts).all(|(seg, part)| match seg {
                Segment::Literal(lit) => lit == part,
                Segment::Param(_) => !part.is_empty(),
            })
    }
}

impl FromStr for PathPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

// "/" and "" both yield no segments; one trailing slash is tolerated.
fn split_segments(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}

/// Uncompiled role table, e.g. deserialized from JSON:
/// `{ "user": ["/bookings/:id"], "admin": ["/admin/bookings"] }`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RoleTableSpec(pub HashMap<Role, Vec<String>>);

/// Role → allowed path patterns, compiled once.
#[derive(Debug, Clone)]
pub struct RoleTable {
    routes: HashMap<Role, Vec<PathPattern>>,
}

const USER_ROUTES: &[&str] = &[
    "/profile",
    "/profile/edit",
    "/change-password",
    "/bookings",
    "/bookings/:id",
    "/checkout/:packageId",
    "/payment-success",
    "/messages",
];

const ADMIN_ROUTES: &[&str] = &[
    "/admin",
    "/admin/dashboard",
    "/admin/profile",
    "/admin/bookings",
    "/admin/bookings/:id",
    "/admin/payments",
    "/admin/payments/:id",
    "/admin/users",
    "/admin/users/:id",
    "/admin/packages",
    "/admin/packages/new",
    "/admin/packages/:id/edit",
    "/admin/contacts",
    "/admin/reviews",
];

impl RoleTable {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for the first malformed pattern.
    pub fn compile(spec: &RoleTableSpec) -> Result<Self, Error> {
        let mut routes = HashMap::with_capacity(spec.0.len());
        for (role, patterns) in &spec.0 {
            let compiled = patterns
                .iter()
                .map(|p| PathPattern::parse(p))
                .collect::<Result<Vec<_>, _>>()?;
            routes.insert(*role, compiled);
        }
        Ok(Self { routes })
    }

    /// Patterns for `role`, or `None` if the table does not restrict it.
    #[must_use]
    pub fn patterns(&self, role: Role) -> Option<&[PathPattern]> {
        self.routes.get(&role).map(Vec::as_slice)
    }

    /// Whether `role` may open `path`. Roles absent from the table are
    /// unrestricted.
    #[must_use]
    pub fn allows(&self, role: Role, path: &str) -> bool {
        self.patterns(role)
            .map_or(true, |patterns| patterns.iter().any(|p| p.matches(path)))
    }

    /// Decides whether the current session may open `path`.
    ///
    /// Role requirements are checked before the route table.
    #[must_use]
    pub fn decide(&self, session: &Session, requirement: Requirement, path: &str) -> Decision {
        match session.status {
            SessionStatus::Authenticating => return Decision::Pending,
            SessionStatus::Unauthenticated => {
                return Decision::RedirectLogin {
                    return_to: path.to_owned(),
                };
            }
            SessionStatus::Authenticated => {}
        }

        let Some(role) = session.role() else {
            return Decision::RedirectLogin {
                return_to: path.to_owned(),
            };
        };

        if let Requirement::Role(required) = requirement {
            if role != required {
                tracing::debug!(%role, %required, path, "Role requirement not met");
                return Decision::RedirectUnauthorized;
            }
        }

        if self.allows(role, path) {
            Decision::Allow
        } else {
            tracing::debug!(%role, path, "Path not in role table");
            Decision::RedirectUnauthorized
        }
    }
}

impl Default for RoleTable {
    fn default() -> Self {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| PathPattern::parse(p).expect("built-in route pattern is valid"))
                .collect()
        };
        let mut routes = HashMap::new();
        routes.insert(Role::User, compile(USER_ROUTES));
        routes.insert(Role::Admin, compile(ADMIN_ROUTES));
        Self { routes }
    }
}

/// What a protected route demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Authenticated,
    Role(Role),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// Session is still being reconciled; show a loading state.
    Pending,
    RedirectLogin { return_to: String },
    RedirectUnauthorized,
}

impl Decision {
    /// Where to navigate, or `None` for `Allow` and `Pending`.
    #[must_use]
    pub fn location(&self) -> Option<String> {
        match self {
            Self::Allow | Self::Pending => None,
            Self::RedirectLogin { return_to } => Some(format!(
                "{LOGIN_PATH}?redirect={}",
                urlencoding::encode(return_to)
            )),
            Self::RedirectUnauthorized => Some(UNAUTHORIZED_PATH.to_owned()),
        }
    }
}
