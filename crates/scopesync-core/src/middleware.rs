//! Owner-side validation of leaf mutations.
//!
//! A middleware is a named group of checks over `(old, new)`. The chain is only
//! consulted by the owner: values arriving from the owner are trusted.
//!
//! - A check returning `Ok(false)` fails its middleware and stops the chain.
//! - A check returning `Err` is logged and skipped; the chain carries on.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// How a failing middleware reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareKind {
    /// Abort the update and echo the prior value back to the source
    Error,
    /// Abort the update and only warn
    Warning,
}

/// Raised by a check that could not evaluate its input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CheckError(pub String);

/// A single check over the previous and proposed value.
pub type MiddlewareCheck =
    Arc<dyn Fn(Option<&Value>, &Value) -> Result<bool, CheckError> + Send + Sync>;

/// A named, ordered group of checks.
#[derive(Clone)]
pub struct Middleware {
    name: String,
    checks: Vec<MiddlewareCheck>,
    kind: MiddlewareKind,
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("checks", &self.checks.len())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Middleware {
    /// Create a middleware with no checks.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: MiddlewareKind) -> Self {
        Self {
            name: name.into(),
            checks: Vec::new(),
            kind,
        }
    }

    /// Append a raw JSON check.
    #[must_use]
    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> Result<bool, CheckError> + Send + Sync + 'static,
    {
        self.checks.push(Arc::new(check));
        self
    }

    /// Append a check over decoded values.
    ///
    /// Values that fail to decode as `T` make the check error out, which the
    /// chain logs and skips.
    #[must_use]
    pub fn with_typed_check<T, F>(self, check: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(Option<T>, T) -> bool + Send + Sync + 'static,
    {
        self.with_check(move |old, new| {
            let old = old
                .map(|v| serde_json::from_value::<T>(v.clone()))
                .transpose()
                .map_err(|e| CheckError(e.to_string()))?;
            let new = serde_json::from_value::<T>(new.clone())
                .map_err(|e| CheckError(e.to_string()))?;
            Ok(check(old, new))
        })
    }

    /// Hard middleware with one typed check.
    #[must_use]
    pub fn error<T, F>(name: impl Into<String>, check: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(Option<T>, T) -> bool + Send + Sync + 'static,
    {
        Self::new(name, MiddlewareKind::Error).with_typed_check(check)
    }

    /// Soft middleware with one typed check.
    #[must_use]
    pub fn warning<T, F>(name: impl Into<String>, check: F) -> Self
    where
        T: DeserializeOwned,
        F: Fn(Option<T>, T) -> bool + Send + Sync + 'static,
    {
        Self::new(name, MiddlewareKind::Warning).with_typed_check(check)
    }

    /// The middleware name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The failure reaction.
    #[must_use]
    pub fn kind(&self) -> MiddlewareKind {
        self.kind
    }

    /// Run every check; all must pass.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a check.
    pub fn check(&self, old: Option<&Value>, new: &Value) -> Result<bool, CheckError> {
        for check in &self.checks {
            if !check(old, new)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Report this middleware's failure for the node at `path`.
    pub fn report_failure(&self, path: &str) {
        match self.kind {
            MiddlewareKind::Error => {
                tracing::error!(middleware = %self.name, node = path, "Middleware rejected update");
            }
            MiddlewareKind::Warning => {
                tracing::warn!(middleware = %self.name, node = path, "Middleware rejected update");
            }
        }
    }
}

/// The ordered middleware list of a leaf.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Middleware>,
}

impl MiddlewareChain {
    /// Append a middleware.
    pub fn push(&mut self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    /// Replace the whole chain.
    pub fn replace(&mut self, middleware: Vec<Middleware>) {
        self.middleware = middleware;
    }

    /// Number of middleware in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Run the chain and return the first failing middleware, if any.
    #[must_use]
    pub fn run(&self, path: &str, old: Option<&Value>, new: &Value) -> Option<&Middleware> {
        for middleware in &self.middleware {
            match middleware.check(old, new) {
                Ok(true) => {}
                Ok(false) => return Some(middleware),
                Err(err) => {
                    tracing::warn!(
                        middleware = %middleware.name,
                        node = path,
                        error = %err,
                        "Middleware failed to run"
                    );
                }
            }
        }
        None
    }
}
