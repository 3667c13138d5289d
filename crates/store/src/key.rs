use derive_more::Display;

/// Identifies one cached resource.
///
/// The key is structured as `(namespace, base)` rather than a flat string, so
/// clearing a namespace never touches another namespace that merely shares a
/// prefix (`"home"` vs `"home2"`), and two different pairs can never collide
/// even when their rendered forms are identical. The [`Display`] form
/// (`namespace_base`) is only for humans and logs.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{namespace}_{base}")]
pub struct CacheKey {
    namespace: String,
    base: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, base: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), base: base.into() }
    }

    /// Host/consumer identity that scopes this key.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Logical resource name within the namespace.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// A key for a sibling resource in the same namespace.
    pub fn sibling(&self, base: impl Into<String>) -> Self {
        Self::new(self.namespace.clone(), base)
    }
}
