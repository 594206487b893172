//! Identity and resource types shared across the Tether crates

use std::fmt;

/// Name of a remote service, as supplied by callers or reported by proxies.
///
/// Callers may address a service through an alias; proxy factories normalize
/// aliases to the canonical name before using it as a cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ServiceName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Path of one object within a remote service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for ObjectPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// Identity of one remote object: the canonical service name plus the
/// object path within it. Used as the proxy cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProxyKey {
    service: ServiceName,
    path: ObjectPath,
}

impl ProxyKey {
    pub fn new(service: ServiceName, path: ObjectPath) -> Self {
        Self { service, path }
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }
}

impl fmt::Display for ProxyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.path)
    }
}

/// A remote-assigned numeric resource identifier.
///
/// Only valid while referenced through at least one live `HandleSet`.
pub type HandleId = u64;

/// Category of handle a remote service hands out. Reference counts are kept
/// per class; handles of different classes never mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Contact,
    Room,
    List,
    Group,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceClass::Contact => "contact",
            ResourceClass::Room => "room",
            ResourceClass::List => "list",
            ResourceClass::Group => "group",
        };
        f.write_str(name)
    }
}

/// One unit of proxy readiness that can be requested from a factory.
///
/// Feature names are defined by each proxy kind; the core only needs
/// equality and hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Feature(&'static str);

impl Feature {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
