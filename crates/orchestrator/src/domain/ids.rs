#![forbid(unsafe_code)]

use slotmap::new_key_type;
use std::sync::Arc;
use std::{fmt, hash};

new_key_type! { pub struct JobId; }

/// Identifier of a scan host, the pool key. Cheap to clone.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostId(Arc<str>);

impl HostId {
    pub fn new(host: impl Into<String>) -> Self {
        Self(Arc::from(host.into().as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl hash::Hash for HostId {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostId").field(&self.0).finish()
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Control-plane session identifier handed back by a successful publish.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into().as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionId").field(&self.0).finish()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
