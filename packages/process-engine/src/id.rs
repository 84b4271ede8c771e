//! Typed document references for compile-time type safety.
//!
//! `Ref<T>` is a string-backed identifier tagged with the kind of object it
//! points at, so a `Ref<State>` cannot be passed where a `Ref<Process>` was
//! expected. On the wire it is a plain JSON string.
//!
//! # Example
//!
//! ```rust
//! use process_engine::id::Ref;
//! use process_engine::model::{Process, State};
//!
//! let process: Ref<Process> = Ref::generate();
//! let state: Ref<State> = Ref::new("state-1");
//!
//! // This would be a compile error:
//! // let wrong: Ref<State> = process;
//! # let _ = (process, state);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::{Borrow, Cow};
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use uuid::Uuid;

/// A typed reference to a document, class, space or registry entry.
#[repr(transparent)]
pub struct Ref<T>(Cow<'static, str>, PhantomData<fn() -> T>);

// ============================================================================
// Core implementations
// ============================================================================

impl<T> Ref<T> {
    /// Creates a reference from any string.
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()), PhantomData)
    }

    /// Creates a reference from a static string. Usable in `const` items.
    #[inline]
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id), PhantomData)
    }

    /// Generates a fresh, time-ordered identifier (UUID v7).
    #[inline]
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7().to_string())
    }

    /// Returns the identifier as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reinterprets this reference as pointing at another kind of object.
    ///
    /// Needed where the store speaks in untyped documents, e.g. a ToDo's
    /// `attachedTo` which may be any card class.
    #[inline]
    pub fn cast<U>(&self) -> Ref<U> {
        Ref(self.0.clone(), PhantomData)
    }
}

// ============================================================================
// Standard trait implementations
// ============================================================================

impl<T> Clone for Ref<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self(self.0.clone(), PhantomData)
    }
}

impl<T> Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        f.debug_tuple(&format!("Ref<{}>", short))
            .field(&self.as_str())
            .finish()
    }
}

impl<T> Display for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> PartialEq for Ref<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl<T> Eq for Ref<T> {}

impl<T> PartialOrd for Ref<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ref<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl<T> Hash for Ref<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl<T> AsRef<str> for Ref<T> {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<T> Borrow<str> for Ref<T> {
    #[inline]
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl<T> From<&str> for Ref<T> {
    #[inline]
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl<T> From<String> for Ref<T> {
    #[inline]
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl<T> From<Ref<T>> for serde_json::Value {
    #[inline]
    fn from(id: Ref<T>) -> Self {
        serde_json::Value::String(id.0.into_owned())
    }
}

// ============================================================================
// Serde support
// ============================================================================

impl<T> Serialize for Ref<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, T> Deserialize<'de> for Ref<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

// ============================================================================
// Tests
// ============================================================================
