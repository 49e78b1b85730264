// SPDX-License-Identifier: PMPL-1.0-or-later
//! State initializers and the strategy that merges their defaults with data
//! already in storage.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Zero-argument factory producing the default value of a key or scope.
pub type StateInitializer = Arc<dyn Fn() -> Value + Send + Sync>;

/// Wrap a closure as a [`StateInitializer`].
pub fn state_initializer<F>(initializer: F) -> StateInitializer
where
    F: Fn() -> Value + Send + Sync + 'static,
{
    Arc::new(initializer)
}

/// Pure merge function `(default, existing) -> merged`.
///
/// One strategy is active per root storage; every scope under that root
/// uses it. Install it before the first initialization so every scope is
/// seeded the same way.
#[derive(Clone)]
pub struct InitializerStrategy {
    merge: Arc<dyn Fn(Value, Value) -> Value + Send + Sync>,
}

impl InitializerStrategy {
    /// Fields already stored override the default's (default behaviour).
    pub fn existing_wins() -> Self {
        Self::custom(|default, existing| shallow_merge(default, existing))
    }

    /// The default's fields override whatever is stored.
    pub fn defaults_win() -> Self {
        Self::custom(|default, existing| shallow_merge(existing, default))
    }

    /// Use an arbitrary merge function.
    pub fn custom<F>(merge: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Self {
            merge: Arc::new(merge),
        }
    }

    /// Merge a freshly computed `default` with the `existing` stored value.
    pub fn merge(&self, default: Value, existing: Value) -> Value {
        (self.merge)(default, existing)
    }
}

impl Default for InitializerStrategy {
    fn default() -> Self {
        Self::existing_wins()
    }
}

impl fmt::Debug for InitializerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializerStrategy").finish_non_exhaustive()
    }
}

/// Shallow object merge: `overlay`'s top-level fields replace `base`'s.
///
/// A `Null` overlay keeps `base`; any other non-object pairing yields
/// `overlay`.
pub fn shallow_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            base.extend(overlay);
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}
