//! Typed key/value context carried by a request.
//!
//! Filters never call each other. A filter that wants to influence a later
//! stage writes a value under a documented key; the consumer reads it back
//! with the same key, and the key's type parameter fixes the value type.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use axum::http::{HeaderMap, StatusCode};

/// Name and value type of one context slot.
pub struct ContextKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> ContextKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({})", self.name)
    }
}

/// Keys shared between the engine and the built-in modules.
pub mod keys {
    use super::*;

    /// Written by FoundProduct/BeforeLocation filters; read by the resolver
    /// in place of route matching.
    pub const CLUSTER_OVERRIDE: ContextKey<String> = ContextKey::new("cluster_override");

    /// Written by BeforeLocation filters; read by the resolver in place of
    /// host lookup.
    pub const PRODUCT_OVERRIDE: ContextKey<String> = ContextKey::new("product_override");

    /// Headers merged into the response before it is streamed.
    pub const RESPONSE_HEADERS: ContextKey<HeaderMap> = ContextKey::new("response_headers");

    /// Status of the response synthesized for a `Finish` outcome.
    pub const FINISH_STATUS: ContextKey<StatusCode> = ContextKey::new("finish_status");
}

/// Per-request value store.
#[derive(Default)]
pub struct Context {
    values: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

impl Context {
    /// Store `value`, returning the previous value of the slot.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: &ContextKey<T>, value: T) -> Option<T> {
        self.values
            .insert(key.name, Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &ContextKey<T>) -> Option<&T> {
        self.values.get(key.name)?.downcast_ref::<T>()
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self, key: &ContextKey<T>) -> Option<&mut T> {
        self.values.get_mut(key.name)?.downcast_mut::<T>()
    }

    pub fn remove<T: Any + Send + Sync>(&mut self, key: &ContextKey<T>) -> Option<T> {
        self.values
            .remove(key.name)?
            .downcast::<T>()
            .ok()
            .map(|v| *v)
    }

    pub fn contains<T>(&self, key: &ContextKey<T>) -> bool {
        self.values.contains_key(key.name)
    }
}
