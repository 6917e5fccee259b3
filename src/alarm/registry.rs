//! Handler registry and build-stable handler tokens.
//!
//! A [`HandlerToken`] is a `blake3` digest over the running build's id and a
//! handler name. Tokens are persisted with alarm records and resolved back
//! into handlers after a cold start. A token minted by a different build
//! never resolves.
//!
//! Registration happens once: a [`BootstrapTable`] compiled into the host
//! names the bootstrap functions, one of which fills a
//! [`HandlerRegistryBuilder`] that is then frozen into a [`HandlerRegistry`].

use crate::alarm::types::{AlarmArg, AlarmId};
use crate::error::{AlarmError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Build identifier mixed into every token.
///
/// Set `CHIME_BUILD_ID` at compile time to stamp a per-build value; the
/// package version is used otherwise.
#[must_use]
pub fn default_build_id() -> String {
    match option_env!("CHIME_BUILD_ID") {
        Some(id) => id.to_owned(),
        None => concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned(),
    }
}

/// Opaque, serializable reference to a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HandlerToken(u64);

impl HandlerToken {
    /// Derive the token for `name` under `build_id`.
    #[must_use]
    pub fn derive(build_id: &str, name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(build_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0_u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_be_bytes(prefix))
    }

    /// Parse the 16-character hex wire form.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::UnresolvableHandler`] for anything that is not
    /// exactly 16 hex digits.
    pub fn from_hex(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != 16 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AlarmError::UnresolvableHandler(format!(
                "malformed handler token '{trimmed}'"
            )));
        }
        u64::from_str_radix(trimmed, 16)
            .map(Self)
            .map_err(|e| AlarmError::UnresolvableHandler(format!("malformed handler token: {e}")))
    }
}

impl std::fmt::Display for HandlerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl TryFrom<String> for HandlerToken {
    type Error = AlarmError;

    fn try_from(raw: String) -> Result<Self> {
        Self::from_hex(&raw)
    }
}

impl From<HandlerToken> for String {
    fn from(token: HandlerToken) -> Self {
        token.to_string()
    }
}

/// Everything a handler receives when its alarm fires.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmInvocation {
    pub alarm_id: AlarmId,
    pub fired_at_millis: i64,
    pub args: Vec<AlarmArg>,
}

/// A function invoked inside the dispatch context when an alarm fires.
#[async_trait]
pub trait AlarmHandler: Send + Sync + 'static {
    async fn on_alarm(&self, invocation: AlarmInvocation);
}

/// Adapter turning an async closure into an [`AlarmHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure returning a future as an [`AlarmHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(AlarmInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> AlarmHandler for FnHandler<F>
where
    F: Fn(AlarmInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn on_alarm(&self, invocation: AlarmInvocation) {
        (self.0)(invocation).await;
    }
}

struct RegisteredHandler {
    name: String,
    handler: Arc<dyn AlarmHandler>,
}

/// Mutable registration phase of a [`HandlerRegistry`].
pub struct HandlerRegistryBuilder {
    build_id: String,
    handlers: HashMap<HandlerToken, RegisteredHandler>,
}

impl HandlerRegistryBuilder {
    #[must_use]
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` under `name` and return its token.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::DuplicateHandler`] if `name` is already taken.
    pub fn register(
        &mut self,
        name: &str,
        handler: impl AlarmHandler,
    ) -> Result<HandlerToken> {
        let token = HandlerToken::derive(&self.build_id, name);
        if self.handlers.contains_key(&token) {
            return Err(AlarmError::DuplicateHandler(name.to_owned()));
        }
        self.handlers.insert(
            token,
            RegisteredHandler {
                name: name.to_owned(),
                handler: Arc::new(handler),
            },
        );
        Ok(token)
    }

    /// Freeze the registry. No further registration is possible.
    #[must_use]
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            build_id: self.build_id,
            handlers: self.handlers,
        }
    }
}

/// Immutable token → handler table for one process lifetime.
pub struct HandlerRegistry {
    build_id: String,
    handlers: HashMap<HandlerToken, RegisteredHandler>,
}

impl HandlerRegistry {
    /// Resolve a token minted by this build.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::UnresolvableHandler`] for tokens of other builds
    /// or names that were never registered.
    pub fn resolve(&self, token: &HandlerToken) -> Result<Arc<dyn AlarmHandler>> {
        self.handlers
            .get(token)
            .map(|entry| Arc::clone(&entry.handler))
            .ok_or_else(|| {
                AlarmError::UnresolvableHandler(format!(
                    "token {token} is not registered in build '{}'",
                    self.build_id
                ))
            })
    }

    /// Token for `name` under this registry's build.
    #[must_use]
    pub fn token_for(&self, name: &str) -> HandlerToken {
        HandlerToken::derive(&self.build_id, name)
    }

    /// Registered handler name for a token, if any.
    #[must_use]
    pub fn name_of(&self, token: &HandlerToken) -> Option<&str> {
        self.handlers.get(token).map(|entry| entry.name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Populates a registry during a cold start of the dispatch context.
pub type BootstrapFn = fn(&mut HandlerRegistryBuilder) -> Result<()>;

/// Compiled-in table of bootstrap functions, addressed by [`HandlerToken`].
#[derive(Clone)]
pub struct BootstrapTable {
    build_id: String,
    entries: HashMap<HandlerToken, (String, BootstrapFn)>,
}

impl Default for BootstrapTable {
    fn default() -> Self {
        Self::new(default_build_id())
    }
}

impl BootstrapTable {
    #[must_use]
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            entries: HashMap::new(),
        }
    }

    /// Add a named bootstrap function and return its token.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::DuplicateHandler`] if `name` is already present.
    pub fn register(&mut self, name: &str, bootstrap: BootstrapFn) -> Result<HandlerToken> {
        let token = HandlerToken::derive(&self.build_id, name);
        if self.entries.contains_key(&token) {
            return Err(AlarmError::DuplicateHandler(name.to_owned()));
        }
        self.entries.insert(token, (name.to_owned(), bootstrap));
        Ok(token)
    }

    #[must_use]
    pub fn token_for(&self, name: &str) -> HandlerToken {
        HandlerToken::derive(&self.build_id, name)
    }

    #[must_use]
    pub fn contains(&self, token: &HandlerToken) -> bool {
        self.entries.contains_key(token)
    }

    #[must_use]
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// `(name, token)` for every bootstrap, sorted by name.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, HandlerToken)> {
        let mut entries: Vec<(String, HandlerToken)> = self
            .entries
            .iter()
            .map(|(token, (name, _))| (name.clone(), *token))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Run the bootstrap function behind `token` and freeze the result.
    ///
    /// # Errors
    ///
    /// Returns [`AlarmError::UnresolvableHandler`] if the token is unknown,
    /// or whatever the bootstrap function itself reports.
    pub fn build_registry(&self, token: &HandlerToken) -> Result<HandlerRegistry> {
        let (name, bootstrap) = self.entries.get(token).ok_or_else(|| {
            AlarmError::UnresolvableHandler(format!(
                "bootstrap token {token} is not part of build '{}'",
                self.build_id
            ))
        })?;
        let mut builder = HandlerRegistryBuilder::new(self.build_id.clone());
        bootstrap(&mut builder)?;
        let registry = builder.build();
        tracing::debug!(
            "bootstrap '{}' registered {} handler(s)",
            name,
            registry.len()
        );
        Ok(registry)
    }
}
