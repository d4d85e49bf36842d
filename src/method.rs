//! Request method descriptors.
//!
//! A [`Method`] is an immutable description of one request: verb, URL, params,
//! headers, optional body, and a per-descriptor cache policy. Descriptors are
//! created by an engine's verb factories ([`Engine::get`](crate::engine::Engine::get),
//! [`Engine::post`](crate::engine::Engine::post), ...) and identified for
//! caching purposes by a deterministic [`Fingerprint`], never by object
//! identity, so two independently built descriptors for the same logical
//! resource share one cache entry.
//!
//! # Example
//!
//! ```rust,ignore
//! let users = engine.get("/users", MethodConfig::new().name("userList"));
//! let data = users.send(false).await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CachePolicy;
use crate::engine::EngineInner;
use crate::error::RequestError;

/// Query parameters, kept sorted so fingerprints are order-independent.
pub type Params = BTreeMap<String, String>;

/// Request or response headers, kept sorted like [`Params`].
pub type Headers = BTreeMap<String, String>;

/// Response transform applied after the response hooks: receives the raw
/// payload and the response headers, returns the value stored as `data`.
pub type TransformFn = Arc<dyn Fn(Value, &Headers) -> Result<Value, RequestError> + Send + Sync>;

/// The request verb of a method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
}

impl Verb {
    /// The canonical wire name of this verb.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
        }
    }

    /// Returns `true` for verbs that cache responses when no explicit policy
    /// is given. GET and HEAD default to five minutes in memory; every other
    /// verb defaults to no caching.
    #[must_use]
    pub const fn caches_by_default(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic cache identity of a method descriptor.
///
/// Derived from the descriptor's semantically relevant fields: verb, URL,
/// params, and descriptor-level headers. The body and any engine-level
/// defaults do not participate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub(crate) fn of(verb: Verb, url: &str, params: &Params, headers: &Headers) -> Self {
        let mut hasher = DefaultHasher::new();
        verb.as_str().hash(&mut hasher);
        url.hash(&mut hasher);
        for (key, value) in params {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        for (key, value) in headers {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        Self(hasher.finish())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-descriptor configuration, built fluently and passed to a verb factory.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use freshet::cache::CachePolicy;
/// use freshet::method::MethodConfig;
///
/// let config = MethodConfig::new()
///     .name("user1")
///     .param("id", "1")
///     .cache(CachePolicy::memory(Duration::from_secs(300)));
/// ```
#[derive(Clone, Default)]
pub struct MethodConfig {
    /// Optional name addressed by the method matcher.
    pub name: Option<String>,
    /// Query parameters.
    pub params: Params,
    /// Descriptor-level headers.
    pub headers: Headers,
    /// Per-descriptor timeout, overriding the engine default.
    pub timeout: Option<Duration>,
    /// Per-descriptor cache policy, overriding the engine and verb defaults.
    pub cache: Option<CachePolicy>,
    /// Enables download progress reporting for this descriptor.
    pub enable_download: bool,
    /// Enables upload progress reporting for this descriptor.
    pub enable_upload: bool,
    /// Response transform; the transformed value becomes the `data` state.
    pub transform: Option<TransformFn>,
    /// Opaque caller data forwarded to the transport and response hooks.
    pub extra: Option<Value>,
}

impl MethodConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the descriptor for matcher lookups.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds one query parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Adds one header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the per-descriptor timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the per-descriptor cache policy.
    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Enables download progress reporting.
    #[must_use]
    pub const fn enable_download(mut self) -> Self {
        self.enable_download = true;
        self
    }

    /// Enables upload progress reporting.
    #[must_use]
    pub const fn enable_upload(mut self) -> Self {
        self.enable_upload = true;
        self
    }

    /// Sets the response transform.
    #[must_use]
    pub fn transform(
        mut self,
        f: impl Fn(Value, &Headers) -> Result<Value, RequestError> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(f));
        self
    }

    /// Attaches opaque caller data.
    #[must_use]
    pub fn extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

impl fmt::Debug for MethodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodConfig")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("cache", &self.cache)
            .field("enable_download", &self.enable_download)
            .field("enable_upload", &self.enable_upload)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("extra", &self.extra)
            .finish()
    }
}

pub(crate) struct MethodInner {
    pub(crate) verb: Verb,
    pub(crate) url: String,
    pub(crate) body: Option<Value>,
    pub(crate) config: MethodConfig,
    pub(crate) policy: CachePolicy,
    pub(crate) fingerprint: Fingerprint,
    pub(crate) engine: Weak<EngineInner>,
}

/// An immutable request descriptor. Cheap to clone; all clones share one
/// underlying description.
#[derive(Clone)]
pub struct Method {
    pub(crate) inner: Arc<MethodInner>,
}

impl Method {
    pub(crate) fn new(
        verb: Verb,
        url: impl Into<String>,
        body: Option<Value>,
        config: MethodConfig,
        engine: Weak<EngineInner>,
        engine_cache: Option<&CachePolicy>,
    ) -> Self {
        let url = url.into();
        let policy = config.cache.clone().unwrap_or_else(|| {
            engine_cache.cloned().unwrap_or_else(|| {
                if verb.caches_by_default() {
                    CachePolicy::memory(Duration::from_millis(300_000))
                } else {
                    CachePolicy::disabled()
                }
            })
        });
        let fingerprint = Fingerprint::of(verb, &url, &config.params, &config.headers);
        Self {
            inner: Arc::new(MethodInner {
                verb,
                url,
                body,
                config,
                policy,
                fingerprint,
                engine,
            }),
        }
    }

    /// The request verb.
    #[must_use]
    pub fn verb(&self) -> Verb {
        self.inner.verb
    }

    /// The descriptor URL (relative to the engine's base URL).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The matcher name, if one was configured.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.config.name.as_deref()
    }

    /// The request body, if any.
    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.inner.body.as_ref()
    }

    /// The descriptor's query parameters.
    #[must_use]
    pub fn params(&self) -> &Params {
        &self.inner.config.params
    }

    /// The descriptor-level headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.inner.config.headers
    }

    /// The per-descriptor timeout, if one was configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.config.timeout
    }

    /// Whether download progress reporting is enabled.
    #[must_use]
    pub fn enable_download(&self) -> bool {
        self.inner.config.enable_download
    }

    /// Whether upload progress reporting is enabled.
    #[must_use]
    pub fn enable_upload(&self) -> bool {
        self.inner.config.enable_upload
    }

    /// Opaque caller data, if any.
    #[must_use]
    pub fn extra(&self) -> Option<&Value> {
        self.inner.config.extra.as_ref()
    }

    pub(crate) fn transform(&self) -> Option<TransformFn> {
        self.inner.config.transform.clone()
    }

    pub(crate) fn engine(&self) -> Option<Arc<EngineInner>> {
        self.inner.engine.upgrade()
    }

    pub(crate) fn engine_weak(&self) -> Weak<EngineInner> {
        self.inner.engine.clone()
    }

    /// The resolved cache policy for this descriptor.
    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.inner.policy
    }

    /// The deterministic cache identity of this descriptor.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint
    }

    /// Returns `true` if both handles point at the same descriptor instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves this descriptor once through the cache-then-execute path.
    ///
    /// With `force: true` the cache read is skipped and a fresh execution is
    /// started; the result is still written back to the cache.
    ///
    /// # Errors
    ///
    /// Returns the execution's [`RequestError`], or a transport error if the
    /// owning engine has been disposed.
    pub async fn send(&self, force: bool) -> Result<Value, RequestError> {
        let engine = self
            .inner
            .engine
            .upgrade()
            .ok_or_else(|| RequestError::Transport("engine disposed".to_string()))?;
        crate::executor::resolve(&engine, self, force).await
    }

    /// Serializes the descriptor's data fields for persistence.
    ///
    /// Transform closures and hooks are not serialized; a restored descriptor
    /// re-executes under the engine's global hooks only.
    #[must_use]
    pub fn serialize(&self) -> SerializedMethod {
        let inner = &self.inner;
        SerializedMethod {
            verb: inner.verb,
            url: inner.url.clone(),
            params: inner.config.params.clone(),
            headers: inner.config.headers.clone(),
            body: inner.body.clone(),
            name: inner.config.name.clone(),
            timeout: inner.config.timeout,
            policy: inner.policy.clone(),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("verb", &self.inner.verb)
            .field("url", &self.inner.url)
            .field("name", &self.inner.config.name)
            .field("fingerprint", &self.inner.fingerprint.to_string())
            .finish()
    }
}

/// Persistable subset of a method descriptor, used by the silent queue so a
/// pending request survives a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedMethod {
    pub verb: Verb,
    pub url: String,
    pub params: Params,
    pub headers: Headers,
    pub body: Option<Value>,
    pub name: Option<String>,
    pub timeout: Option<Duration>,
    pub policy: CachePolicy,
}

impl SerializedMethod {
    /// Rebuilds a live descriptor bound to `engine`. The restored descriptor
    /// is not registered with the matcher.
    pub(crate) fn restore(&self, engine: &Arc<EngineInner>) -> Method {
        let mut config = MethodConfig::new()
            .cache(self.policy.clone());
        config.name = self.name.clone();
        config.params = self.params.clone();
        config.headers = self.headers.clone();
        config.timeout = self.timeout;
        Method::new(
            self.verb,
            self.url.clone(),
            self.body.clone(),
            config,
            Arc::downgrade(engine),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint_of(verb: Verb, url: &str, params: &[(&str, &str)], headers: &[(&str, &str)]) -> Fingerprint {
        let params: Params = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let headers: Headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Fingerprint::of(verb, url, &params, &headers)
    }

    #[test]
    fn test_fingerprint_ignores_construction_order() {
        let a = fingerprint_of(Verb::Get, "/users", &[("a", "1"), ("b", "2")], &[]);
        let b = fingerprint_of(Verb::Get, "/users", &[("b", "2"), ("a", "1")], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_relevant_fields() {
        let base = fingerprint_of(Verb::Get, "/users", &[("a", "1")], &[]);

        assert_ne!(base, fingerprint_of(Verb::Post, "/users", &[("a", "1")], &[]));
        assert_ne!(base, fingerprint_of(Verb::Get, "/user", &[("a", "1")], &[]));
        assert_ne!(base, fingerprint_of(Verb::Get, "/users", &[("a", "2")], &[]));
        assert_ne!(
            base,
            fingerprint_of(Verb::Get, "/users", &[("a", "1")], &[("x-auth", "t")])
        );
    }

    #[test]
    fn test_default_policy_by_verb() {
        let get = Method::new(Verb::Get, "/a", None, MethodConfig::new(), Weak::new(), None);
        assert_eq!(
            get.policy().expiry,
            crate::cache::Expiry::After(Duration::from_millis(300_000))
        );

        let post = Method::new(Verb::Post, "/a", None, MethodConfig::new(), Weak::new(), None);
        assert!(post.policy().is_disabled());

        let head = Method::new(Verb::Head, "/a", None, MethodConfig::new(), Weak::new(), None);
        assert!(!head.policy().is_disabled());
    }

    #[test]
    fn test_descriptor_policy_overrides_engine_default() {
        let engine_default = CachePolicy::forever();
        let method = Method::new(
            Verb::Post,
            "/a",
            None,
            MethodConfig::new().cache(CachePolicy::disabled()),
            Weak::new(),
            Some(&engine_default),
        );
        assert!(method.policy().is_disabled());

        let method = Method::new(
            Verb::Post,
            "/a",
            None,
            MethodConfig::new(),
            Weak::new(),
            Some(&engine_default),
        );
        assert_eq!(method.policy(), &CachePolicy::forever());
    }

    #[test]
    fn test_serialized_method_roundtrip() {
        let method = Method::new(
            Verb::Post,
            "/users",
            Some(serde_json::json!({"name": "a"})),
            MethodConfig::new().name("createUser").param("v", "2"),
            Weak::new(),
            None,
        );
        let serialized = method.serialize();
        let json = serde_json::to_string(&serialized).expect("serialize method");
        let back: SerializedMethod = serde_json::from_str(&json).expect("deserialize method");
        assert_eq!(back.verb, Verb::Post);
        assert_eq!(back.url, "/users");
        assert_eq!(back.name.as_deref(), Some("createUser"));
        assert_eq!(back.params.get("v").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_verb_display() {
        assert_eq!(Verb::Get.to_string(), "GET");
        assert_eq!(Verb::Patch.to_string(), "PATCH");
    }
}
