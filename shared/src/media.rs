//! Media reference classification and resolution.
//!
//! Raw media values arrive in many shapes (relative upload paths, absolute URLs,
//! inline base64, demo tokens, objects with a nested `uri`). They are parsed once
//! at the boundary into a [`MediaReference`] and resolved to a displayable
//! [`ResolvedMedia`]. Resolution never fails: anything unusable becomes the
//! placeholder.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{CoreConfig, MissingOriginPolicy};
use crate::origin::{OriginContext, OriginRouter};

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v", "3gp", "flv"];

const MOCK_PREFIX: &str = "mock:";
const MOCK_DEFAULT_SIZE: (u32, u32) = (600, 400);
const MOCK_MAX_DIMENSION: u32 = 4000;
const REFERENCE_FIELDS: &[&str] = &["uri", "url", "path", "src", "file"];
const HINT_FIELDS: &[&str] = &["type", "mimeType", "mime_type", "mediaType"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Image,
    Video,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedMedia {
    pub uri: String,
    pub media_type: MediaType,
}

impl ResolvedMedia {
    pub fn is_video(&self) -> bool {
        self.media_type == MediaType::Video
    }
}

/// Synthetic placeholder token, `mock:<seed>[@<W>x<H>]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MockToken {
    pub seed: String,
    pub width: u32,
    pub height: u32,
}

impl MockToken {
    fn parse(raw: &str) -> Option<Self> {
        let head = raw.get(..MOCK_PREFIX.len())?;
        if !head.eq_ignore_ascii_case(MOCK_PREFIX) {
            return None;
        }
        let body = raw[MOCK_PREFIX.len()..].trim();
        let (seed, size) = match body.rsplit_once('@') {
            Some((seed, size)) => (seed, parse_size(size)),
            None => (body, None),
        };
        if seed.is_empty() {
            return None;
        }
        let (width, height) = size.unwrap_or(MOCK_DEFAULT_SIZE);
        Some(Self {
            seed: seed.to_string(),
            width,
            height,
        })
    }

    /// Background color derived from the seed so the same token always
    /// renders the same tile.
    pub fn color_hex(&self) -> String {
        let hash = blake3::hash(self.seed.as_bytes());
        hex::encode(&hash.as_bytes()[..3])
    }
}

fn parse_size(size: &str) -> Option<(u32, u32)> {
    let lower = size.to_ascii_lowercase();
    let (w, h) = lower.split_once('x')?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    if w == 0 || h == 0 || w > MOCK_MAX_DIMENSION || h > MOCK_MAX_DIMENSION {
        return None;
    }
    Some((w, h))
}

/// Closed set of media reference shapes. Exactly one is active.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum MediaReference {
    /// Backend-relative upload path, normalized without a leading slash.
    Path(String),
    /// Already absolute http(s) URL.
    Url(String),
    /// Raw base64 payload with no scheme.
    Base64(String),
    Mock(MockToken),
    /// Anything else with content; passed through unchanged.
    Opaque(String),
    #[default]
    Empty,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaInput {
    pub reference: MediaReference,
    pub hint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaResolver {
    router: OriginRouter,
    placeholder_uri: String,
    relative_prefixes: Vec<String>,
    base64_min_len: usize,
    mock_placeholder_base: String,
    missing_origin_policy: MissingOriginPolicy,
}

impl MediaResolver {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            router: OriginRouter::from_config(config),
            placeholder_uri: config.placeholder_uri.clone(),
            relative_prefixes: config.relative_prefixes.clone(),
            base64_min_len: config.base64_min_len,
            mock_placeholder_base: config.mock_placeholder_base.clone(),
            missing_origin_policy: config.missing_origin_policy,
        }
    }

    pub fn router(&self) -> &OriginRouter {
        &self.router
    }

    pub fn placeholder(&self) -> ResolvedMedia {
        ResolvedMedia {
            uri: self.placeholder_uri.clone(),
            media_type: MediaType::Image,
        }
    }

    /// Classifies a raw string. First match wins.
    pub fn classify(&self, raw: &str) -> MediaReference {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return MediaReference::Empty;
        }

        // Absolute URLs go back to the shell byte-for-byte.
        if has_http_scheme(trimmed) {
            return MediaReference::Url(raw.to_string());
        }

        let normalized = trimmed.replace('\\', "/");
        let relative = normalized.trim_start_matches('/');
        if self.relative_prefixes.iter().any(|p| starts_with_ignore_case(relative, p)) {
            return MediaReference::Path(relative.to_string());
        }

        let scheme = has_uri_scheme(trimmed);
        if !scheme && trimmed.len() > self.base64_min_len && is_base64_payload(trimmed) {
            return MediaReference::Base64(trimmed.to_string());
        }

        if let Some(token) = MockToken::parse(trimmed) {
            return MediaReference::Mock(token);
        }
        if starts_with_ignore_case(trimmed, MOCK_PREFIX) {
            return MediaReference::Empty;
        }

        MediaReference::Opaque(trimmed.to_string())
    }

    /// Parses any JSON-shaped raw value. Strings are classified directly,
    /// objects contribute their first reference field plus an optional type
    /// hint, everything else is `Empty`.
    pub fn parse(&self, raw: &Value) -> MediaInput {
        match raw {
            Value::String(s) => MediaInput {
                reference: self.classify(s),
                hint: None,
            },
            Value::Object(map) => {
                let reference = REFERENCE_FIELDS
                    .iter()
                    .find_map(|f| map.get(*f).and_then(Value::as_str))
                    .map(|s| self.classify(s))
                    .unwrap_or_default();
                let hint = HINT_FIELDS
                    .iter()
                    .find_map(|f| map.get(*f).and_then(Value::as_str))
                    .map(str::to_string);
                MediaInput { reference, hint }
            }
            _ => MediaInput::default(),
        }
    }

    pub fn resolve(&self, raw: &Value, origin: Option<OriginContext>) -> ResolvedMedia {
        let input = self.parse(raw);
        self.resolve_reference(&input.reference, input.hint.as_deref(), origin)
    }

    pub fn resolve_str(&self, raw: &str, origin: Option<OriginContext>) -> ResolvedMedia {
        self.resolve_reference(&self.classify(raw), None, origin)
    }

    pub fn resolve_opt(&self, raw: Option<&str>, origin: Option<OriginContext>) -> ResolvedMedia {
        match raw {
            Some(raw) => self.resolve_str(raw, origin),
            None => self.placeholder(),
        }
    }

    pub fn resolve_reference(
        &self,
        reference: &MediaReference,
        hint: Option<&str>,
        origin: Option<OriginContext>,
    ) -> ResolvedMedia {
        let uri = match reference {
            MediaReference::Empty => return self.placeholder(),
            MediaReference::Url(url) => url.clone(),
            MediaReference::Path(path) => {
                if origin.is_none() {
                    match self.missing_origin_policy {
                        MissingOriginPolicy::DefaultSecondary => {
                            debug!(path = %path, "no origin context, routing to secondary origin");
                        }
                        MissingOriginPolicy::Placeholder => {
                            warn!(path = %path, "no origin context for upload path, showing placeholder");
                            return self.placeholder();
                        }
                    }
                }
                self.router.route(path, origin)
            }
            MediaReference::Base64(payload) => format!("data:image/jpeg;base64,{payload}"),
            MediaReference::Mock(token) => self.mock_url(token),
            MediaReference::Opaque(raw) => raw.clone(),
        };

        if uri.is_empty() {
            return self.placeholder();
        }

        ResolvedMedia {
            media_type: infer_media_type(&uri, hint),
            uri,
        }
    }

    fn mock_url(&self, token: &MockToken) -> String {
        let text: String = url::form_urlencoded::byte_serialize(token.seed.as_bytes()).collect();
        format!(
            "{}/{}x{}/{}/ffffff?text={}",
            self.mock_placeholder_base,
            token.width,
            token.height,
            token.color_hex(),
            text
        )
    }

    /// Resolves a listing's media array in order, dropping empty entries.
    pub fn resolve_gallery(&self, items: &[Value], origin: Option<OriginContext>) -> Gallery {
        let items = items
            .iter()
            .map(|raw| self.parse(raw))
            .filter(|input| input.reference != MediaReference::Empty)
            .map(|input| self.resolve_reference(&input.reference, input.hint.as_deref(), origin))
            .collect();
        Gallery {
            items,
            placeholder: self.placeholder(),
        }
    }

    /// Resolves every media field of a listing using the listing's own
    /// authored-by flag.
    pub fn resolve_listing(&self, listing: &Value) -> Gallery {
        let origin = OriginContext::from_listing(listing);
        let mut raw = Vec::new();
        for field in ["images", "media", "videos"] {
            match listing.get(field) {
                Some(Value::Array(items)) => raw.extend(items.iter().cloned()),
                Some(single @ (Value::String(_) | Value::Object(_))) => raw.push(single.clone()),
                _ => {}
            }
        }
        self.resolve_gallery(&raw, origin)
    }
}

impl Default for MediaResolver {
    fn default() -> Self {
        Self::new(&CoreConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gallery {
    items: Vec<ResolvedMedia>,
    placeholder: ResolvedMedia,
}

impl Gallery {
    pub fn items(&self) -> &[ResolvedMedia] {
        &self.items
    }

    pub fn images(&self) -> impl Iterator<Item = &ResolvedMedia> {
        self.items.iter().filter(|m| !m.is_video())
    }

    pub fn videos(&self) -> impl Iterator<Item = &ResolvedMedia> {
        self.items.iter().filter(|m| m.is_video())
    }

    /// First image, or the placeholder when the listing has none.
    pub fn cover(&self) -> ResolvedMedia {
        self.images().next().cloned().unwrap_or_else(|| self.placeholder.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    raw: String,
    hint: Option<String>,
    origin: Option<OriginContext>,
}

/// Memoizes string resolutions for list screens that re-render often.
pub struct CachedResolver {
    inner: MediaResolver,
    cache: Mutex<LruCache<CacheKey, ResolvedMedia>>,
}

impl CachedResolver {
    pub fn new(config: &CoreConfig) -> Self {
        let capacity = NonZeroUsize::new(config.resolver_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: MediaResolver::new(config),
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn resolver(&self) -> &MediaResolver {
        &self.inner
    }

    pub fn resolve_str(
        &self,
        raw: &str,
        hint: Option<&str>,
        origin: Option<OriginContext>,
    ) -> ResolvedMedia {
        let key = CacheKey {
            raw: raw.to_string(),
            hint: hint.map(str::to_string),
            origin,
        };
        let Ok(mut cache) = self.cache.lock() else {
            return self.inner.resolve_reference(&self.inner.classify(raw), hint, origin);
        };
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
        let resolved = self.inner.resolve_reference(&self.inner.classify(raw), hint, origin);
        cache.put(key, resolved.clone());
        resolved
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

/// Video if the hint says so, the path has a video extension, or the URI is a
/// `data:video/*` payload. Image otherwise.
pub fn infer_media_type(uri: &str, hint: Option<&str>) -> MediaType {
    if hint.is_some_and(hint_is_video) {
        return MediaType::Video;
    }
    if let Some(rest) = strip_prefix_ignore_case(uri, "data:") {
        return if starts_with_ignore_case(rest, "video/") {
            MediaType::Video
        } else {
            MediaType::Image
        };
    }
    let path = uri.trim().split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
        Some((_, ext)) if VIDEO_EXTENSIONS.iter().any(|v| ext.eq_ignore_ascii_case(v)) => {
            MediaType::Video
        }
        _ => MediaType::Image,
    }
}

fn hint_is_video(hint: &str) -> bool {
    let hint = hint.trim();
    hint.eq_ignore_ascii_case("video") || starts_with_ignore_case(hint, "video/")
}

fn has_http_scheme(s: &str) -> bool {
    starts_with_ignore_case(s, "http://") || starts_with_ignore_case(s, "https://")
}

/// RFC 3986 scheme: a letter, then letters, digits, `+`, `-` or `.`, then `:`.
fn has_uri_scheme(s: &str) -> bool {
    let Some((scheme, _)) = s.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn is_base64_payload(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'-' | b'_'))
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len()).is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if starts_with_ignore_case(s, prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
