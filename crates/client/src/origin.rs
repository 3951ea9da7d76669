// Gateway origin resolution.
//
// The origin comes from config, optionally overridden at runtime by the
// `gatewayOrigin`/`gw` query parameter of the page URL. An override is
// persisted so later visits keep using it.

use tracing::warn;
use url::Url;

use crate::store::KeyValueStore;

/// Durable-store key for a persisted origin override.
pub const ORIGIN_OVERRIDE_KEY: &str = "gatewayOriginOverride";
/// Durable-store key (and query parameter) for the debug flag.
pub const DEBUG_KEY: &str = "presenceDebug";

const ORIGIN_QUERY_PARAMS: [&str; 2] = ["gatewayOrigin", "gw"];

/// Which family of scheme a resolved URL should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeClass {
    Http,
    Ws,
}

#[derive(Debug, Clone)]
pub struct OriginResolver {
    origin: String,
    page_origin: Url,
}

impl OriginResolver {
    /// `origin` of `None` resolves against the page origin.
    pub fn new(origin: Option<String>, page_origin: Url) -> Self {
        let origin = origin.unwrap_or_else(|| page_origin.as_str().to_string());
        Self { origin, page_origin }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Join `path` onto the gateway origin and rewrite the scheme to the
    /// requested class. Malformed input falls back to the page host.
    pub fn resolve(&self, path: &str, class: SchemeClass) -> Url {
        let joined = Url::parse(&self.origin).and_then(|base| base.join(path));
        match joined {
            Ok(mut url) => {
                let target = match (class, url.scheme()) {
                    (SchemeClass::Ws, "http") => Some("ws"),
                    (SchemeClass::Ws, "https") => Some("wss"),
                    (SchemeClass::Http, "ws") => Some("http"),
                    (SchemeClass::Http, "wss") => Some("https"),
                    _ => None,
                };
                if let Some(scheme) = target {
                    // Only fails between special and non-special schemes.
                    let _ = url.set_scheme(scheme);
                }
                url
            }
            Err(error) => {
                warn!(origin = %self.origin, path, %error, "malformed gateway origin; using page host");
                self.same_origin(path, class)
            }
        }
    }

    fn same_origin(&self, path: &str, class: SchemeClass) -> Url {
        let secure = self.page_origin.scheme() == "https";
        let scheme = match (class, secure) {
            (SchemeClass::Ws, true) => "wss",
            (SchemeClass::Ws, false) => "ws",
            (SchemeClass::Http, true) => "https",
            (SchemeClass::Http, false) => "http",
        };
        let host = self.page_origin.host_str().unwrap_or("localhost");
        let authority = match self.page_origin.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
        Url::parse(&format!("{scheme}://{authority}{path}"))
            .unwrap_or_else(|_| self.page_origin.clone())
    }
}

fn is_http_origin(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Apply the page URL's origin override, persisting it, or fall back to a
/// previously persisted one.
pub fn origin_override(page_url: Option<&Url>, store: &dyn KeyValueStore) -> Option<String> {
    let from_query = page_url.and_then(|url| {
        ORIGIN_QUERY_PARAMS.iter().copied().find_map(|param| {
            url.query_pairs().find(|(k, v)| *k == param && !v.is_empty()).map(|(_, v)| v.into_owned())
        })
    });
    if let Some(origin) = from_query.filter(|o| is_http_origin(o)) {
        if let Err(error) = store.set(ORIGIN_OVERRIDE_KEY, &origin) {
            warn!(%error, "failed to persist gateway origin override");
        }
        return Some(origin);
    }
    match store.get(ORIGIN_OVERRIDE_KEY) {
        Ok(stored) => stored.filter(|o| is_http_origin(o)),
        Err(error) => {
            warn!(%error, "failed to read gateway origin override");
            None
        }
    }
}

/// Debug flag from `?presenceDebug=1|true` (persisted) or the store.
pub fn debug_flag(page_url: Option<&Url>, store: &dyn KeyValueStore) -> bool {
    let from_query = page_url
        .and_then(|url| url.query_pairs().find(|(k, _)| *k == DEBUG_KEY).map(|(_, v)| v.into_owned()));
    if from_query.as_deref().is_some_and(is_truthy) {
        if let Err(error) = store.set(DEBUG_KEY, "1") {
            warn!(%error, "failed to persist debug flag");
        }
        return true;
    }
    store.get(DEBUG_KEY).ok().flatten().as_deref().is_some_and(is_truthy)
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn page(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn resolves_ws_from_http_origin() {
        let resolver =
            OriginResolver::new(Some("https://gw.example.com".into()), page("http://site.test"));
        let url = resolver.resolve("/v1/ws", SchemeClass::Ws);
        assert_eq!(url.as_str(), "wss://gw.example.com/v1/ws");

        let url = resolver.resolve("/v1/metrics/online", SchemeClass::Http);
        assert_eq!(url.as_str(), "https://gw.example.com/v1/metrics/online");
    }

    #[test]
    fn plain_http_maps_to_ws() {
        let resolver = OriginResolver::new(None, page("http://localhost:3000"));
        let url = resolver.resolve("/v1/ws", SchemeClass::Ws);
        assert_eq!(url.as_str(), "ws://localhost:3000/v1/ws");
    }

    #[test]
    fn ws_origin_maps_back_to_http() {
        let resolver = OriginResolver::new(Some("wss://gw.test".into()), page("http://site.test"));
        let url = resolver.resolve("/v1/activity/rooms", SchemeClass::Http);
        assert_eq!(url.as_str(), "https://gw.test/v1/activity/rooms");
    }

    #[test]
    fn malformed_origin_falls_back_to_page_host() {
        let resolver = OriginResolver::new(Some("::nope::".into()), page("https://site.test:8443"));
        let url = resolver.resolve("/v1/ws", SchemeClass::Ws);
        assert_eq!(url.as_str(), "wss://site.test:8443/v1/ws");
    }

    #[test]
    fn query_override_is_persisted() {
        let store = MemoryStore::new();
        let url = page("https://site.test/post?gw=https://gw.other.test");
        assert_eq!(origin_override(Some(&url), &store).as_deref(), Some("https://gw.other.test"));

        // A later visit without the parameter keeps the override.
        assert_eq!(origin_override(None, &store).as_deref(), Some("https://gw.other.test"));
    }

    #[test]
    fn gateway_origin_param_takes_precedence() {
        let store = MemoryStore::new();
        let url = page("https://site.test/?gatewayOrigin=http://a.test&gw=http://b.test");
        assert_eq!(origin_override(Some(&url), &store).as_deref(), Some("http://a.test"));
    }

    #[test]
    fn non_http_override_is_ignored() {
        let store = MemoryStore::new();
        let url = page("https://site.test/?gw=javascript:alert(1)");
        assert_eq!(origin_override(Some(&url), &store), None);
        assert_eq!(store.get(ORIGIN_OVERRIDE_KEY).unwrap(), None);
    }

    #[test]
    fn debug_flag_from_query_persists() {
        let store = MemoryStore::new();
        assert!(!debug_flag(None, &store));
        assert!(debug_flag(Some(&page("https://site.test/?presenceDebug=true")), &store));
        assert!(debug_flag(None, &store));
    }

    #[test]
    fn debug_flag_reads_store() {
        let store = MemoryStore::with_entries([(DEBUG_KEY, "TRUE")]);
        assert!(debug_flag(None, &store));
        let store = MemoryStore::with_entries([(DEBUG_KEY, "0")]);
        assert!(!debug_flag(None, &store));
    }
}
