//! Renders the browser service worker equivalent to a [`WorkerConfig`].
//!
//! The generated script follows the same install, activate and fetch rules as
//! [`ServiceWorker`](crate::ServiceWorker), so a site can be deployed with the
//! browser worker and tested against the native one.

use std::fmt::Write as _;

use crate::config::{FallbackPolicy, Strategy, WorkerConfig};
use crate::error::Result;

/// Encodes a value as a JavaScript literal.
fn js<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Returns the service worker JavaScript for `config`.
///
/// # Errors
///
/// Returns an error if a configured string cannot be encoded.
pub fn render(config: &WorkerConfig) -> Result<String> {
    let mut out = String::with_capacity(4096);

    let _ = writeln!(out, "// {} service worker, generated by octo-sw", config.version);
    let _ = writeln!(out, "const CACHE_NAME = {};", js(&config.version)?);
    let _ = writeln!(out, "const PRECACHE = {};", js(&config.precache)?);
    let _ = writeln!(out, "const FALLBACK = {};", js(&config.fallback)?);
    let _ = writeln!(out, "const NETWORK_ONLY = {};", js(&config.network_only)?);
    out.push('\n');

    let skip_waiting = if config.skip_waiting {
        "\n  self.skipWaiting();"
    } else {
        ""
    };
    let _ = write!(
        out,
        r"self.addEventListener('install', function(event) {{
  event.waitUntil(
    caches.open(CACHE_NAME).then(function(cache) {{
      return cache.addAll(PRECACHE);
    }})
  );{skip_waiting}
}});

self.addEventListener('activate', function(event) {{
  event.waitUntil(
    caches.keys().then(function(names) {{
      return Promise.all(
        names.filter(function(n) {{ return n !== CACHE_NAME; }})
             .map(function(n) {{ return caches.delete(n); }})
      );
    }})
  );
  self.clients.claim();
}});

"
    );

    out.push_str(
        r"function offline() {
  return new Response('Offline', {
    status: 503,
    headers: { 'Content-Type': 'text/plain; charset=utf-8' }
  });
}

function store(request, response) {
  if (request.method === 'GET' && response.ok &&
      new URL(response.url).origin === self.location.origin) {
    var clone = response.clone();
    caches.open(CACHE_NAME).then(function(cache) {
      return cache.put(request, clone);
    }).catch(function() {});
  }
  return response;
}

",
    );

    let fallback = match config.fallback_policy {
        FallbackPolicy::All => {
            "function fallback(request) {\n  return caches.match(FALLBACK).then(function(cached) {\n    return cached || offline();\n  });\n}\n"
        }
        FallbackPolicy::Navigation => {
            "function fallback(request) {\n  if (request.mode !== 'navigate') {\n    return Promise.resolve(offline());\n  }\n  return caches.match(FALLBACK).then(function(cached) {\n    return cached || offline();\n  });\n}\n"
        }
        FallbackPolicy::Never => {
            "function fallback(request) {\n  return Promise.resolve(offline());\n}\n"
        }
    };
    out.push_str(fallback);
    out.push('\n');

    let on_hit = match config.strategy {
        Strategy::CacheFirst => "return cached;",
        Strategy::StaleWhileRevalidate => {
            "fetch(event.request).then(function(response) {\n          store(event.request, response);\n        }).catch(function() {});\n        return cached;"
        }
    };
    let _ = write!(
        out,
        r"self.addEventListener('fetch', function(event) {{
  var url = new URL(event.request.url);

  if (url.origin === self.location.origin &&
      NETWORK_ONLY.some(function(p) {{ return url.pathname.startsWith(p); }})) {{
    event.respondWith(fetch(event.request).catch(offline));
    return;
  }}

  event.respondWith(
    caches.match(event.request).then(function(cached) {{
      if (cached) {{
        {on_hit}
      }}
      return fetch(event.request).then(function(response) {{
        return store(event.request, response);
      }}).catch(function() {{
        return fallback(event.request);
      }});
    }})
  );
}});
"
    );

    Ok(out)
}
