use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Never dropped, even when a client lists them in `Connection`.
const END_TO_END: &[&str] = &["host", "content-length"];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Removes connection-scoped headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let mut doomed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .filter(|name| !END_TO_END.contains(&name.as_str()))
        .collect();

    doomed.extend(headers.keys().filter(|name| is_hop_by_hop(name)).cloned());

    for name in doomed {
        headers.remove(name);
    }
}

/// Appends the client to `X-Forwarded-For` and records the original proto and host.
pub fn add_forwarded_headers(headers: &mut HeaderMap, client_ip: &str, original_host: Option<&HeaderValue>) {
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    if !headers.contains_key("x-forwarded-proto") {
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    }

    if let Some(host) = original_host {
        if !headers.contains_key("x-forwarded-host") {
            headers.insert("x-forwarded-host", host.clone());
        }
    }
}
