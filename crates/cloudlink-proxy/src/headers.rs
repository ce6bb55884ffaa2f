//! Response header stamping and CORS

use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, VARY,
};

use crate::config::{AdvertisedAddresses, ListenerKind};

pub const CLOUD_HEADER: &str = "x-scrypted-cloud";
pub const DIRECT_ADDRESS_HEADER: &str = "x-scrypted-direct-address";
pub const CLOUD_ADDRESS_HEADER: &str = "x-scrypted-cloud-address";
pub const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";

const EXPOSED: &str = "X-Scrypted-Cloud, X-Scrypted-Direct-Address, X-Scrypted-Cloud-Address";

/// Stamp the reachability headers onto a response.
///
/// `X-Scrypted-Cloud` echoes the request's value when present, otherwise it
/// reflects whether the request arrived through the relay-facing listener.
pub fn stamp(
    headers: &mut HeaderMap,
    kind: ListenerKind,
    request_cloud: Option<HeaderValue>,
    addresses: &AdvertisedAddresses,
) {
    headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(EXPOSED));

    let cloud = request_cloud.unwrap_or_else(|| {
        HeaderValue::from_static(match kind {
            ListenerKind::Internal => "true",
            ListenerKind::Secure => "false",
        })
    });
    headers.insert(HeaderName::from_static(CLOUD_HEADER), cloud);

    set_optional(headers, DIRECT_ADDRESS_HEADER, addresses.direct_address.as_deref());
    set_optional(headers, CLOUD_ADDRESS_HEADER, addresses.cloud_address.as_deref());
}

fn set_optional(headers: &mut HeaderMap, name: &'static str, value: Option<&str>) {
    let name = HeaderName::from_static(name);
    match value.and_then(|v| HeaderValue::from_str(v).ok()) {
        Some(value) => {
            headers.insert(name, value);
        }
        None => {
            headers.remove(name);
        }
    }
}

/// Whether a browser origin may make credentialed requests
pub fn origin_allowed(origin: &str, addresses: &AdvertisedAddresses) -> bool {
    if addresses.cors_origins.iter().any(|o| o == origin) {
        return true;
    }
    let public = addresses
        .public_hostname
        .as_ref()
        .map(|h| format!("https://{}", h));
    let allowed = [
        addresses.cloud_address.as_deref(),
        addresses.direct_address.as_deref(),
        public.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|allowed| allowed.trim_end_matches('/') == origin);
    allowed
}

pub fn apply_cors(
    headers: &mut HeaderMap,
    origin: Option<&HeaderValue>,
    addresses: &AdvertisedAddresses,
) {
    let Some(origin) = origin else {
        return;
    };
    let Ok(origin_str) = origin.to_str() else {
        return;
    };
    if !origin_allowed(origin_str, addresses) {
        return;
    }

    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.append(VARY, HeaderValue::from_static("Origin"));
}
