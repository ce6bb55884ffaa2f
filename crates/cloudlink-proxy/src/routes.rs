//! Request routing for paths the proxy answers itself

/// Core UI entry point the `/web/` shortcut redirects to
pub const CORE_UI_PATH: &str = "/endpoint/core/public/";

pub const OAUTH_CALLBACK_PATH: &str = "/web/oauth/callback";

const TEST_PORT_FORWARD_SUFFIX: &str = "/testPortForward";

/// Fixed component endpoints, rewritten to a constant internal path
const COMPONENTS: &[(&str, &str)] = &[
    ("/web/component/home/endpoint", "/endpoint/google-home/public/"),
    ("/web/component/alexa/endpoint", "/endpoint/alexa/public/"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// OAuth redirect landing
    OAuthCallback,
    /// 302 to the given location
    Redirect(String),
    /// Forward to a fixed internal path, ignoring the request path
    Component(&'static str),
    /// Answer with the port-forward test token
    TestPortForward,
    /// Forward unchanged
    Proxy,
}

/// Decide how to handle a non-upgrade request. Rules are checked in order.
pub fn route(path: &str, query: Option<&str>, public_hostname: Option<&str>) -> Route {
    let has_query = query.map(|q| !q.is_empty()).unwrap_or(false);

    if path == OAUTH_CALLBACK_PATH && has_query {
        return Route::OAuthCallback;
    }

    if path == "/web/" {
        return Route::Redirect(core_ui_location(public_hostname));
    }

    if let Some((_, target)) = COMPONENTS.iter().find(|(p, _)| *p == path) {
        return Route::Component(target);
    }

    if path.ends_with(TEST_PORT_FORWARD_SUFFIX) {
        return Route::TestPortForward;
    }

    Route::Proxy
}

/// Absolute when a public hostname is known so the browser lands on it
pub fn core_ui_location(public_hostname: Option<&str>) -> String {
    match public_hostname {
        Some(host) if !host.is_empty() => format!("https://{}{}", host, CORE_UI_PATH),
        _ => CORE_UI_PATH.to_string(),
    }
}
