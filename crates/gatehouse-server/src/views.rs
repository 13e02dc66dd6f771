//! Server-rendered pages.

use gatehouse_auth::Session;
use serde_json::Value;

const STYLES: &str = r#"
body { font-family: system-ui, sans-serif; background: #f5f6fa; color: #1c1f40; margin: 0; }
.container { max-width: 640px; margin: 4rem auto; padding: 2rem; background: #fff; border-radius: 12px; }
.error { background: #fdecea; color: #a12622; padding: 0.75rem 1rem; border-radius: 8px; }
.button { display: inline-block; padding: 0.6rem 1.2rem; background: #3b3fe3; color: #fff; border-radius: 8px; text-decoration: none; }
table { border-collapse: collapse; width: 100%; margin: 1rem 0; }
td, th { text-align: left; padding: 0.4rem; border-bottom: 1px solid #e3e5ef; vertical-align: top; }
"#;

/// Generic message for an error code placed on the error redirect.
///
/// Unknown codes get the generic message; the code itself is never echoed.
pub fn error_message(code: &str) -> &'static str {
    match code {
        "invalid_state" => "Your sign-in attempt expired or could not be verified. Please try again.",
        "access_denied" => "Sign-in was cancelled.",
        "login_required" | "interaction_required" | "consent_required" => {
            "The identity provider needs you to sign in again."
        }
        "temporarily_unavailable" | "server_error" => {
            "Sign-in is temporarily unavailable. Please try again later."
        }
        _ => "We could not sign you in. Please try again.",
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn html_page(title: &str, content: &str) -> String {
    let mut html = String::with_capacity(content.len() + 1024);
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    html.push_str("    <meta charset=\"UTF-8\">\n");
    html.push_str("    <title>");
    html.push_str(&html_escape(title));
    html.push_str(" - Gatehouse</title>\n    <style>");
    html.push_str(STYLES);
    html.push_str("</style>\n</head>\n<body>\n    <div class=\"container\">\n");
    html.push_str(content);
    html.push_str("\n    </div>\n</body>\n</html>");
    html
}

/// Renders the public welcome page.
pub fn render_welcome(error_code: Option<&str>) -> String {
    let mut content = String::with_capacity(512);
    content.push_str("<h1>Welcome</h1>\n");
    if let Some(code) = error_code {
        content.push_str("<p class=\"error\">");
        content.push_str(error_message(code));
        content.push_str("</p>\n");
    }
    content.push_str("<p>Sign in with your organization account to continue.</p>\n");
    content.push_str("<a class=\"button\" href=\"/auth/login\">Sign in</a>");
    html_page("Welcome", &content)
}

fn claim_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Renders the dashboard for an established session.
pub fn render_dashboard(session: &Session) -> String {
    let mut content = String::with_capacity(2048);
    content.push_str("<h1>Hello, ");
    content.push_str(&html_escape(session.display_name()));
    content.push_str("</h1>\n<table>\n");
    for (name, value) in &session.claims {
        content.push_str("<tr><th>");
        content.push_str(&html_escape(name));
        content.push_str("</th><td>");
        content.push_str(&html_escape(&claim_text(value)));
        content.push_str("</td></tr>\n");
    }
    content.push_str("</table>\n<a class=\"button\" href=\"/auth/logout\">Sign out</a>");
    html_page("Dashboard", &content)
}
