//! Narrow HTML extraction seam for the console's pages.
//!
//! Everything the sign-in state machine and role operations need from the
//! markup goes through these four functions, so the rest of the client stays
//! markup-agnostic. The selectors are pinned to the console's current layout
//! and fail loudly when that layout changes.

use std::collections::HashMap;
use std::sync::LazyLock;

use scraper::{Html, Selector};

use super::error::ApiError;

/// The sign-in page's credential form.
pub const SIGN_IN_FORM_ID: &str = "new_user";

/// React component the console renders for the second-factor challenge.
const TWO_FACTOR_WIDGET: &str = "TwoFAWidget";

static FORM: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("form").expect("static selector"));
static HIDDEN_INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"input[type="hidden"]"#).expect("static selector"));
static CSRF_META: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="csrf-token"]"#).expect("static selector"));
static TWO_FACTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(&format!(r#"div[data-react-class="{TWO_FACTOR_WIDGET}"]"#))
        .expect("static selector")
});
static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("static selector"));

/// Collect the hidden input fields of the form with the given id, verbatim.
pub fn hidden_form_fields(
    html: &str,
    form_id: &str,
) -> Result<HashMap<String, String>, ApiError> {
    let document = Html::parse_document(html);
    let form = document
        .select(&FORM)
        .find(|f| f.value().attr("id") == Some(form_id))
        .ok_or(ApiError::MalformedPage("sign-in form not found"))?;

    let mut fields = HashMap::new();
    for input in form.select(&HIDDEN_INPUT) {
        if let (Some(name), Some(value)) =
            (input.value().attr("name"), input.value().attr("value"))
        {
            fields.insert(name.to_string(), value.to_string());
        }
    }
    Ok(fields)
}

/// Extract the CSRF token from the page's `<meta name="csrf-token">` tag.
pub fn csrf_meta_token(html: &str) -> Result<String, ApiError> {
    let document = Html::parse_document(html);
    document
        .select(&CSRF_META)
        .next()
        .and_then(|meta| meta.value().attr("content"))
        .map(str::to_string)
        .ok_or(ApiError::MalformedPage("csrf-token meta tag not found"))
}

/// Whether the page carries the second-factor challenge widget.
pub fn has_two_factor_challenge(html: &str) -> bool {
    Html::parse_document(html).select(&TWO_FACTOR).next().is_some()
}

/// Extract the page body, which must consist of exactly one text node.
/// The role-credentials endpoint serves the whole connection string this way.
pub fn body_text(html: &str) -> Result<String, ApiError> {
    let document = Html::parse_document(html);
    let body = document
        .select(&BODY)
        .next()
        .ok_or(ApiError::MalformedPage("page has no body"))?;

    let mut children = body.children();
    let only = children
        .next()
        .ok_or(ApiError::MalformedPage("credentials body is empty"))?;
    if children.next().is_some() {
        return Err(ApiError::MalformedPage(
            "credentials body has more than one node",
        ));
    }

    let text = only
        .value()
        .as_text()
        .ok_or(ApiError::MalformedPage("credentials body is not text"))?;
    Ok(text.trim().to_string())
}
