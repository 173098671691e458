use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::collections::BTreeMap;

static LOGIN_INPUT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("body > form > input").expect("Failed to parse login input selector"));

/// Hidden-field name → value pairs scraped from the login page.
pub type LoginFormTokens = BTreeMap<String, String>;

/// Extracts every `name`/`value` pair from the `<input>` elements of the login form.
/// Inputs without a name are skipped; a missing value becomes the empty string.
pub fn extract_login_tokens(html_content: &str) -> LoginFormTokens {
    let document = Html::parse_document(html_content);
    document
        .select(&LOGIN_INPUT_SELECTOR)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
