//! Selector syntax: plain CSS, optionally narrowed by visible text.
//!
//! `button >> text=Next` matches the first `button` whose text contains
//! "Next". Sites in this space localize their buttons and rarely give them
//! stable ids, so text matching is the common case.

const TEXT_SEPARATOR: &str = ">> text=";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub css: String,
    pub text: Option<String>,
}

impl Selector {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(TEXT_SEPARATOR) {
            Some((css, text)) => {
                let css = css.trim();
                Self {
                    css: if css.is_empty() { "*".to_string() } else { css.to_string() },
                    text: Some(text.trim().to_string()).filter(|t| !t.is_empty()),
                }
            }
            None => Self {
                css: raw.trim().to_string(),
                text: None,
            },
        }
    }

    /// JavaScript expression resolving this selector to
    /// `{found, index, visible, enabled}`.
    pub fn locate_script(&self) -> String {
        let css = serde_json::to_string(&self.css).unwrap_or_else(|_| "\"*\"".to_string());
        let text = match &self.text {
            Some(t) => serde_json::to_string(t).unwrap_or_else(|_| "null".to_string()),
            None => "null".to_string(),
        };
        format!(
            r#"(() => {{
    const css = {css};
    const text = {text};
    const nodes = Array.from(document.querySelectorAll(css));
    const index = nodes.findIndex(n => text === null || (n.innerText || n.textContent || '').includes(text));
    if (index < 0) {{
        return {{ found: false, index: 0, visible: false, enabled: false }};
    }}
    const el = nodes[index];
    const style = window.getComputedStyle(el);
    const rect = el.getBoundingClientRect();
    const visible = style.display !== 'none' && style.visibility !== 'hidden' && rect.width > 0 && rect.height > 0;
    const cls = (el.getAttribute('class') || '').toLowerCase();
    const enabled = !el.disabled && el.getAttribute('aria-disabled') !== 'true' && !cls.includes('disabled');
    return {{ found: true, index, visible, enabled }};
}})()"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_css() {
        let sel = Selector::parse(".home_head_user_info");
        assert_eq!(sel.css, ".home_head_user_info");
        assert_eq!(sel.text, None);
    }

    #[test]
    fn test_parse_text_filter() {
        let sel = Selector::parse("button >> text=下一步");
        assert_eq!(sel.css, "button");
        assert_eq!(sel.text.as_deref(), Some("下一步"));

        let bare = Selector::parse(">> text=Ignore");
        assert_eq!(bare.css, "*");
    }

    #[test]
    fn test_locate_script_escapes_selector() {
        let sel = Selector::parse(r#"div[data-x="a"] >> text=it's"#);
        let script = sel.locate_script();
        assert!(script.contains(r#""div[data-x=\"a\"]""#));
        assert!(script.contains(r#""it's""#));
    }
}
