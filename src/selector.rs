//! Locator strategies.
//!
//! The target application's markup changes unpredictably between releases,
//! so a single selector is never trusted. Callers describe an element as an
//! ordered list of [`Strategy`] values ranked most-semantic-first: role/name
//! strategies survive cosmetic redesigns, structural CSS survives semantic
//! regressions. New fallbacks can be appended without touching call sites.

/// One way to locate a UI element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Accessible role plus a localized name pattern (case-insensitive
    /// regex alternation, e.g. `宛先|To`).
    Role { role: String, name: String },
    /// Attribute, placeholder or structural CSS. Comma lists are allowed.
    Css(String),
    /// Case-insensitive text content match.
    Text(String),
}

impl Strategy {
    pub fn role(role: impl Into<String>, name: impl Into<String>) -> Self {
        Strategy::Role {
            role: role.into(),
            name: name.into(),
        }
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Strategy::Css(selector.into())
    }

    pub fn text(needle: impl Into<String>) -> Self {
        Strategy::Text(needle.into())
    }

    /// The structural query used to enumerate candidates for this strategy.
    /// For role strategies the accessible-name filter is applied afterwards
    /// by the resolver.
    pub(crate) fn structural_css(&self) -> Option<String> {
        match self {
            Strategy::Role { role, .. } => Some(role_css(role)),
            Strategy::Css(sel) => Some(sel.clone()),
            Strategy::Text(_) => None,
        }
    }
}

/// Expand an accessible role into the CSS that enumerates its candidates.
fn role_css(role: &str) -> String {
    match role {
        "button" => "button, [role='button']".to_string(),
        "link" => "a, [role='link']".to_string(),
        "textbox" => "[role='textbox'], input, textarea".to_string(),
        "combobox" => "[role='combobox'], input[role='combobox']".to_string(),
        "option" => "[role='option']".to_string(),
        "listbox" => "[role='listbox']".to_string(),
        "menuitem" => "[role='menuitem']".to_string(),
        other => format!("[role='{other}']"),
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Role { role, name } => write!(f, "role:{role}|{name}"),
            Strategy::Css(sel) => write!(f, "css:{sel}"),
            Strategy::Text(t) => write!(f, "text:{t}"),
        }
    }
}

impl From<&str> for Strategy {
    /// Parse the compact `role:button|送信|Send`, `text:...`, `css:...`
    /// forms. Anything without a recognized prefix is treated as CSS.
    fn from(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix("role:") {
            let (role, name) = match rest.split_once('|') {
                Some((role, name)) => (role.trim(), name.trim()),
                None => (rest.trim(), ""),
            };
            return Strategy::role(role, name);
        }
        if let Some(rest) = s.strip_prefix("text:") {
            return Strategy::text(rest);
        }
        if let Some(rest) = s.strip_prefix("css:") {
            return Strategy::css(rest);
        }
        Strategy::css(s)
    }
}

/// An ordered, most-semantic-first fallback list.
pub type LocatorSpec = Vec<Strategy>;
