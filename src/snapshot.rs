use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

/// Upper bound for [`DeviceSnapshot::describe`] output.
pub const DESCRIBE_MAX_CHARS: usize = 4000;

static NODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<node\b([^>]*?)/?>").expect("node pattern is valid")
});
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([\w:-]+)="([^"]*)""#).expect("attribute pattern is valid")
});
static BOUNDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]$").expect("bounds pattern is valid")
});

/// Screen size in pixels, written `1080x2400`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn center(&self) -> Point {
        Point::new(self.width as i32 / 2, self.height as i32 / 2)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w.trim().parse().map_err(|_| format!("bad width in {s:?}"))?;
        let height = h.trim().parse().map_err(|_| format!("bad height in {s:?}"))?;
        if width == 0 || height == 0 {
            return Err(format!("empty resolution {s:?}"));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// Absolute pixel position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Element rectangle as reported by the hierarchy dump: `[l,t][r,b]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn center(&self) -> Point {
        Point::new((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left && point.x < self.right && point.y >= self.top && point.y < self.bottom
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let caps = BOUNDS_RE.captures(raw.trim())?;
        let n = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok());
        Some(Self::new(n(1)?, n(2)?, n(3)?, n(4)?))
    }
}

/// One node of the UI hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiElement {
    pub resource_id: String,
    pub text: String,
    pub content_desc: String,
    pub class: String,
    pub bounds: Bounds,
    pub clickable: bool,
    pub focused: bool,
    pub selected: bool,
}

impl UiElement {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = id.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.content_desc = desc.into();
        self
    }

    pub fn with_bounds(mut self, left: i32, top: i32, right: i32, bottom: i32) -> Self {
        self.bounds = Bounds::new(left, top, right, bottom);
        self
    }

    pub fn clickable(mut self) -> Self {
        self.clickable = true;
        self
    }

    pub fn focused(mut self) -> Self {
        self.focused = true;
        self
    }

    pub fn selected(mut self) -> Self {
        self.selected = true;
        self
    }

    /// Matches the full resource id or its `:id/` suffix, so catalogs can
    /// name `search_tab` instead of `com.instagram.android:id/search_tab`.
    pub fn has_id(&self, id: &str) -> bool {
        if self.resource_id.is_empty() || id.is_empty() {
            return false;
        }
        self.resource_id == id
            || self
                .resource_id
                .rsplit_once(":id/")
                .is_some_and(|(_, short)| short == id)
    }

    /// Visible label: text first, accessibility description otherwise.
    pub fn label(&self) -> &str {
        if self.text.trim().is_empty() {
            self.content_desc.trim()
        } else {
            self.text.trim()
        }
    }

    pub fn is_editable(&self) -> bool {
        self.class.ends_with("EditText")
    }

    pub fn looks_like_button(&self) -> bool {
        self.clickable || self.class.ends_with("Button")
    }
}

/// Point-in-time capture of the UI hierarchy plus the screen size it was
/// taken at. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub resolution: Resolution,
    pub elements: Vec<UiElement>,
    pub captured_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn new(resolution: Resolution, elements: Vec<UiElement>) -> Self {
        Self {
            resolution,
            elements,
            captured_at: Utc::now(),
        }
    }

    /// Parse a `uiautomator dump` document. Trailing chatter after the XML
    /// (e.g. "UI hierchary dumped to: /dev/tty") is ignored.
    pub fn from_hierarchy_xml(xml: &str, resolution: Resolution) -> Result<Self, String> {
        if !xml.contains("<hierarchy") {
            let head: String = xml.chars().take(120).collect();
            return Err(format!("no <hierarchy> root in dump: {head:?}"));
        }

        let elements = NODE_RE
            .captures_iter(xml)
            .filter_map(|caps| caps.get(1))
            .map(|attrs| parse_node(attrs.as_str()))
            .collect();

        Ok(Self::new(resolution, elements))
    }

    pub fn find_by_id(&self, id: &str) -> Option<&UiElement> {
        self.elements.iter().find(|e| e.has_id(id))
    }

    pub fn has_id(&self, id: &str) -> bool {
        self.find_by_id(id).is_some()
    }

    /// First element whose text or description matches `pattern`.
    pub fn find_text(&self, pattern: &Regex) -> Option<&UiElement> {
        self.elements.iter().find(|e| {
            (!e.text.is_empty() && pattern.is_match(e.text.trim()))
                || (!e.content_desc.is_empty() && pattern.is_match(e.content_desc.trim()))
        })
    }

    pub fn focused_editable(&self) -> Option<&UiElement> {
        self.elements.iter().find(|e| e.is_editable() && e.focused)
    }

    pub fn has_editable(&self) -> bool {
        self.elements.iter().any(UiElement::is_editable)
    }

    /// Stable hash of everything observable on screen, ignoring capture time.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.resolution.hash(&mut hasher);
        for e in &self.elements {
            e.resource_id.hash(&mut hasher);
            e.text.hash(&mut hasher);
            e.content_desc.hash(&mut hasher);
            e.class.hash(&mut hasher);
            e.bounds.hash(&mut hasher);
            e.focused.hash(&mut hasher);
            e.selected.hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn same_screen(&self, other: &DeviceSnapshot) -> bool {
        self.fingerprint() == other.fingerprint()
    }

    /// Compact one-line-per-element rendering for logs and prompts.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, e) in self.elements.iter().enumerate() {
            let short_id = e
                .resource_id
                .rsplit_once(":id/")
                .map(|(_, s)| s)
                .unwrap_or(&e.resource_id);
            if short_id.is_empty() && e.label().is_empty() {
                continue;
            }
            let class = e.class.rsplit('.').next().unwrap_or(&e.class);
            let mut line = format!("[e{i}] {class}");
            if !short_id.is_empty() {
                line.push_str(&format!(" id={short_id}"));
            }
            if !e.label().is_empty() {
                line.push_str(&format!(" {:?}", e.label()));
            }
            if e.selected {
                line.push_str(" selected");
            }
            if e.focused {
                line.push_str(" focused");
            }
            line.push('\n');
            if out.len() + line.len() > DESCRIBE_MAX_CHARS {
                out.push_str(&format!("... [truncated, {} elements]", self.elements.len()));
                break;
            }
            out.push_str(&line);
        }
        out
    }
}

fn parse_node(attrs: &str) -> UiElement {
    let mut element = UiElement::default();
    for caps in ATTR_RE.captures_iter(attrs) {
        let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let value = unescape(value.as_str());
        match key.as_str() {
            "resource-id" => element.resource_id = value,
            "text" => element.text = value,
            "content-desc" => element.content_desc = value,
            "class" => element.class = value,
            "bounds" => element.bounds = Bounds::parse(&value).unwrap_or_default(),
            "clickable" => element.clickable = value == "true",
            "focused" => element.focused = value == "true",
            "selected" => element.selected = value == "true",
            _ => {}
        }
    }
    element
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation="0"><node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.instagram.android" content-desc="" clickable="false" focused="false" selected="false" bounds="[0,0][1080,2400]"><node index="0" text="" resource-id="com.instagram.android:id/search_tab" class="android.widget.FrameLayout" package="com.instagram.android" content-desc="Search and explore" clickable="true" focused="false" selected="true" bounds="[216,2148][432,2182]" /><node index="1" text="Tom &amp; Jerry" resource-id="com.instagram.android:id/row_search_user_username" class="android.widget.TextView" package="com.instagram.android" content-desc="" clickable="false" focused="false" selected="false" bounds="[0,428][1080,617]" /></node></hierarchy>UI hierchary dumped to: /dev/tty"#;

    #[test]
    fn parses_hierarchy_dump() {
        let snap = DeviceSnapshot::from_hierarchy_xml(DUMP, Resolution::new(1080, 2400)).unwrap();
        assert_eq!(snap.elements.len(), 3);

        let tab = snap.find_by_id("search_tab").unwrap();
        assert!(tab.selected);
        assert!(tab.clickable);
        assert_eq!(tab.bounds, Bounds::new(216, 2148, 432, 2182));
        assert_eq!(tab.bounds.center(), Point::new(324, 2165));
        assert_eq!(tab.label(), "Search and explore");

        let row = snap.find_by_id("com.instagram.android:id/row_search_user_username").unwrap();
        assert_eq!(row.text, "Tom & Jerry");
    }

    #[test]
    fn rejects_output_without_hierarchy() {
        let err = DeviceSnapshot::from_hierarchy_xml("ERROR: null root node", Resolution::new(1080, 2400));
        assert!(err.is_err());
    }

    #[test]
    fn resolution_parses_and_displays() {
        let r: Resolution = "1080x2400".parse().unwrap();
        assert_eq!(r, Resolution::new(1080, 2400));
        assert_eq!(r.to_string(), "1080x2400");
        assert!("1080".parse::<Resolution>().is_err());
        assert!("0x2400".parse::<Resolution>().is_err());
    }

    #[test]
    fn fingerprint_ignores_capture_time_but_not_state() {
        let a = DeviceSnapshot::new(
            Resolution::new(1080, 2400),
            vec![UiElement::new("android.widget.Button").with_text("Follow")],
        );
        let mut b = a.clone();
        b.captured_at = Utc::now() + chrono::Duration::seconds(5);
        assert!(a.same_screen(&b));

        b.elements[0].text = "Following".into();
        assert!(!a.same_screen(&b));
    }

    #[test]
    fn short_id_does_not_match_other_suffixes() {
        let e = UiElement::new("x").with_id("com.instagram.android:id/profile_tab");
        assert!(e.has_id("profile_tab"));
        assert!(!e.has_id("tab"));
        assert!(!UiElement::new("x").has_id(""));
    }
}
