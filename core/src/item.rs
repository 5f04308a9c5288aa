/// Group id of items that belong to no user category.
pub const UNGROUPED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClipKind {
    Text,
    Rtf,
    Image,
    FileList,
    Color,
    Link,
}

impl ClipKind {
    /// Extraction preference, richest representation first.
    pub const CAPTURE_PRIORITY: [ClipKind; 6] = [
        ClipKind::Rtf,
        ClipKind::Text,
        ClipKind::Image,
        ClipKind::FileList,
        ClipKind::Color,
        ClipKind::Link,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClipKind::Text => "text",
            ClipKind::Rtf => "rtf",
            ClipKind::Image => "image",
            ClipKind::FileList => "files",
            ClipKind::Color => "color",
            ClipKind::Link => "link",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ClipKind::Text),
            "rtf" => Some(ClipKind::Rtf),
            "image" => Some(ClipKind::Image),
            "files" => Some(ClipKind::FileList),
            "color" => Some(ClipKind::Color),
            "link" => Some(ClipKind::Link),
            _ => None,
        }
    }

    /// Kinds whose payload is a UTF-8 string.
    pub fn is_text_like(&self) -> bool {
        !matches!(self, ClipKind::Image)
    }

    /// Only plain and rich text rows accept in-place content edits.
    pub fn is_editable(&self) -> bool {
        matches!(self, ClipKind::Text | ClipKind::Rtf)
    }
}

/// One historical clipboard entry. `id` is assigned by the store on insert.
#[derive(Debug, Clone)]
pub struct ClipItem {
    pub id: Option<i64>,
    pub unique_id: String,
    pub kind: ClipKind,
    pub data: Vec<u8>,
    pub show_data: Option<Vec<u8>>,
    pub timestamp: i64,
    pub app_path: String,
    pub app_name: String,
    pub search_text: String,
    pub length: i64,
    pub group: i64,
    pub tag: Option<String>,
}

/// A category label. System chips use fixed non-positive ids and cannot be
/// renamed or deleted; user chips get incrementing positive ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chip {
    pub id: i64,
    pub name: String,
    pub color: String,
    pub is_system: bool,
}

/// Compound history filter. Facets compose with AND; values within a facet
/// compose with OR.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub group: Option<i64>,
    pub kinds: Vec<ClipKind>,
    pub apps: Vec<String>,
    pub tags: Vec<String>,
    pub query: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

impl HistoryFilter {
    pub fn is_empty(&self) -> bool {
        *self == HistoryFilter::default()
    }

    /// Local membership check, kept semantically in lockstep with the SQL
    /// clause the store builds for the same filter.
    pub fn matches(&self, item: &ClipItem) -> bool {
        if let Some(group) = self.group {
            if item.group != group {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&item.kind) {
            return false;
        }
        if !self.apps.is_empty() && !self.apps.iter().any(|a| a == &item.app_name) {
            return false;
        }
        if !self.tags.is_empty() {
            match &item.tag {
                Some(tag) if self.tags.contains(tag) => {}
                _ => return false,
            }
        }
        if let Some(query) = &self.query {
            if !query.is_empty()
                && !item
                    .search_text
                    .to_lowercase()
                    .contains(&query.to_lowercase())
            {
                return false;
            }
        }
        if let Some(since) = self.since {
            if item.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if item.timestamp >= until {
                return false;
            }
        }
        true
    }
}

/// Normalized plain-text projection used for substring filtering, plus the
/// logical character length.
pub fn text_projection(text: &str) -> (String, i64) {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (normalized, text.chars().count() as i64)
}

/// Truncated render payload for previews, respecting char boundaries.
pub fn preview_bytes(text: &str, max_chars: usize) -> Option<Vec<u8>> {
    if text.chars().count() <= max_chars {
        return None;
    }
    Some(text.chars().take(max_chars).collect::<String>().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: ClipKind, text: &str, app: &str, group: i64) -> ClipItem {
        let (search_text, length) = text_projection(text);
        ClipItem {
            id: Some(1),
            unique_id: format!("u-{}", text),
            kind,
            data: text.as_bytes().to_vec(),
            show_data: None,
            timestamp: 100,
            app_path: String::new(),
            app_name: app.to_string(),
            search_text,
            length,
            group,
            tag: Some("t".to_string()),
        }
    }

    #[test]
    fn kind_round_trips() {
        for kind in ClipKind::CAPTURE_PRIORITY {
            assert_eq!(ClipKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ClipKind::parse("bogus"), None);
    }

    #[test]
    fn filter_facets_compose_with_and() {
        let it = item(ClipKind::Text, "hello world", "Notes", UNGROUPED);

        let mut filter = HistoryFilter::default();
        assert!(filter.matches(&it));

        filter.kinds = vec![ClipKind::Text, ClipKind::Rtf];
        filter.apps = vec!["Mail".to_string(), "Notes".to_string()];
        filter.query = Some("WORLD".to_string());
        assert!(filter.matches(&it));

        filter.group = Some(3);
        assert!(!filter.matches(&it));
    }

    #[test]
    fn filter_date_range_is_half_open() {
        let it = item(ClipKind::Text, "x", "Notes", UNGROUPED);
        let mut filter = HistoryFilter {
            since: Some(100),
            until: Some(101),
            ..Default::default()
        };
        assert!(filter.matches(&it));
        filter.until = Some(100);
        assert!(!filter.matches(&it));
    }

    #[test]
    fn projection_collapses_whitespace() {
        let (search, length) = text_projection("a\n\tb  c");
        assert_eq!(search, "a b c");
        assert_eq!(length, 7);
    }

    #[test]
    fn preview_only_for_long_text() {
        assert_eq!(preview_bytes("short", 10), None);
        let p = preview_bytes("ééééé", 3).unwrap();
        assert_eq!(String::from_utf8(p).unwrap(), "ééé");
    }
}
