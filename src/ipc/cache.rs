use std::collections::HashMap;

/// Ephemeral memoization of the heavy read views (calendar, dashboard,
/// tracking). Entries carry invalidation tags; every write invalidates the
/// affected user/track/period tags plus the coarse view families. Advisory
/// only: a cold cache is always correct, so nothing here is persisted.
#[derive(Default)]
pub struct ViewCache {
    entries: HashMap<String, CachedView>,
}

struct CachedView {
    tags: Vec<String>,
    value: serde_json::Value,
}

impl ViewCache {
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&mut self, key: String, tags: Vec<String>, value: serde_json::Value) {
        self.entries.insert(key, CachedView { tags, value });
    }

    pub fn invalidate_tags(&mut self, tags: &[String]) {
        self.entries
            .retain(|_, e| !e.tags.iter().any(|t| tags.contains(t)));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub fn user_tag(user_id: &str) -> String {
    format!("user:{}", user_id)
}

pub fn track_tag(track_id: &str) -> String {
    format!("track:{}", track_id)
}

pub fn period_tag(period_id: &str) -> String {
    format!("period:{}", period_id)
}

pub fn view_tag(view: &str) -> String {
    format!("view:{}", view)
}

/// Tag set a certification write touches: its own user/track/period plus the
/// coarse dashboard/calendar/tracking families.
pub fn write_tags(user_id: &str, track_id: &str, period_id: &str) -> Vec<String> {
    vec![
        user_tag(user_id),
        track_tag(track_id),
        period_tag(period_id),
        view_tag("dashboard"),
        view_tag("calendar"),
        view_tag("tracking"),
    ]
}
