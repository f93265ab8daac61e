//! Default weekly rollup: entry count, top emotions, top triggers, busiest hour.

use async_trait::async_trait;
use chrono::Timelike;
use std::collections::HashMap;
use std::sync::Arc;

use emojournal_core::error::Result;
use emojournal_core::traits::{SummaryGenerator, UserStore};
use emojournal_core::types::Entry;

const TOP_LIMIT: usize = 5;

pub struct EntryDigest {
    store: Arc<dyn UserStore>,
}

impl EntryDigest {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SummaryGenerator for EntryDigest {
    async fn generate(&self, user_id: i64, days: u32) -> Result<String> {
        let entries = self.store.get_user_entries(user_id, days).await?;
        Ok(render(&entries, days))
    }
}

/// Render the rollup for `entries` (any order).
pub fn render(entries: &[Entry], days: u32) -> String {
    if entries.is_empty() {
        return format!("📊 За последние {days} дн. записей нет.\n\n<i>Используй /note, чтобы отметить эмоцию.</i>");
    }

    let emotions = top_items(
        entries
            .iter()
            .flat_map(|e| e.emotions.iter())
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty()),
    );
    // Words longer than three chars, as a rough trigger signal.
    let triggers = top_items(
        entries
            .iter()
            .filter_map(|e| e.cause.as_deref())
            .flat_map(|c| c.split_whitespace())
            .map(str::to_lowercase)
            .filter(|w| w.chars().count() > 3),
    );

    let mut by_hour: HashMap<u32, usize> = HashMap::new();
    for entry in entries {
        *by_hour.entry(entry.ts_local.hour()).or_default() += 1;
    }
    let peak_hour = by_hour
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(h, _)| *h)
        .unwrap_or(12);

    format!(
        "📊 <b>Сводка за {days} дн.</b>\n\n\
         <b>🎭 Эмоции:</b> {}\n\n\
         <b>🔍 Причины:</b> {}\n\n\
         <b>⏰ Пик активности:</b> {:02}:00\n\n\
         <b>📈 Всего записей:</b> {}",
        format_list(&emotions),
        format_list(&triggers),
        peak_hour,
        entries.len(),
    )
}

fn top_items(items: impl Iterator<Item = String>) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for item in items {
        *counts.entry(item).or_default() += 1;
    }
    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.truncate(TOP_LIMIT);
    sorted
}

fn format_list(items: &[(String, usize)]) -> String {
    if items.is_empty() {
        return "нет данных".to_string();
    }
    items
        .iter()
        .map(|(name, n)| format!("{name} ({n})"))
        .collect::<Vec<_>>()
        .join(", ")
}
