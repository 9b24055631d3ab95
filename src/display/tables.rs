//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::semantic::{HealthReport, ImportReport, thresholds};
use crate::vector::{ArticleId, SearchResult};

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.apply_modifier(UTF8_ROUND_CORNERS);
        Self { table }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        let header_cells: Vec<Cell> = headers
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect();
        self.table.set_header(header_cells);
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

fn score_color(score: f32) -> Color {
    if score >= thresholds::VERY_SIMILAR {
        Color::Green
    } else if score >= thresholds::SIMILAR {
        Color::Yellow
    } else {
        Color::Reset
    }
}

/// Create a table of ranked search results.
///
/// `title_of` supplies a title column when article texts are at hand.
pub fn create_results_table(
    results: &[SearchResult],
    title_of: Option<&dyn Fn(ArticleId) -> Option<String>>,
) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);

    let mut header = vec![
        Cell::new("#").add_attribute(Attribute::Bold),
        Cell::new("Article").add_attribute(Attribute::Bold),
        Cell::new("Score").add_attribute(Attribute::Bold),
    ];
    if title_of.is_some() {
        header.push(Cell::new("Title").add_attribute(Attribute::Bold));
    }
    table.set_header(header);

    for (rank, result) in results.iter().enumerate() {
        let score = result.score.get();
        let mut row = vec![
            Cell::new(rank + 1),
            Cell::new(result.article_id),
            Cell::new(format!("{score:.4}")).fg(score_color(score)),
        ];
        if let Some(title_of) = title_of {
            row.push(Cell::new(title_of(result.article_id).unwrap_or_default()));
        }
        table.add_row(row);
    }

    table.to_string()
}

/// Create a two-column table describing index health.
pub fn create_health_table(report: &HealthReport) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table.set_header(vec![
        Cell::new("Metric").add_attribute(Attribute::Bold),
        Cell::new("Value").add_attribute(Attribute::Bold),
    ]);

    let status = if report.consistent {
        Cell::new("consistent").fg(Color::Green)
    } else {
        Cell::new("inconsistent")
            .fg(Color::Red)
            .add_attribute(Attribute::Bold)
    };
    table.add_row(vec![Cell::new("Status"), status]);

    let layout = if report.flat {
        "flat".to_string()
    } else {
        format!("{} partitions", report.partitions)
    };
    let rows = [
        ("Articles stored", report.corpus_size.to_string()),
        ("Articles indexed", report.indexed.to_string()),
        ("Index version", report.index_version.to_string()),
        ("Layout", layout),
        ("Mutations since build", report.mutations_since_build.to_string()),
        ("Rebuild due", report.needs_rebuild.to_string()),
        ("Stale entries", report.stale_entries.to_string()),
        ("Pending removals", report.pending_removals.to_string()),
        (
            "Model",
            format!("{} ({}d, {})", report.model, report.dimension, report.metric),
        ),
        ("Vector log", format!("{} bytes", report.log_bytes)),
        ("Data directory", report.data_dir.display().to_string()),
    ];
    for (metric, value) in rows {
        table.add_row(vec![metric.to_string(), value]);
    }

    table.to_string()
}

/// Create a summary table for an import.
pub fn create_import_table(report: &ImportReport) -> String {
    TableBuilder::new()
        .set_headers(vec!["Outcome", "Articles"])
        .add_row(vec!["Indexed".to_string(), report.indexed.to_string()])
        .add_row(vec!["Unchanged".to_string(), report.unchanged.to_string()])
        .add_row(vec!["Removed".to_string(), report.removed.to_string()])
        .add_row(vec!["Failed".to_string(), report.failed.len().to_string()])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Score;

    #[test]
    fn test_table_builder() {
        let table = TableBuilder::new()
            .set_headers(vec!["Column 1", "Column 2"])
            .add_row(vec!["Value 1".to_string(), "Value 2".to_string()])
            .build();

        assert!(table.contains("Column 1"));
        assert!(table.contains("Value 1"));
    }

    #[test]
    fn test_results_table() {
        let results = vec![
            SearchResult::new(ArticleId::new(12).unwrap(), Score::from_similarity(0.91)),
            SearchResult::new(ArticleId::new(3).unwrap(), Score::from_similarity(0.42)),
        ];
        let title = |id: ArticleId| (id.get() == 12).then(|| "Reset password".to_string());
        let table = create_results_table(&results, Some(&title));

        assert!(table.contains("Reset password"));
        assert!(table.contains("0.9100"));
        assert!(table.contains("12"));

        let bare = create_results_table(&results, None);
        assert!(!bare.contains("Title"));
    }

    #[test]
    fn test_import_table() {
        let report = ImportReport {
            indexed: 5,
            unchanged: 2,
            removed: 1,
            failed: Vec::new(),
        };
        let table = create_import_table(&report);
        assert!(table.contains("Unchanged"));
        assert!(table.contains('5'));
    }
}
