use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, CellAlignment, Color as TableColor, ContentArrangement, Table};

use crate::records::{millis_to_seconds, BuildRecord, StageStatus};

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn color_coded_status_cell(status: StageStatus) -> Cell {
    let cell = Cell::new(status.as_label());
    match status {
        StageStatus::Success => cell.fg(TableColor::Green),
        StageStatus::Failure => cell.fg(TableColor::Red),
        StageStatus::Unstable => cell.fg(TableColor::Yellow),
        StageStatus::InProgress => cell.fg(TableColor::Cyan),
        StageStatus::Skipped | StageStatus::NotExecuted => cell.fg(TableColor::DarkGrey),
    }
}

/// Renders the stages of `build` in declaration order.
pub fn build_table(build: &BuildRecord) -> Table {
    let mut table = create_table();
    table.set_header(vec!["#", "Stage", "Status", "Duration"]);

    for stage in &build.stages {
        table.add_row(vec![
            Cell::new(stage.sequence_index).set_alignment(CellAlignment::Right),
            Cell::new(&stage.name),
            color_coded_status_cell(stage.status),
            Cell::new(format!("{:.1}s", millis_to_seconds(stage.duration_ms)))
                .set_alignment(CellAlignment::Right),
        ]);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{BuildStatus, StageRecord};

    #[test]
    fn test_build_table_lists_stages_in_order() {
        let build = BuildRecord {
            job_name: "app".to_string(),
            build_number: 4,
            overall_status: BuildStatus::Failure,
            overall_duration_ms: 61_000,
            started_at: None,
            stages: vec![
                StageRecord {
                    name: "Checkout".to_string(),
                    status: StageStatus::Success,
                    duration_ms: 1_500,
                    sequence_index: 0,
                },
                StageRecord {
                    name: "Test".to_string(),
                    status: StageStatus::Failure,
                    duration_ms: 59_500,
                    sequence_index: 1,
                },
            ],
        };

        let rendered = build_table(&build).to_string();
        let checkout = rendered.find("Checkout").unwrap();
        let test = rendered.find("Test").unwrap();

        assert!(checkout < test);
        assert!(rendered.contains("FAILURE"));
        assert!(rendered.contains("59.5s"));
        assert!(rendered.contains("1.5s"));
    }
}
