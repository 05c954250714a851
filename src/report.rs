use std::collections::BTreeMap;
use std::fmt::Write;

use crate::curriculum;
use crate::models::{Collection, Operation};
use crate::parser::ParseReport;
use crate::reconcile::Plan;
use crate::translate;
use crate::writer::WriteSummary;

/// Operation counts per (collection, kind).
pub fn summarize_operations(ops: &[Operation]) -> BTreeMap<(String, &'static str), usize> {
    let mut map = BTreeMap::new();
    for op in ops {
        let kind = match op {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        };
        *map.entry((op.collection().to_string(), kind)).or_insert(0) += 1;
    }
    map
}

fn write_parse_section(output: &mut String, label: &str, report: &ParseReport) {
    let _ = writeln!(
        output,
        "- {}: {} rows, {} skipped (encoding {}{})",
        label,
        report.rows.len(),
        report.skipped.len(),
        report.encoding.unwrap_or("unknown"),
        if report.suspicious_chars > 0 {
            format!(", {} garbled characters", report.suspicious_chars)
        } else {
            String::new()
        }
    );
    for skip in report.skipped.iter().take(20) {
        let _ = writeln!(output, "  - line {}: {}", skip.line, skip.reason);
    }
    if report.skipped.len() > 20 {
        let _ = writeln!(output, "  - ... {} more", report.skipped.len() - 20);
    }
}

pub fn build_plan_report(plan: &Plan, inputs: &[(&str, &ParseReport)]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Reconciliation Plan");
    let _ = writeln!(output, "Unit: {}", plan.unit);
    let _ = writeln!(output, "Code mappings: {}", translate::MAPPING_VERSION);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Inputs");
    for (label, report) in inputs {
        write_parse_section(&mut output, label, report);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Operations");
    if plan.is_empty() {
        let _ = writeln!(output, "Store already matches the legacy data. Nothing to write.");
    } else {
        for ((collection, kind), count) in summarize_operations(&plan.operations) {
            let _ = writeln!(output, "- {collection} {kind}: {count}");
        }
    }
    let _ = writeln!(
        output,
        "- students: {} new, {} updated, {} unchanged; {} grade documents",
        plan.students_created, plan.students_updated, plan.students_unchanged, plan.grades_created
    );

    let mut per_subject: BTreeMap<&str, usize> = BTreeMap::new();
    for op in &plan.operations {
        if let Operation::Create {
            collection: Collection::Grades,
            document,
            ..
        } = op
        {
            if let Some(subject) = document.get("subject").and_then(|v| v.as_str()) {
                *per_subject.entry(subject).or_insert(0) += 1;
            }
        }
    }
    if !per_subject.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Grade Initialization");
        for (subject, count) in per_subject {
            let name = curriculum::subject_name(subject).unwrap_or(subject);
            let _ = writeln!(output, "- {name}: {count}");
        }
    }

    if !plan.deletions.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Duplicate Resolution");
        for d in &plan.deletions {
            let _ = writeln!(
                output,
                "- delete {} {} (code {}), keeping {}",
                d.collection, d.storage_id, d.business_code, d.survivor
            );
            if d.collection == Collection::Students {
                let _ = writeln!(output, "  - before: {}", d.before);
            }
        }
    }

    if !plan.changes.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Field Changes");
        for c in &plan.changes {
            let _ = writeln!(
                output,
                "- {} (code {}) {}: {} -> {}",
                c.storage_id, c.business_code, c.field, c.before, c.after
            );
        }
    }

    if !plan.orphan_enrollments.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Enrollments Without Student");
        let _ = writeln!(output, "{}", plan.orphan_enrollments.join(", "));
    }

    output
}

pub fn build_write_report(summary: &WriteSummary) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "## Write Summary");
    for chunk in &summary.chunks {
        let _ = writeln!(
            output,
            "- chunk {}: {} operations, {} attempt(s), {}",
            chunk.index,
            chunk.size,
            chunk.attempts,
            match &chunk.error {
                None => "committed".to_string(),
                Some(e) => format!("FAILED: {e}"),
            }
        );
    }
    let _ = writeln!(
        output,
        "Committed {} of {} chunks: {} created, {} updated, {} deleted ({} total)",
        summary.committed_chunks().len(),
        summary.planned_chunks,
        summary.tally.created,
        summary.tally.updated,
        summary.tally.deleted,
        summary.tally.total()
    );
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::FieldChange;
    use crate::writer::{ChunkReport, Tally};
    use serde_json::{json, Map};

    #[test]
    fn plan_report_lists_changes_and_counts() {
        let plan = Plan {
            unit: "Boa Vista".to_string(),
            operations: vec![
                Operation::Update {
                    collection: Collection::Students,
                    id: "boa-vista_1".to_string(),
                    fields: Map::new(),
                },
                Operation::Create {
                    collection: Collection::Grades,
                    id: "boa-vista_1_educacao-fisica_2026".to_string(),
                    document: json!({"studentId": "boa-vista_1", "subject": "educacao-fisica"})
                        .as_object()
                        .cloned()
                        .unwrap(),
                },
            ],
            changes: vec![FieldChange {
                storage_id: "boa-vista_1".to_string(),
                business_code: "1".to_string(),
                field: "city".to_string(),
                before: json!("Natal"),
                after: json!("Parnamirim"),
            }],
            students_updated: 1,
            grades_created: 1,
            ..Default::default()
        };
        let parsed = ParseReport::default();
        let report = build_plan_report(&plan, &[("students", &parsed)]);
        assert!(report.contains("- students update: 1"));
        assert!(report.contains("- grades create: 1"));
        assert!(report.contains("city: \"Natal\" -> \"Parnamirim\""));
        assert!(report.contains("## Grade Initialization\n- Educação Física: 1"));
    }

    #[test]
    fn write_report_shows_failed_chunk() {
        let summary = WriteSummary {
            chunks: vec![
                ChunkReport {
                    index: 0,
                    size: 400,
                    attempts: 1,
                    committed: true,
                    error: None,
                },
                ChunkReport {
                    index: 1,
                    size: 400,
                    attempts: 4,
                    committed: false,
                    error: Some("store error: timeout".to_string()),
                },
            ],
            tally: Tally {
                created: 400,
                updated: 0,
                deleted: 0,
            },
            planned_chunks: 3,
        };
        let report = build_write_report(&summary);
        assert!(report.contains("chunk 1: 400 operations, 4 attempt(s), FAILED: store error: timeout"));
        assert!(report.contains("Committed 1 of 3 chunks"));
    }
}
