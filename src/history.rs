use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::models::{EnrollmentEntry, Shift, Status};
use crate::parser::Row;
use crate::translate;

pub const STUDENT_CODE_COLUMNS: &[&str] = &["COD_ALUNO", "CODIGO", "CD_ALUNO", "MATRICULA"];
const YEAR_COLUMNS: &[&str] = &["ANO", "ANO_LETIVO", "PERIODO"];
const GRADE_COLUMNS: &[&str] = &["SERIE", "SIGLA_SERIE", "COD_SERIE", "CURSO"];
const CLASS_COLUMNS: &[&str] = &["TURMA", "CLASSE"];
const SHIFT_COLUMNS: &[&str] = &["TURNO", "PERIODO_AULA"];
const STATUS_COLUMNS: &[&str] = &["SITUACAO", "COD_SITUACAO", "STATUS"];
const UNIT_COLUMNS: &[&str] = &["UNIDADE", "ESCOLA"];

#[derive(Debug, Clone, PartialEq)]
pub struct StudentHistory {
    pub business_code: String,
    /// Newest first.
    pub history: Vec<EnrollmentEntry>,
    pub enrolled_years: BTreeSet<String>,
}

impl StudentHistory {
    pub fn current(&self) -> Option<&EnrollmentEntry> {
        self.history.first()
    }
}

/// Which years count as "current" when deriving the top-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolicy {
    pub current_year: i32,
    /// Number of most recent academic years treated as current (2 means this
    /// year and last year). Later years, such as pre-enrollments for next
    /// year, are current as well.
    pub recent_window: i32,
}

impl StatusPolicy {
    pub fn is_recent(&self, year: &str) -> bool {
        match year_number(year) {
            Some(y) => y > self.current_year - self.recent_window,
            None => false,
        }
    }
}

/// Drop any sub-period suffix ("2024.1" -> "2024").
pub fn normalize_year(raw: &str) -> Option<String> {
    let base = raw.trim().split(['.', '/', '-']).next()?.trim();
    if base.len() == 4 && base.chars().all(|c| c.is_ascii_digit()) {
        Some(base.to_string())
    } else {
        None
    }
}

fn year_number(year: &str) -> Option<i32> {
    year.trim().parse().ok()
}

/// Newest year first; unparseable years sink to the end.
pub fn sort_history(entries: &mut [EnrollmentEntry]) {
    entries.sort_by(|a, b| year_number(&b.year).cmp(&year_number(&a.year)));
}

pub fn entry_from_row(row: &Row, unit: &str, default_shift: Shift) -> Option<(String, EnrollmentEntry)> {
    let code = row.get_any(STUDENT_CODE_COLUMNS)?.to_string();
    let Some(year) = row.get_any(YEAR_COLUMNS).and_then(normalize_year) else {
        warn!(line = row.line, business_code = %code, "enrollment row without a usable year");
        return None;
    };

    let raw_grade = row.get_any(GRADE_COLUMNS).unwrap_or("");
    let grade = translate::grade_from_label(raw_grade)
        .or_else(|| translate::grade_label_from_sigla(raw_grade));
    let (grade_level, grade_level_code, segment) = match grade {
        Some(g) => (g.label, Some(g.code), Some(g.segment)),
        None => (raw_grade.to_string(), None, None),
    };

    let shift = translate::shift_from_token(row.get_any(SHIFT_COLUMNS).unwrap_or(""), default_shift);
    let status = translate::status_from_code(row.get_any(STATUS_COLUMNS).unwrap_or(""));

    Some((
        code,
        EnrollmentEntry {
            year,
            unit: row.get_any(UNIT_COLUMNS).unwrap_or(unit).to_string(),
            grade_level,
            grade_level_code,
            segment,
            school_class: row.get_any(CLASS_COLUMNS).unwrap_or("").to_uppercase(),
            shift: shift.shift,
            shift_inferred: shift.inferred,
            status,
        },
    ))
}

/// Group enrollment rows by student code. Within one student a later row for
/// the same year replaces the earlier one.
pub fn aggregate(rows: &[Row], unit: &str, default_shift: Shift) -> BTreeMap<String, StudentHistory> {
    let mut by_code: BTreeMap<String, BTreeMap<String, EnrollmentEntry>> = BTreeMap::new();

    for row in rows {
        let Some((code, entry)) = entry_from_row(row, unit, default_shift) else {
            continue;
        };
        let years = by_code.entry(code.clone()).or_default();
        if years.insert(entry.year.clone(), entry).is_some() {
            debug!(business_code = %code, line = row.line, "later enrollment row replaced same-year entry");
        }
    }

    by_code
        .into_iter()
        .map(|(code, years)| {
            let enrolled_years = years.keys().cloned().collect();
            let mut history: Vec<EnrollmentEntry> = years.into_values().collect();
            sort_history(&mut history);
            (
                code.clone(),
                StudentHistory {
                    business_code: code,
                    history,
                    enrolled_years,
                },
            )
        })
        .collect()
}

/// Top-level status of a student.
///
/// An administrative status always wins. Otherwise the newest entry inside
/// the recent window gives the status; any older history means COMPLETED and
/// no history at all means INACTIVE.
pub fn derive_status(history: &[EnrollmentEntry], admin: Option<Status>, policy: StatusPolicy) -> Status {
    if let Some(status) = admin {
        return status;
    }
    if let Some(recent) = history.iter().find(|e| policy.is_recent(&e.year)) {
        return recent.status;
    }
    if history.is_empty() {
        Status::Inactive
    } else {
        Status::Completed
    }
}
