use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;
use crate::models::{EnrollmentEntry, Segment, Shift};
use crate::translate;

use crate::models::Segment::{ElementaryI as EF1, ElementaryII as EF2, HighSchool as EM};

const SUBJECTS: &[(&str, &str, &[Segment])] = &[
    ("portugues", "Língua Portuguesa", &[EF1, EF2, EM]),
    ("matematica", "Matemática", &[EF1, EF2, EM]),
    ("ciencias", "Ciências", &[EF1, EF2]),
    ("historia", "História", &[EF1, EF2, EM]),
    ("geografia", "Geografia", &[EF1, EF2, EM]),
    ("ingles", "Inglês", &[EF1, EF2, EM]),
    ("arte", "Arte", &[EF1, EF2, EM]),
    ("educacao-fisica", "Educação Física", &[EF1, EF2, EM]),
    ("ensino-religioso", "Ensino Religioso", &[EF1, EF2]),
    ("redacao", "Redação", &[EF2, EM]),
    ("espanhol", "Espanhol", &[EF2, EM]),
    ("fisica", "Física", &[EM]),
    ("quimica", "Química", &[EM]),
    ("biologia", "Biologia", &[EM]),
    ("filosofia", "Filosofia", &[EM]),
    ("sociologia", "Sociologia", &[EM]),
    ("literatura", "Literatura", &[EM]),
];

pub fn is_known_subject(id: &str) -> bool {
    SUBJECTS.iter().any(|(s, _, _)| *s == id)
}

pub fn subject_name(id: &str) -> Option<&'static str> {
    SUBJECTS.iter().find(|(s, _, _)| *s == id).map(|(_, name, _)| *name)
}

pub fn subjects_for_segment(segment: Segment) -> Vec<&'static str> {
    SUBJECTS
        .iter()
        .filter(|(_, _, segments)| segments.contains(&segment))
        .map(|(id, _, _)| *id)
        .collect()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MatrixSubject {
    pub subject: String,
    pub weekly_hours: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcademicMatrix {
    pub unit: String,
    pub shift: Shift,
    /// Sigla ("7A") or display label ("7º Ano - Fundamental II").
    pub grade: String,
    pub subjects: Vec<MatrixSubject>,
}

impl AcademicMatrix {
    pub fn weekly_hours(&self, subject: &str) -> Option<u32> {
        self.subjects
            .iter()
            .find(|s| s.subject == subject)
            .map(|s| s.weekly_hours)
    }

    /// None for unknown subjects and when the count does not fit in a u32.
    pub fn expected_classes(&self, subject: &str, weeks: u32) -> Option<u32> {
        self.weekly_hours(subject)?.checked_mul(weeks)
    }
}

pub fn attendance_percentage(absences: u32, expected_classes: u32) -> Option<f64> {
    if expected_classes == 0 {
        return None;
    }
    let attended = expected_classes as f64 - absences as f64;
    Some((attended * 100.0 / expected_classes as f64).clamp(0.0, 100.0))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MatrixKey {
    unit: String,
    shift: Shift,
    grade: String,
}

impl MatrixKey {
    fn new(unit: &str, shift: Shift, grade: &str) -> Self {
        Self {
            unit: translate::fold(unit),
            shift,
            grade: canonical_grade(grade),
        }
    }
}

fn canonical_grade(raw: &str) -> String {
    match translate::grade_from_label(raw) {
        Some(g) => g.code,
        None => translate::normalize_sigla(raw),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatrixIndex {
    entries: HashMap<MatrixKey, AcademicMatrix>,
}

impl MatrixIndex {
    pub fn new(matrices: Vec<AcademicMatrix>) -> Self {
        let mut entries = HashMap::new();
        for matrix in matrices {
            let key = MatrixKey::new(&matrix.unit, matrix.shift, &matrix.grade);
            if entries.insert(key, matrix).is_some() {
                warn!("duplicate academic matrix for the same unit, shift and grade; keeping the last");
            }
        }
        Self { entries }
    }

    /// Loads a JSON array of matrices.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let matrices: Vec<AcademicMatrix> = serde_json::from_str(&content)?;
        Ok(Self::new(matrices))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, unit: &str, shift: Shift, grade: &str) -> Option<&AcademicMatrix> {
        self.entries.get(&MatrixKey::new(unit, shift, grade))
    }
}

/// Subjects that need a grade document for this enrollment. Empty for early
/// childhood and for grades whose segment could not be resolved.
pub fn subjects_for(matrices: Option<&MatrixIndex>, entry: &EnrollmentEntry) -> Vec<String> {
    let Some(segment) = entry.segment else {
        warn!(grade = %entry.grade_level, "no segment for grade, skipping grade initialization");
        return Vec::new();
    };
    if !segment.has_subject_grades() {
        return Vec::new();
    }

    let grade = entry
        .grade_level_code
        .as_deref()
        .unwrap_or(entry.grade_level.as_str());
    if let Some(matrix) = matrices.and_then(|m| m.lookup(&entry.unit, entry.shift, grade)) {
        let mut subjects = Vec::new();
        for s in &matrix.subjects {
            if is_known_subject(&s.subject) {
                subjects.push(s.subject.clone());
            } else {
                warn!(subject = %s.subject, unit = %matrix.unit, grade = %matrix.grade, "matrix references unknown subject");
            }
        }
        return subjects;
    }

    subjects_for_segment(segment)
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;

    fn entry(code: &str, label: &str, segment: Segment) -> EnrollmentEntry {
        EnrollmentEntry {
            year: "2026".to_string(),
            unit: "Boa Vista".to_string(),
            grade_level: label.to_string(),
            grade_level_code: Some(code.to_string()),
            segment: Some(segment),
            school_class: "A".to_string(),
            shift: Shift::Morning,
            shift_inferred: false,
            status: Status::Enrolled,
        }
    }

    fn matrix(grade: &str) -> AcademicMatrix {
        AcademicMatrix {
            unit: "boa vista".to_string(),
            shift: Shift::Morning,
            grade: grade.to_string(),
            subjects: vec![
                MatrixSubject {
                    subject: "matematica".to_string(),
                    weekly_hours: 5,
                },
                MatrixSubject {
                    subject: "portugues".to_string(),
                    weekly_hours: 4,
                },
                MatrixSubject {
                    subject: "disciplina-removida".to_string(),
                    weekly_hours: 1,
                },
            ],
        }
    }

    #[test]
    fn lookup_matches_label_and_sigla_keys() {
        let index = MatrixIndex::new(vec![matrix("7º Ano - Fundamental II")]);
        assert!(index.lookup("Boa Vista", Shift::Morning, "7A").is_some());
        assert!(index.lookup("BOA VISTA", Shift::Morning, "7º ano - fundamental ii").is_some());
        assert!(index.lookup("Boa Vista", Shift::Afternoon, "7A").is_none());
    }

    #[test]
    fn matrix_subjects_drop_unknown_references() {
        let index = MatrixIndex::new(vec![matrix("7A")]);
        let subjects = subjects_for(Some(&index), &entry("7A", "7º Ano - Fundamental II", Segment::ElementaryII));
        assert_eq!(subjects, vec!["matematica", "portugues"]);
    }

    #[test]
    fn falls_back_to_segment_curriculum() {
        let subjects = subjects_for(None, &entry("1S", "1ª Série - Ensino Médio", Segment::HighSchool));
        assert!(subjects.contains(&"fisica".to_string()));
        assert!(!subjects.contains(&"ciencias".to_string()));
    }

    #[test]
    fn early_childhood_has_no_subjects() {
        let subjects = subjects_for(None, &entry("N3", "Nível III - Educação Infantil", Segment::EarlyChildhood));
        assert!(subjects.is_empty());
    }

    #[test]
    fn expected_classes_and_attendance() {
        let m = matrix("7A");
        assert_eq!(m.expected_classes("matematica", 10), Some(50));
        assert_eq!(m.expected_classes("quimica", 10), None);
        assert_eq!(m.expected_classes("matematica", u32::MAX), None);
        assert_eq!(attendance_percentage(5, 50), Some(90.0));
        assert_eq!(attendance_percentage(80, 50), Some(0.0));
        assert_eq!(attendance_percentage(0, 0), None);
    }
}
