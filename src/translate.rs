use tracing::warn;

use crate::models::{Segment, Shift, Status};

pub const MAPPING_VERSION: &str = "2025.1";

const STATUS_CODES: &[(&str, Status)] = &[
    ("01", Status::Enrolled),
    ("02", Status::Transferred),
    ("03", Status::Withdrawn),
    ("04", Status::Suspended),
    ("05", Status::Active),
    ("06", Status::Failed),
    ("07", Status::Approved),
    ("08", Status::Completed),
    ("09", Status::Inactive),
];

const GRADE_SIGLAS: &[(&str, &str, Segment)] = &[
    ("N2", "Nível II - Educação Infantil", Segment::EarlyChildhood),
    ("N3", "Nível III - Educação Infantil", Segment::EarlyChildhood),
    ("N4", "Nível IV - Educação Infantil", Segment::EarlyChildhood),
    ("N5", "Nível V - Educação Infantil", Segment::EarlyChildhood),
    ("1A", "1º Ano - Fundamental I", Segment::ElementaryI),
    ("2A", "2º Ano - Fundamental I", Segment::ElementaryI),
    ("3A", "3º Ano - Fundamental I", Segment::ElementaryI),
    ("4A", "4º Ano - Fundamental I", Segment::ElementaryI),
    ("5A", "5º Ano - Fundamental I", Segment::ElementaryI),
    ("6A", "6º Ano - Fundamental II", Segment::ElementaryII),
    ("7A", "7º Ano - Fundamental II", Segment::ElementaryII),
    ("8A", "8º Ano - Fundamental II", Segment::ElementaryII),
    ("9A", "9º Ano - Fundamental II", Segment::ElementaryII),
    ("1S", "1ª Série - Ensino Médio", Segment::HighSchool),
    ("2S", "2ª Série - Ensino Médio", Segment::HighSchool),
    ("3S", "3ª Série - Ensino Médio", Segment::HighSchool),
];

const SHIFT_TOKENS: &[(&str, Shift)] = &[
    ("M", Shift::Morning),
    ("MANHA", Shift::Morning),
    ("MATUTINO", Shift::Morning),
    ("T", Shift::Afternoon),
    ("TARDE", Shift::Afternoon),
    ("VESPERTINO", Shift::Afternoon),
    ("N", Shift::Night),
    ("NOITE", Shift::Night),
    ("NOTURNO", Shift::Night),
    ("I", Shift::Full),
    ("F", Shift::Full),
    ("INTEGRAL", Shift::Full),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeLabel {
    pub code: String,
    pub label: String,
    pub segment: Segment,
    /// Produced by the fallback heuristic rather than an exact table entry.
    pub inferred: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftValue {
    pub shift: Shift,
    pub inferred: bool,
}

/// Two-digit legacy status code to status. Single digits are left-padded.
pub fn status_from_code(code: &str) -> Status {
    let code = code.trim();
    let padded = if code.len() == 1 {
        format!("0{code}")
    } else {
        code.to_string()
    };
    match STATUS_CODES.iter().find(|(c, _)| *c == padded) {
        Some((_, status)) => *status,
        None => {
            if !code.is_empty() {
                warn!(code, "unknown legacy status code");
            }
            Status::Unknown
        }
    }
}

pub fn normalize_sigla(sigla: &str) -> String {
    sigla
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != 'º' && *c != 'ª')
        .collect::<String>()
        .to_uppercase()
}

pub fn grade_label_from_sigla(sigla: &str) -> Option<GradeLabel> {
    let code = normalize_sigla(sigla);
    if code.is_empty() {
        return None;
    }

    if let Some((c, label, segment)) = GRADE_SIGLAS.iter().find(|(c, _, _)| *c == code) {
        return Some(GradeLabel {
            code: c.to_string(),
            label: label.to_string(),
            segment: *segment,
            inferred: false,
        });
    }

    let guessed = infer_grade(&code);
    match &guessed {
        Some(g) => warn!(sigla = %code, label = %g.label, "grade sigla resolved by fallback heuristic"),
        None => warn!(sigla = %code, "unrecognized grade sigla"),
    }
    guessed
}

/// Fallback for siglas missing from the table. Only used after an exact
/// lookup fails.
fn infer_grade(code: &str) -> Option<GradeLabel> {
    let mut chars = code.chars();
    let first = chars.next()?;
    let second = chars.next();

    if first == 'N' {
        let level: String = code[1..].chars().take_while(|c| c.is_ascii_digit()).collect();
        if level.is_empty() {
            return None;
        }
        return Some(GradeLabel {
            code: code.to_string(),
            label: format!("Nível {level} - Educação Infantil"),
            segment: Segment::EarlyChildhood,
            inferred: true,
        });
    }

    let digit = first.to_digit(10)?;
    let (label, segment) = match (digit, second) {
        (d, Some('S')) => (format!("{d}ª Série - Ensino Médio"), Segment::HighSchool),
        (1..=5, Some(c)) if c.is_ascii_alphabetic() => {
            (format!("{digit}º Ano - Fundamental I"), Segment::ElementaryI)
        }
        (6..=9, Some(c)) if c.is_ascii_alphabetic() => {
            (format!("{digit}º Ano - Fundamental II"), Segment::ElementaryII)
        }
        _ => return None,
    };

    Some(GradeLabel {
        code: code.to_string(),
        label,
        segment,
        inferred: true,
    })
}

/// Reverse lookup from a display label to the table entry.
pub fn grade_from_label(label: &str) -> Option<GradeLabel> {
    let wanted = fold(label);
    GRADE_SIGLAS
        .iter()
        .find(|(_, l, _)| fold(l) == wanted)
        .map(|(c, l, s)| GradeLabel {
            code: c.to_string(),
            label: l.to_string(),
            segment: *s,
            inferred: false,
        })
}

/// Upper-case and strip Portuguese accents.
pub fn fold(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'Á' | 'À' | 'Â' | 'Ã' => 'A',
            'é' | 'ê' | 'É' | 'Ê' => 'E',
            'í' | 'Í' => 'I',
            'ó' | 'ô' | 'õ' | 'Ó' | 'Ô' | 'Õ' => 'O',
            'ú' | 'ü' | 'Ú' | 'Ü' => 'U',
            'ç' | 'Ç' => 'C',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

/// Map a free-text shift token. Unrecognized tokens fall back to the unit
/// default and are marked as inferred.
pub fn shift_from_token(token: &str, unit_default: Shift) -> ShiftValue {
    let folded = fold(token);
    if let Some((_, shift)) = SHIFT_TOKENS.iter().find(|(t, _)| *t == folded) {
        return ShiftValue {
            shift: *shift,
            inferred: false,
        };
    }
    if !folded.is_empty() {
        warn!(token, default = %unit_default, "unrecognized shift token, using unit default");
    }
    ShiftValue {
        shift: unit_default,
        inferred: true,
    }
}
