use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Enrolled,
    Transferred,
    Withdrawn,
    Suspended,
    Active,
    Failed,
    Approved,
    Completed,
    Inactive,
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Enrolled => "ENROLLED",
            Status::Transferred => "TRANSFERRED",
            Status::Withdrawn => "WITHDRAWN",
            Status::Suspended => "SUSPENDED",
            Status::Active => "ACTIVE",
            Status::Failed => "FAILED",
            Status::Approved => "APPROVED",
            Status::Completed => "COMPLETED",
            Status::Inactive => "INACTIVE",
            Status::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shift {
    Morning,
    Afternoon,
    Night,
    Full,
}

impl fmt::Display for Shift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Shift::Morning => "morning",
            Shift::Afternoon => "afternoon",
            Shift::Night => "night",
            Shift::Full => "full",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for Shift {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Ok(Shift::Morning),
            "afternoon" => Ok(Shift::Afternoon),
            "night" => Ok(Shift::Night),
            "full" => Ok(Shift::Full),
            other => Err(format!("unknown shift '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Segment {
    EarlyChildhood,
    #[serde(rename = "elementary-i")]
    ElementaryI,
    #[serde(rename = "elementary-ii")]
    ElementaryII,
    HighSchool,
}

impl Segment {
    /// Early childhood has no subject grades.
    pub fn has_subject_grades(self) -> bool {
        !matches!(self, Segment::EarlyChildhood)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentEntry {
    pub year: String,
    pub unit: String,
    pub grade_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_level_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<Segment>,
    #[serde(default)]
    pub school_class: String,
    pub shift: Shift,
    #[serde(default)]
    pub shift_inferred: bool,
    pub status: Status,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub business_code: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nationality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighborhood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mother_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub father_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardian_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardian_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_level_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<Shift>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Manual status set by the office; reconciliation never writes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_status: Option<Status>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub enrolled_years: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enrollment_history: Vec<EnrollmentEntry>,
}

impl StudentRecord {
    pub fn to_document(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn from_document(doc: &Map<String, Value>) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(doc.clone()))
    }

    /// Copy the newest history entry into the denormalized top-level fields.
    pub fn sync_snapshot(&mut self) {
        if let Some(current) = self.enrollment_history.first() {
            self.grade_level = Some(current.grade_level.clone());
            self.grade_level_code = current.grade_level_code.clone();
            self.shift = Some(current.shift);
            self.school_class = Some(current.school_class.clone()).filter(|c| !c.is_empty());
        }
    }
}

/// A student document as it exists in the store.
#[derive(Debug, Clone)]
pub struct StoredStudent {
    pub storage_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub record: StudentRecord,
    pub raw: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bimester {
    pub score: Option<f64>,
    pub makeup_score: Option<f64>,
    pub average: Option<f64>,
    pub absence_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeEntry {
    pub student_id: String,
    pub subject: String,
    pub year: String,
    pub bimesters: [Bimester; 4],
    pub annual_average: Option<f64>,
    pub final_average: Option<f64>,
    pub final_outcome: Option<String>,
}

impl GradeEntry {
    pub fn empty(student_id: &str, subject: &str, year: &str) -> Self {
        Self {
            student_id: student_id.to_string(),
            subject: subject.to_string(),
            year: year.to_string(),
            bimesters: Default::default(),
            annual_average: None,
            final_average: None,
            final_outcome: None,
        }
    }

    pub fn document_id(student_id: &str, subject: &str, year: &str) -> String {
        format!("{student_id}_{subject}_{year}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Students,
    Grades,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::Students => f.write_str("students"),
            Collection::Grades => f.write_str("grades"),
        }
    }
}

/// One idempotent store write. Creates set the whole document by key and
/// updates set field values, so re-applying either is harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Create {
        collection: Collection,
        id: String,
        document: Map<String, Value>,
    },
    Update {
        collection: Collection,
        id: String,
        fields: Map<String, Value>,
    },
    Delete {
        collection: Collection,
        id: String,
    },
}

impl Operation {
    pub fn id(&self) -> &str {
        match self {
            Operation::Create { id, .. } | Operation::Update { id, .. } | Operation::Delete { id, .. } => id,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Operation::Create { collection, .. }
            | Operation::Update { collection, .. }
            | Operation::Delete { collection, .. } => *collection,
        }
    }
}
