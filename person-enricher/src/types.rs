use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A person as submitted for enrichment, after validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRequest {
    pub name: String,
    pub surname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patronymic: Option<String>,
}

impl PersonRequest {
    pub fn new(name: &str, surname: &str, patronymic: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            surname: surname.to_owned(),
            patronymic: patronymic.map(str::to_owned),
        }
    }
}

/// An enriched person, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub id: Uuid,
    pub name: String,
    pub surname: String,
    pub patronymic: Option<String>,
    pub age: i32,
    pub gender: Gender,
    pub nationality: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = std::convert::Infallible;

    /// Anything we don't recognize maps to `Unknown`, rows written by older
    /// versions of the service included.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "male" => Gender::Male,
            "female" => Gender::Female,
            _ => Gender::Unknown,
        })
    }
}

/// Inclusive age bounds. A single age is expressed as `min == max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: i32,
    pub max: i32,
}

impl AgeRange {
    pub fn exact(age: i32) -> Self {
        Self { min: age, max: age }
    }
}

/// Sparse filter over persons. `None` means the field is not filtered on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub patronymic: Option<String>,
    pub age: Option<AgeRange>,
    pub gender: Option<Gender>,
    pub nationality: Option<String>,
}

/// Sparse set of changes to apply to a person. `None` leaves the field as it is.
///
/// `patronymic` carries a nested option so that "clear the patronymic"
/// (`Some(None)`) is distinguishable from "leave it alone" (`None`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSpec {
    pub name: Option<String>,
    pub surname: Option<String>,
    pub patronymic: Option<Option<String>>,
    pub age: Option<i32>,
    pub gender: Option<Gender>,
    pub nationality: Option<String>,
}

impl ChangeSpec {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.surname.is_none()
            && self.patronymic.is_none()
            && self.age.is_none()
            && self.gender.is_none()
            && self.nationality.is_none()
    }
}
