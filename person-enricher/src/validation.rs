use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::types::PersonRequest;

/// Why a payload was refused. The `Display` output is what ends up appended
/// to the dead-lettered message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("name required")]
    NameRequired,
    #[error("surname required")]
    SurnameRequired,
}

#[derive(Deserialize)]
struct Payload {
    name: String,
    surname: String,
    #[serde(default)]
    patronymic: Option<String>,
}

/// Classifies raw topic payloads as person requests.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    require_surname: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            require_surname: true,
        }
    }
}

impl Validator {
    /// With `require_surname` off, records with an empty surname are let
    /// through, matching what older producers of the topic rely on.
    pub fn new(require_surname: bool) -> Self {
        Self { require_surname }
    }

    pub fn validate(&self, raw: &[u8]) -> Result<PersonRequest, InvalidReason> {
        let payload: Payload =
            serde_json::from_slice(raw).map_err(|e| InvalidReason::Malformed(e.to_string()))?;

        if payload.name.is_empty() {
            return Err(InvalidReason::NameRequired);
        }

        if payload.surname.is_empty() {
            if self.require_surname {
                return Err(InvalidReason::SurnameRequired);
            }
            debug!(name = payload.name, "accepting person without surname");
        }

        Ok(PersonRequest {
            name: payload.name,
            surname: payload.surname,
            patronymic: payload.patronymic.filter(|p| !p.is_empty()),
        })
    }
}

/// Validate with the default (strict) rules.
pub fn validate(raw: &[u8]) -> Result<PersonRequest, InvalidReason> {
    Validator::default().validate(raw)
}
