//! Card - a materialized, independently owned copy of an address-book row
//!
//! A `Card` is either a contact or a mailing list. Editing a card changes only
//! this copy; nothing reaches the store until it is written back through the
//! session.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::engine::RowId;
use crate::schema::{Field, FieldKind};

/// A field value as held by a card
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Number(u32),
}

impl Value {
    /// Encode for storage. Numbers use the legacy store's hex form.
    pub fn to_yarn(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Number(n) => format!("{:x}", n),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            Value::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Parse a stored number.
///
/// The store keeps numbers as hex text, optionally `0x`-prefixed. Negative
/// values saturate to 0 and oversized ones to `u32::MAX`. Anything that is not
/// a number yields `None` so the caller can apply the field default.
pub fn parse_yarn_number(yarn: &str) -> Option<u32> {
    let trimmed = yarn.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if negative {
        return Some(0);
    }

    let significant = digits.trim_start_matches('0');
    if significant.len() > 8 {
        return Some(u32::MAX);
    }
    if significant.is_empty() {
        return Some(0);
    }
    u32::from_str_radix(significant, 16).ok()
}

/// A contact or mailing list materialized from a row
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Card {
    /// Row id within the card or list scope
    pub row_id: RowId,
    /// The list this card was reached through, if any
    pub list_row_id: Option<RowId>,
    pub is_mail_list: bool,
    /// Resolved member count, for list cards
    pub list_total: Option<u32>,
    values: BTreeMap<Field, Value>,
}

impl Card {
    /// An empty contact, not yet stored
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the common contact fields
    pub fn contact(
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        primary_email: impl Into<String>,
    ) -> Self {
        let first_name = first_name.into();
        let last_name = last_name.into();
        let display = format!("{} {}", first_name, last_name).trim().to_string();

        let mut card = Self::new();
        card.set_text(Field::FirstName, first_name);
        card.set_text(Field::LastName, last_name);
        card.set_text(Field::DisplayName, display);
        card.set_text(Field::PrimaryEmail, primary_email);
        card
    }

    pub fn with_text(mut self, field: Field, value: impl Into<String>) -> Self {
        self.set_text(field, value);
        self
    }

    pub fn with_number(mut self, field: Field, value: u32) -> Self {
        self.set_number(field, value);
        self
    }

    pub fn set_text(&mut self, field: Field, value: impl Into<String>) {
        self.values.insert(field, Value::Text(value.into()));
    }

    pub fn set_number(&mut self, field: Field, value: u32) {
        self.values.insert(field, Value::Number(value));
    }

    pub fn clear(&mut self, field: Field) {
        self.values.remove(&field);
    }

    pub fn get(&self, field: Field) -> Option<&Value> {
        self.values.get(&field)
    }

    /// Text value, empty when absent
    pub fn text(&self, field: Field) -> &str {
        match self.values.get(&field) {
            Some(Value::Text(s)) => s,
            _ => "",
        }
    }

    /// Numeric value, the field default when absent
    pub fn number(&self, field: Field) -> u32 {
        match (self.values.get(&field), field.kind()) {
            (Some(Value::Number(n)), _) => *n,
            (_, FieldKind::Number { default }) => default,
            (_, FieldKind::Text) => 0,
        }
    }

    pub fn values(&self) -> impl Iterator<Item = (Field, &Value)> {
        self.values.iter().map(|(f, v)| (*f, v))
    }

    pub fn display_name(&self) -> &str {
        self.text(Field::DisplayName)
    }

    pub fn primary_email(&self) -> &str {
        self.text(Field::PrimaryEmail)
    }

    pub fn popularity_index(&self) -> u32 {
        self.number(Field::PopularityIndex)
    }

    /// Whether either stored email matches `email`, ignoring case
    pub fn has_email(&self, email: &str) -> bool {
        let needle = email.to_lowercase();
        [
            (Field::LowercasePrimaryEmail, Field::PrimaryEmail),
            (Field::LowercaseSecondEmail, Field::SecondEmail),
        ]
        .iter()
        .any(|(lower, original)| {
            let stored = self.text(*lower);
            if stored.is_empty() {
                !self.text(*original).is_empty() && self.text(*original).to_lowercase() == needle
            } else {
                stored == needle
            }
        })
    }
}
