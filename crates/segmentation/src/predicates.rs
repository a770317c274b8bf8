//! Field resolution and typed comparison logic for segment conditions.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mailflow_core::types::Contact;

use crate::criteria::{Condition, Operator};

/// Contact fields addressable from a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Email,
    FirstName,
    LastName,
    Status,
    Tags,
    ListIds,
    JoinedAt,
    LastOpenAt,
    LastClickAt,
    EmailsOpened,
    LinksClicked,
    Custom(String),
}

/// How a field's value is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Number,
    Date,
    Select,
    Tags,
    /// Custom attributes take the type implied by the operator.
    Dynamic,
}

impl Field {
    pub fn parse(name: &str) -> Option<Field> {
        let field = match name {
            "email" => Field::Email,
            "firstName" => Field::FirstName,
            "lastName" => Field::LastName,
            "status" => Field::Status,
            "tags" => Field::Tags,
            "listIds" => Field::ListIds,
            "joinedAt" => Field::JoinedAt,
            "stats.lastOpenAt" => Field::LastOpenAt,
            "stats.lastClickAt" => Field::LastClickAt,
            "stats.emailsOpened" => Field::EmailsOpened,
            "stats.linksClicked" => Field::LinksClicked,
            other => {
                let key = other.strip_prefix("custom.")?;
                if key.is_empty() {
                    return None;
                }
                Field::Custom(key.to_string())
            }
        };
        Some(field)
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Email | Field::FirstName | Field::LastName => FieldType::Text,
            Field::Status => FieldType::Select,
            Field::Tags | Field::ListIds => FieldType::Tags,
            Field::JoinedAt | Field::LastOpenAt | Field::LastClickAt => FieldType::Date,
            Field::EmailsOpened | Field::LinksClicked => FieldType::Number,
            Field::Custom(_) => FieldType::Dynamic,
        }
    }
}

/// Evaluates one condition. Unknown fields, unknown operators, and operators
/// that do not apply to the field's type all yield `false`.
pub fn evaluate_condition(contact: &Contact, condition: &Condition) -> bool {
    let Some(field) = Field::parse(&condition.field) else {
        return false;
    };
    let op = &condition.operator;

    match field.field_type() {
        FieldType::Text if op.is_text() => {
            compare_text(&text_value(contact, &field), op, &condition.value_text())
        }
        FieldType::Number if op.is_numeric() => {
            compare_number(number_value(contact, &field), op, &condition.value_text())
        }
        FieldType::Date if op.is_date() => {
            compare_date(date_value(contact, &field), op, &condition.value_text())
        }
        FieldType::Select if op.is_select() => {
            let actual = contact.status.as_str();
            let expected = condition.value_text();
            match op {
                Operator::Is => actual == expected,
                Operator::IsNot => actual != expected,
                _ => false,
            }
        }
        FieldType::Tags if op.is_membership() => {
            let expected = condition.value_text();
            let members = match field {
                Field::ListIds => &contact.list_ids,
                _ => &contact.tags,
            };
            let present = members.iter().any(|m| m.eq_ignore_ascii_case(&expected));
            match op {
                Operator::Contains => present,
                Operator::NotContains => !present,
                _ => false,
            }
        }
        FieldType::Dynamic => evaluate_custom(contact, &field, condition),
        _ => false,
    }
}

fn evaluate_custom(contact: &Contact, field: &Field, condition: &Condition) -> bool {
    let op = &condition.operator;
    let expected = condition.value_text();
    match op {
        // Equality is numeric when both sides parse as numbers.
        Operator::Equals => {
            let actual = number_value(contact, field);
            match (actual, parse_number(&expected)) {
                (Some(a), Some(e)) => a == e,
                _ => compare_text(&text_value(contact, field), op, &expected),
            }
        }
        _ if op.is_text() => compare_text(&text_value(contact, field), op, &expected),
        _ if op.is_numeric() => compare_number(number_value(contact, field), op, &expected),
        _ if op.is_date() => compare_date(date_value(contact, field), op, &expected),
        _ => false,
    }
}

fn text_value(contact: &Contact, field: &Field) -> String {
    match field {
        Field::Email => contact.email.clone(),
        Field::FirstName => contact.first_name.clone(),
        Field::LastName => contact.last_name.clone(),
        Field::Custom(key) => match contact.custom_attributes.get(key) {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        },
        _ => String::new(),
    }
}

fn number_value(contact: &Contact, field: &Field) -> Option<f64> {
    match field {
        Field::EmailsOpened => Some(contact.stats.emails_opened as f64),
        Field::LinksClicked => Some(contact.stats.links_clicked as f64),
        Field::Custom(key) => match contact.custom_attributes.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => parse_number(s),
            _ => None,
        },
        _ => None,
    }
}

fn date_value(contact: &Contact, field: &Field) -> Option<DateTime<Utc>> {
    match field {
        Field::JoinedAt => Some(contact.joined_at),
        Field::LastOpenAt => contact.stats.last_open_at,
        Field::LastClickAt => contact.stats.last_click_at,
        Field::Custom(key) => parse_date(contact.custom_attributes.get(key)?.as_str()?),
        _ => None,
    }
}

/// Case-insensitive text comparison.
pub fn compare_text(actual: &str, operator: &Operator, expected: &str) -> bool {
    let actual = actual.to_lowercase();
    let expected = expected.to_lowercase();
    match operator {
        Operator::Contains => actual.contains(&expected),
        Operator::NotContains => !actual.contains(&expected),
        Operator::Equals => actual == expected,
        Operator::StartsWith => actual.starts_with(&expected),
        _ => false,
    }
}

/// A missing or non-numeric side never matches.
pub fn compare_number(actual: Option<f64>, operator: &Operator, expected: &str) -> bool {
    let (Some(actual), Some(expected)) = (actual, parse_number(expected)) else {
        return false;
    };
    match operator {
        Operator::GreaterThan => actual > expected,
        Operator::LessThan => actual < expected,
        Operator::Equals => actual == expected,
        _ => false,
    }
}

/// An unparsable side never matches. `on` compares UTC calendar days.
pub fn compare_date(actual: Option<DateTime<Utc>>, operator: &Operator, expected: &str) -> bool {
    let (Some(actual), Some(expected)) = (actual, parse_date(expected)) else {
        return false;
    };
    match operator {
        Operator::After => actual > expected,
        Operator::Before => actual < expected,
        Operator::On => actual.date_naive() == expected.date_naive(),
        _ => false,
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Accepts RFC 3339 timestamps, naive `YYYY-MM-DDTHH:MM:SS` (as UTC), and
/// plain `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn contact() -> Contact {
        let mut c = Contact::new("Ada.Lovelace@Example.com").with_tag("VIP").with_list("newsletter");
        c.first_name = "Ada".into();
        c.stats.emails_opened = 7;
        c.joined_at = Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 0).unwrap();
        c.custom_attributes.insert("plan".into(), serde_json::json!("Pro"));
        c.custom_attributes.insert("seats".into(), serde_json::json!(12));
        c.custom_attributes.insert("ltv".into(), serde_json::json!("n/a"));
        c.custom_attributes.insert("renewsOn".into(), serde_json::json!("2025-01-31"));
        c
    }

    fn check(field: &str, op: Operator, value: serde_json::Value) -> bool {
        evaluate_condition(&contact(), &Condition::new(field, op, value))
    }

    #[test]
    fn test_text_is_case_insensitive() {
        assert!(check("email", Operator::Contains, "@example.COM".into()));
        assert!(check("email", Operator::StartsWith, "ada.".into()));
        assert!(check("firstName", Operator::Equals, "ADA".into()));
        assert!(check("email", Operator::NotContains, "acme".into()));
    }

    #[test]
    fn test_missing_text_is_empty_string() {
        assert!(check("lastName", Operator::Equals, "".into()));
        assert!(check("custom.nickname", Operator::NotContains, "x".into()));
        assert!(!check("custom.nickname", Operator::Contains, "x".into()));
    }

    #[test]
    fn test_numbers() {
        assert!(check("stats.emailsOpened", Operator::GreaterThan, 5.into()));
        assert!(check("stats.emailsOpened", Operator::LessThan, "8".into()));
        assert!(check("stats.emailsOpened", Operator::Equals, 7.into()));
        assert!(!check("stats.emailsOpened", Operator::GreaterThan, "lots".into()));
        assert!(check("custom.seats", Operator::GreaterThan, 10.into()));
        assert!(!check("custom.ltv", Operator::GreaterThan, 0.into()));
    }

    #[test]
    fn test_dates() {
        assert!(check("joinedAt", Operator::After, "2024-03-01".into()));
        assert!(check("joinedAt", Operator::Before, "2024-03-15T11:00:00Z".into()));
        assert!(check("joinedAt", Operator::On, "2024-03-15".into()));
        assert!(!check("joinedAt", Operator::On, "yesterday".into()));
        assert!(!check("stats.lastOpenAt", Operator::Before, "2030-01-01".into()));
        assert!(check("custom.renewsOn", Operator::After, "2024-12-31".into()));
    }

    #[test]
    fn test_select_is_case_sensitive() {
        assert!(check("status", Operator::Is, "active".into()));
        assert!(!check("status", Operator::Is, "Active".into()));
        assert!(check("status", Operator::IsNot, "unsubscribed".into()));
    }

    #[test]
    fn test_tag_and_list_membership() {
        assert!(check("tags", Operator::Contains, "vip".into()));
        assert!(!check("tags", Operator::Contains, "VI".into()));
        assert!(check("tags", Operator::NotContains, "churned".into()));
        assert!(check("listIds", Operator::Contains, "newsletter".into()));
    }

    #[test]
    fn test_mismatches_fail_closed() {
        assert!(!check("status", Operator::Contains, "act".into()));
        assert!(!check("tags", Operator::Equals, "VIP".into()));
        assert!(!check("email", Operator::GreaterThan, 1.into()));
        assert!(!check("phone", Operator::Equals, "".into()));
        assert!(!check("custom.", Operator::Equals, "".into()));
        assert!(!check("email", Operator::Unknown("regex".into()), ".*".into()));
        assert!(!check("custom.plan", Operator::Is, "Pro".into()));
    }

    #[test]
    fn test_custom_equality() {
        assert!(check("custom.plan", Operator::Equals, "pro".into()));
        assert!(check("custom.seats", Operator::Equals, "12.0".into()));
    }
}
