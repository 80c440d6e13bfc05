// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Field-level validation shared by device and peer records.
//!
//! Validators never stop at the first problem: every check appends to a
//! [`Violations`] list and the caller turns a non-empty list into a
//! [`ValidationError`].

use std::fmt;
use std::net::IpAddr;

use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub description: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.description)
    }
}

#[derive(Debug, Default)]
pub struct Violations(Vec<FieldViolation>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &str, description: impl Into<String>) {
        self.0.push(FieldViolation {
            field: field.to_string(),
            description: description.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok(())` when nothing was recorded, otherwise the whole list wrapped
    /// in a [`ValidationError`] for `subject`.
    pub fn into_result(self, subject: impl Into<String>) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Ok(());
        }
        Err(ValidationError {
            subject: subject.into(),
            violations: self.0,
        })
    }
}

/// One or more field violations on a single record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {subject}: {}", join(.violations))]
pub struct ValidationError {
    pub subject: String,
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.violations.iter().map(|v| v.field.as_str())
    }
}

fn join(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check a comma-separated list of DNS server addresses. An empty string
/// means "no DNS" and is accepted.
pub fn check_dns(violations: &mut Violations, dns: &str) {
    if dns.trim().is_empty() {
        return;
    }
    for addr in dns.split(',') {
        if addr.trim().parse::<IpAddr>().is_err() {
            violations.push("dns", format!("wrong DNS address: {}", addr.trim()));
        }
    }
}

pub fn check_max_len(violations: &mut Violations, field: &str, value: &str, max: usize) {
    if value.chars().count() > max {
        violations.push(field, format!("{field} should be {max} characters max"));
    }
}

/// RFC 5322 mailbox check, accepting both `user@host` and
/// `Display Name <user@host>`.
pub fn is_valid_email(email: &str) -> bool {
    email.parse::<Mailbox>().is_ok()
}

/// Split a DNS field into trimmed, non-empty entries.
pub fn dns_entries(dns: &str) -> Vec<String> {
    dns.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
