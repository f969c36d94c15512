use chrono::{DateTime, Utc};

use crate::{macros::record, metric::Tags};

/// A single tagged measurement, reported once and never mutated afterwards.
#[record]
pub struct Stat {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub tags: Tags,
    pub fields: std::collections::BTreeMap<String, f64>,
}

impl Stat {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            tags: Tags::new(),
            fields: Default::default(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Renders the stat in InfluxDB line protocol.
    pub fn to_line(&self) -> String {
        let mut line = escape(&self.name);
        for (k, v) in &self.tags {
            line.push(',');
            line.push_str(&escape(k));
            line.push('=');
            line.push_str(&escape(v));
        }
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={v}", escape(k)))
            .collect();
        if !fields.is_empty() {
            line.push(' ');
            line.push_str(&fields.join(","));
        }
        if let Some(ns) = self.timestamp.timestamp_nanos_opt() {
            line.push(' ');
            line.push_str(&ns.to_string());
        }
        line
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
