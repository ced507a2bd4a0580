//! Service locator strings: `transport:key=value,key=value`, optionally
//! listing several `;`-separated alternatives, e.g.,
//! `basic+udp:host=10.0.0.1,port=12242;tcp:host=10.0.0.1,port=12243`.

use std::fmt;

use crate::utils::CohortError;

/// One transport alternative inside a service locator.
#[derive(Debug, PartialEq, Eq, Clone)]
struct LocatorAlternative {
    transport: String,
    options: Vec<(String, String)>,
}

/// Parsed, validated service locator.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServiceLocator {
    /// Normalized string form (whitespace around separators stripped).
    original: String,

    /// Transport alternatives in preference order.
    alternatives: Vec<LocatorAlternative>,
}

impl ServiceLocator {
    /// Parses a locator string, rejecting anything malformed or longer than
    /// `max_len` bytes.
    pub fn parse(s: &str, max_len: usize) -> Result<Self, CohortError> {
        if s.len() > max_len {
            return Err(CohortError::msg(format!(
                "service locator too long: {} > {} bytes",
                s.len(),
                max_len
            )));
        }

        let mut alternatives = vec![];
        for alt in s.split(';').map(str::trim).filter(|a| !a.is_empty()) {
            alternatives.push(Self::parse_alternative(alt)?);
        }
        if alternatives.is_empty() {
            return Err(CohortError::msg(format!(
                "service locator '{}' names no transport",
                s
            )));
        }

        let original = alternatives
            .iter()
            .map(|alt| {
                let opts: Vec<String> = alt
                    .options
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                format!("{}:{}", alt.transport, opts.join(","))
            })
            .collect::<Vec<String>>()
            .join(";");

        Ok(ServiceLocator {
            original,
            alternatives,
        })
    }

    fn parse_alternative(alt: &str) -> Result<LocatorAlternative, CohortError> {
        let (transport, rest) = alt.split_once(':').ok_or_else(|| {
            CohortError::msg(format!("locator '{}' missing ':'", alt))
        })?;
        let transport = transport.trim();
        if transport.is_empty()
            || !transport
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "+-_".contains(c))
        {
            return Err(CohortError::msg(format!(
                "invalid transport name '{}'",
                transport
            )));
        }

        let mut options = vec![];
        for opt in rest.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (key, value) = opt.split_once('=').ok_or_else(|| {
                CohortError::msg(format!("locator option '{}' missing '='", opt))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(CohortError::msg(format!(
                    "locator option '{}' has empty key",
                    opt
                )));
            }
            options.push((key.to_string(), value.trim().to_string()));
        }

        Ok(LocatorAlternative {
            transport: transport.to_string(),
            options,
        })
    }

    /// Normalized string form.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Transport name of the preferred alternative.
    pub fn transport(&self) -> &str {
        &self.alternatives[0].transport
    }

    /// Looks up an option in the first alternative that defines it.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.alternatives.iter().find_map(|alt| {
            alt.options
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn host(&self) -> Option<&str> {
        self.option("host")
    }

    pub fn port(&self) -> Option<u16> {
        self.option("port").and_then(|p| p.parse().ok())
    }
}

impl fmt::Display for ServiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}
