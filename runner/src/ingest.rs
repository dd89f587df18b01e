use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("solver output is missing the required `status` field")]
    MissingStatus,
    #[error("solver reported unknown status code {0}")]
    UnknownStatusCode(i64),
    #[error("solver reported a non-integer status `{0}`")]
    MalformedStatus(String),
}

/// A single solver-reported field.
/// The output schema is open ended, values are typed opportunistically.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// parse a raw value the way the solver prints it:
    /// a value containing a decimal point becomes a float, otherwise an
    /// integer if possible, otherwise it stays text
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        if trimmed.contains('.') {
            if let Ok(value) = trimmed.parse::<f64>() {
                return Self::Float(value);
            }
        } else if let Ok(value) = trimmed.parse::<i64>() {
            return Self::Int(value);
        }

        Self::Str(trimmed.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value}"),
        }
    }
}

/// ordered map of solver-reported fields for one run
pub type SolverStats = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Unsatisfiable,
    Satisfiable,
    Optimal,
}

impl Status {
    /// map the solver's integer status code, anything outside the contract
    /// is a protocol violation for the whole run
    pub fn from_code(code: i64) -> Result<Self, IngestError> {
        match code {
            -1 => Ok(Self::Unknown),
            0 => Ok(Self::Unsatisfiable),
            1 => Ok(Self::Satisfiable),
            2 => Ok(Self::Optimal),
            other => Err(IngestError::UnknownStatusCode(other)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Unsatisfiable => "UNSATISFIABLE",
            Self::Satisfiable => "SATISFIABLE",
            Self::Optimal => "OPTIMAL",
        }
    }

    pub const LABELS: [&'static str; 4] =
        ["UNSATISFIABLE", "SATISFIABLE", "OPTIMAL", "UNKNOWN"];
}

/// parse the line oriented `key: value` stdout of a solver run
///
/// lines without a colon are ignored, the required `status` code is replaced
/// with its human readable label
pub fn parse_solver_output(stdout: &str) -> Result<SolverStats, IngestError> {
    let mut stats = SolverStats::new();

    for line in stdout.lines() {
        if let Some((key, value)) = line.split_once(':') {
            stats.insert(key.trim().to_string(), FieldValue::parse(value));
        }
    }

    let status = match stats.get("status") {
        Some(FieldValue::Int(code)) => Status::from_code(*code)?,
        Some(other) => return Err(IngestError::MalformedStatus(other.to_string())),
        None => return Err(IngestError::MissingStatus),
    };
    stats.insert(
        "status".to_string(),
        FieldValue::Str(status.label().to_string()),
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_typed_opportunistically() {
        assert_eq!(FieldValue::parse(" 10 "), FieldValue::Int(10));
        assert_eq!(FieldValue::parse("1.5"), FieldValue::Float(1.5));
        assert_eq!(FieldValue::parse("-3"), FieldValue::Int(-3));
        assert_eq!(FieldValue::parse("n/a"), FieldValue::Str("n/a".to_string()));
        // contains a dot but is no float, stays text
        assert_eq!(
            FieldValue::parse("1.2.3"),
            FieldValue::Str("1.2.3".to_string())
        );
    }

    #[test]
    fn parses_key_value_lines() {
        let stats =
            parse_solver_output("status: 2\nencoding_time: 1.5\nclauses: 10\n").unwrap();

        assert_eq!(
            stats.get("status"),
            Some(&FieldValue::Str("OPTIMAL".to_string()))
        );
        assert_eq!(stats.get("encoding_time"), Some(&FieldValue::Float(1.5)));
        assert_eq!(stats.get("clauses"), Some(&FieldValue::Int(10)));
    }

    #[test]
    fn ignores_lines_without_colon() {
        let stats = parse_solver_output("banner line\nstatus: 0\n\n").unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(
            stats.get("status"),
            Some(&FieldValue::Str("UNSATISFIABLE".to_string()))
        );
    }

    #[test]
    fn splits_on_first_colon_only() {
        let stats = parse_solver_output("status: 1\nwall_clock: 0:42\n").unwrap();

        assert_eq!(
            stats.get("wall_clock"),
            Some(&FieldValue::Str("0:42".to_string()))
        );
    }

    #[test]
    fn unknown_status_code_is_a_protocol_violation() {
        match parse_solver_output("status: 7\n") {
            Err(IngestError::UnknownStatusCode(7)) => {}
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn missing_status_is_a_protocol_violation() {
        match parse_solver_output("clauses: 10\n") {
            Err(IngestError::MissingStatus) => {}
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn non_integer_status_is_a_protocol_violation() {
        match parse_solver_output("status: 2.0\n") {
            Err(IngestError::MalformedStatus(_)) => {}
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn all_contract_codes_map_to_labels() {
        assert_eq!(Status::from_code(-1).unwrap().label(), "UNKNOWN");
        assert_eq!(Status::from_code(0).unwrap().label(), "UNSATISFIABLE");
        assert_eq!(Status::from_code(1).unwrap().label(), "SATISFIABLE");
        assert_eq!(Status::from_code(2).unwrap().label(), "OPTIMAL");
    }
}
