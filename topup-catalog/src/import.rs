use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use topup_core::ErrorKind;

const DELIMITER: char = ';';

/// A validated code line ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCode {
    pub pin: Option<String>,
    pub serial: Option<String>,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MalformedLine {
    /// 1-based line number in the submitted text.
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} malformed line(s), first at line {}", .lines.len(), .lines.first().map(|l| l.line).unwrap_or_default())]
pub struct ImportError {
    pub lines: Vec<MalformedLine>,
}

impl ImportError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedBulkImportLine
    }

    pub fn line_numbers(&self) -> Vec<usize> {
        self.lines.iter().map(|l| l.line).collect()
    }
}

fn non_empty(field: Option<&str>) -> Option<String> {
    field
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
}

fn parse_cost(raw: &str) -> Result<f64, String> {
    let cost = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("cost '{}' is not a number", raw.trim()))?;
    if !cost.is_finite() || cost < 0.0 {
        return Err(format!("cost '{}' must be zero or positive", raw.trim()));
    }
    Ok(cost)
}

/// Parses `pin;serial[;cost]` lines. The batch is accepted only when every
/// non-blank line is valid.
pub fn parse_batch(raw: &str, default_cost: Option<f64>) -> Result<Vec<NewCode>, ImportError> {
    let mut codes = Vec::new();
    let mut malformed = Vec::new();
    let mut seen = HashSet::new();

    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(DELIMITER).collect();
        if fields.len() > 3 {
            malformed.push(MalformedLine {
                line: line_no,
                reason: format!("expected at most 3 fields, found {}", fields.len()),
            });
            continue;
        }

        let pin = non_empty(fields.first().copied());
        let serial = non_empty(fields.get(1).copied());
        if pin.is_none() && serial.is_none() {
            malformed.push(MalformedLine {
                line: line_no,
                reason: "neither pin nor serial given".into(),
            });
            continue;
        }

        let cost = match non_empty(fields.get(2).copied()) {
            Some(raw_cost) => parse_cost(&raw_cost),
            None => match default_cost {
                Some(c) if c.is_finite() && c >= 0.0 => Ok(c),
                Some(c) => Err(format!("default cost {} is invalid", c)),
                None => Err("no cost given and no default cost".into()),
            },
        };
        let cost = match cost {
            Ok(c) => c,
            Err(reason) => {
                malformed.push(MalformedLine { line: line_no, reason });
                continue;
            }
        };

        if !seen.insert((pin.clone(), serial.clone())) {
            malformed.push(MalformedLine {
                line: line_no,
                reason: "duplicate of an earlier line".into(),
            });
            continue;
        }

        codes.push(NewCode { pin, serial, cost });
    }

    if malformed.is_empty() {
        Ok(codes)
    } else {
        Err(ImportError { lines: malformed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_pin_serial_and_cost() {
        let codes = parse_batch("AAA;111;2.5\n\nBBB;222\n;333\nCCC", Some(1.0)).unwrap();
        assert_eq!(codes.len(), 4);
        assert_eq!(codes[0].cost, 2.5);
        assert_eq!(codes[1].cost, 1.0);
        assert_eq!(codes[2].pin, None);
        assert_eq!(codes[2].serial.as_deref(), Some("333"));
        assert_eq!(codes[3].serial, None);
    }

    #[test]
    fn test_whole_batch_rejected_with_every_line_number() {
        let raw = "AAA;111;1\n;\nBBB;222;abc\nCCC;333;-1\n\nDDD;444;1;extra\nAAA;111;1";
        let err = parse_batch(raw, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedBulkImportLine);
        assert_eq!(err.line_numbers(), vec![2, 3, 4, 6, 7]);
    }

    #[test]
    fn test_missing_cost_without_default() {
        let err = parse_batch("AAA;111", None).unwrap_err();
        assert_eq!(err.line_numbers(), vec![1]);
        assert!(parse_batch("AAA;111", Some(-2.0)).is_err());
    }
}
