//! Temporal plan files as exchanged between planner, validator, and the
//! experiment driver: one action per line,
//! `<time>: (<tokens>) [<duration>] ; (<integer>)`.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("plan contains no actions")]
    Empty,
    #[error("failed to read plan file: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanAction {
    pub time: f64,
    pub tokens: Vec<String>,
    pub duration: f64,
    pub annotation: i64,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}: ({}) [{:.3}] ; ({})",
            self.time,
            self.tokens.join(" "),
            self.duration,
            self.annotation
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    pub actions: Vec<PlanAction>,
}

impl Plan {
    /// Strict parse: every non-empty line must be a well-formed action.
    pub fn parse(text: &str) -> Result<Plan, PlanError> {
        let mut actions = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(action) => actions.push(action),
                Err(reason) => {
                    return Err(PlanError::Malformed {
                        line: index + 1,
                        reason,
                    })
                }
            }
        }
        Ok(Plan { actions })
    }

    /// Tolerant parse: keeps the lines that are well-formed actions and
    /// drops everything else. Planner transcripts interleave search
    /// output with the plan itself.
    pub fn from_transcript(text: &str) -> Plan {
        let actions = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| parse_line(line).ok())
            .collect();
        Plan { actions }
    }

    pub fn from_file(path: &Path) -> Result<Plan, PlanError> {
        let text = fs::read_to_string(path)?;
        Plan::parse(&text)
    }

    pub fn shift(&mut self, offset: f64) {
        for action in &mut self.actions {
            action.time += offset;
        }
    }

    /// Goal-achievement time: the timestamp of the last action.
    pub fn gat(&self) -> Option<f64> {
        self.actions.last().map(|action| action.time)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for action in &self.actions {
            writeln!(f, "{}", action)?;
        }
        Ok(())
    }
}

pub fn action_from_line(line: &str) -> Option<PlanAction> {
    parse_line(line.trim()).ok()
}

pub fn gat_from_file(path: &Path) -> Result<f64, PlanError> {
    let plan = Plan::from_file(path)?;
    plan.gat().ok_or(PlanError::Empty)
}

fn parse_line(line: &str) -> Result<PlanAction, String> {
    let (time_text, rest) = line
        .split_once(':')
        .ok_or_else(|| "missing ':' after timestamp".to_string())?;
    let time: f64 = time_text
        .trim()
        .parse()
        .map_err(|_| format!("invalid timestamp '{}'", time_text.trim()))?;

    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix('(')
        .ok_or_else(|| "missing '(' before action tokens".to_string())?;
    let (token_text, rest) = rest
        .split_once(')')
        .ok_or_else(|| "missing ')' after action tokens".to_string())?;
    let tokens: Vec<String> = token_text.split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        return Err("empty action token list".to_string());
    }

    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix('[')
        .ok_or_else(|| "missing '[' before duration".to_string())?;
    let (duration_text, rest) = rest
        .split_once(']')
        .ok_or_else(|| "missing ']' after duration".to_string())?;
    let duration: f64 = duration_text
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration '{}'", duration_text.trim()))?;

    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix(';')
        .ok_or_else(|| "missing ';' after duration".to_string())?;
    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix('(')
        .ok_or_else(|| "missing '(' before annotation".to_string())?;
    let (annotation_text, rest) = rest
        .split_once(')')
        .ok_or_else(|| "missing ')' after annotation".to_string())?;
    let annotation: i64 = annotation_text
        .trim()
        .parse()
        .map_err(|_| format!("invalid annotation '{}'", annotation_text.trim()))?;

    if !rest.trim().is_empty() {
        return Err(format!("trailing content '{}'", rest.trim()));
    }

    Ok(PlanAction {
        time,
        tokens,
        duration,
        annotation,
    })
}
