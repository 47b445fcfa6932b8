//! Channel expressions name the trace a trigger runs on: a raw channel, or
//! the sum or difference of several raw channels, e.g. `chA+chB` or `chA-chB`.
use crate::{
    error::{ConfigurationError, SourceResult},
    source::WaveformBlock,
};
use detprocess_common::Real;
use std::fmt;

/// Separates independent triggers sharing one configuration entry.
pub const TRIGGER_LIST_SEPARATOR: char = ',';
const MULTI_DIMENSIONAL_SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq)]
enum Sign {
    Plus,
    Minus,
}

impl Sign {
    fn factor(self) -> Real {
        match self {
            Sign::Plus => 1.0,
            Sign::Minus => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    sign: Sign,
    channel: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelExpression {
    terms: Vec<Term>,
}

impl ChannelExpression {
    /// Parses `expression` against the channels present in the data.
    ///
    /// Channel names may themselves contain `+` or `-`, so at every position
    /// the longest available channel name is matched first.
    pub fn parse(expression: &str, available: &[String]) -> Result<Self, ConfigurationError> {
        let expression = expression
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>();
        if expression.is_empty() {
            return Err(ConfigurationError::MalformedChannelExpression(expression));
        }
        if available.contains(&expression) {
            return Ok(Self {
                terms: vec![Term {
                    sign: Sign::Plus,
                    channel: expression,
                }],
            });
        }
        for separator in [MULTI_DIMENSIONAL_SEPARATOR, TRIGGER_LIST_SEPARATOR] {
            if expression.contains(separator) {
                return Err(ConfigurationError::UnsupportedSeparator {
                    expression,
                    separator,
                });
            }
        }

        let mut terms = Vec::new();
        let mut rest = expression.as_str();
        let mut sign = Sign::Plus;
        loop {
            let channel = available
                .iter()
                .filter(|name| rest.starts_with(name.as_str()))
                .max_by_key(|name| name.len())
                .ok_or_else(|| {
                    let unknown = rest.split(['+', '-']).next().unwrap_or(rest);
                    if unknown.is_empty() {
                        ConfigurationError::MalformedChannelExpression(expression.clone())
                    } else {
                        ConfigurationError::UnknownChannel(unknown.to_owned())
                    }
                })?;
            terms.push(Term {
                sign,
                channel: channel.clone(),
            });
            rest = &rest[channel.len()..];
            sign = match rest.chars().next() {
                None => break,
                Some('+') => Sign::Plus,
                Some('-') => Sign::Minus,
                Some(_) => {
                    return Err(ConfigurationError::MalformedChannelExpression(
                        expression.clone(),
                    ));
                }
            };
            rest = &rest[1..];
        }
        Ok(Self { terms })
    }

    /// The raw channels the expression reads.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|term| term.channel.as_str())
    }

    #[cfg(test)]
    pub(crate) fn is_combination(&self) -> bool {
        self.terms.len() > 1
    }

    /// Evaluates the expression on a block.
    pub fn combine(&self, block: &WaveformBlock) -> SourceResult<Vec<Real>> {
        let mut combined: Option<Vec<Real>> = None;
        for term in &self.terms {
            let trace = block.trace(&term.channel)?;
            let factor = term.sign.factor();
            match combined.as_mut() {
                None => combined = Some(trace.iter().map(|v| factor * v).collect()),
                Some(sum) => sum
                    .iter_mut()
                    .zip(trace)
                    .for_each(|(total, v)| *total += factor * v),
            }
        }
        Ok(combined.unwrap_or_default())
    }
}

impl fmt::Display for ChannelExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, term) in self.terms.iter().enumerate() {
            match (index, term.sign) {
                (0, Sign::Plus) => {}
                (_, Sign::Plus) => write!(f, "+")?,
                (_, Sign::Minus) => write!(f, "-")?,
            }
            write!(f, "{}", term.channel)?;
        }
        Ok(())
    }
}
