use crate::core::timeframe::Timeframe;
use anyhow::{anyhow, bail, Context as _, Result};
use std::{error::Error, iter::FromIterator};
use uuid::Uuid;

macro_rules! once_regex {
    ($re:literal $(,)?) => {{
        static RE: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
        RE.get_or_init(|| regex::Regex::new($re).unwrap())
    }};
}

pub type StringPair = (String, String);

pub fn parse_key_value_pair_lines<'a, T, U>(lines: T, seperator: &str) -> Result<U>
where
    T: Iterator<Item = &'a str>,
    U: FromIterator<StringPair>,
{
    lines
        .map(|s| parse_key_value_pair_line(s, seperator))
        .collect::<Result<U>>()
}

fn parse_key_value_pair_line(line: &str, seperator: &str) -> Result<StringPair> {
    let parts: Vec<&str> = line.splitn(2, seperator).collect();
    match parts.len() {
        2 => Ok((parts[0].trim().to_string(), parts[1].trim().to_string())),
        _ => Err(anyhow!("Invalid line in key value pair data.")),
    }
}

pub fn parse_uuid<S: AsRef<str>>(value: S) -> Result<Uuid> {
    Uuid::parse_str(value.as_ref())
        .map_err(|e| e.source().map(|e| anyhow!(e.to_string())).unwrap_or(anyhow!(e)))
        .context(format!("'{}' is not a valid GUID", value.as_ref()))
}

/// Parses a preservation policy string such as "1y 12m 30d". Units are
/// y/q/m/w/d/h/M/s with `M` meaning minutes and `m` months. The string may
/// list units in any order; the result is ordered coarsest-first.
pub fn parse_preserve_policy(value: &str) -> Result<Vec<(Timeframe, u32)>> {
    let token_regex = once_regex!(r"^([0-9]+)([yqmwdhMs])$");
    let mut entries: Vec<(Timeframe, u32)> = Vec::new();
    for token in value.split_whitespace() {
        let captures = token_regex
            .captures(token)
            .ok_or_else(|| anyhow!("invalid policy token '{}'", token))?;
        let timeframe = match captures.get(2).unwrap().as_str() {
            "y" => Timeframe::Years,
            "q" => Timeframe::Quarters,
            "m" => Timeframe::Months,
            "w" => Timeframe::Weeks,
            "d" => Timeframe::Days,
            "h" => Timeframe::Hours,
            "M" => Timeframe::Minutes,
            "s" => Timeframe::Seconds,
            _ => unreachable!("units restricted by the token pattern"),
        };
        let count = captures
            .get(1)
            .unwrap()
            .as_str()
            .parse::<u32>()
            .context(format!("invalid count in policy token '{}'", token))?;
        if entries.iter().any(|(existing, _)| *existing == timeframe) {
            bail!("timeframe '{}' appears more than once in policy", timeframe);
        }
        entries.push((timeframe, count));
    }
    if !entries.iter().any(|(_, count)| *count > 0) {
        bail!("policy must preserve at least one timeframe");
    }
    entries.sort_unstable_by_key(|(timeframe, _)| *timeframe);
    Ok(entries)
}
