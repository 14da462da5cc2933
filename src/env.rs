//! Environment variable helpers shared by the `from_env` constructors.

use std::str::FromStr;

use crate::error::Error;

/// `Some(value)` for a set, non-blank variable.
pub(crate) fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn required(name: &str) -> Result<String, Error> {
    var(name).ok_or_else(|| Error::Config(format!("{name} is required")))
}

/// `"1"` or `"true"` (any case) enable a flag.
pub(crate) fn flag(name: &str) -> bool {
    var(name).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

pub(crate) fn parse<T>(name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| Error::Config(format!("{name}: {e}")))
        })
        .transpose()
}
