use chrono::Duration;

use crate::error::{DripError, DripResult};

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 3600;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = 604_800;

/// Ten years. Anything longer is a typo, not a drip timeout.
const MAX_DURATION_SECS: i64 = 10 * 365 * SECS_PER_DAY;

/// Parse an ISO-8601 duration (`P2DT12H`, `PT72H`, `P1W`) into a fixed
/// span. Calendar units (years, months) have no fixed length and are
/// rejected. Parsing happens once, when a timeout is armed or a plan is
/// registered; the resulting absolute deadline is what gets persisted.
pub fn parse(input: &str) -> DripResult<Duration> {
    let s = input.trim();
    let body = s
        .strip_prefix('P')
        .ok_or_else(|| invalid(input, "missing 'P' prefix"))?;
    if body.is_empty() {
        return Err(invalid(input, "no components"));
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (body, None),
    };
    if date_part.contains('Y') || date_part.contains('M') {
        return Err(invalid(input, "calendar units (Y, M) are not supported"));
    }
    if time_part == Some("") {
        return Err(invalid(input, "empty time section"));
    }

    let mut components = 0usize;
    let mut secs = scan_units(
        date_part,
        &[('W', SECS_PER_WEEK), ('D', SECS_PER_DAY)],
        input,
        &mut components,
    )?;
    if let Some(t) = time_part {
        let time_secs = scan_units(
            t,
            &[('H', SECS_PER_HOUR), ('M', SECS_PER_MINUTE), ('S', 1)],
            input,
            &mut components,
        )?;
        secs = secs
            .checked_add(time_secs)
            .ok_or_else(|| invalid(input, "out of range"))?;
    }
    if components == 0 {
        return Err(invalid(input, "no components"));
    }
    if secs > MAX_DURATION_SECS {
        return Err(invalid(input, "out of range"));
    }

    Ok(Duration::seconds(secs))
}

/// Scan one section (`2DT`-style date or `12H30M`-style time) against
/// its legal units, enforcing unit order and digit-before-unit shape.
fn scan_units(
    part: &str,
    units: &[(char, i64)],
    input: &str,
    components: &mut usize,
) -> DripResult<i64> {
    let mut secs: i64 = 0;
    let mut digits = String::new();
    let mut last_unit: Option<usize> = None;

    for ch in part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let idx = units
            .iter()
            .position(|(u, _)| *u == ch)
            .ok_or_else(|| invalid(input, "unexpected character"))?;
        if digits.is_empty() {
            return Err(invalid(input, "unit without a value"));
        }
        if last_unit.is_some_and(|prev| idx <= prev) {
            return Err(invalid(input, "units out of order"));
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| invalid(input, "out of range"))?;
        let unit_secs = value
            .checked_mul(units[idx].1)
            .ok_or_else(|| invalid(input, "out of range"))?;
        secs = secs
            .checked_add(unit_secs)
            .ok_or_else(|| invalid(input, "out of range"))?;
        digits.clear();
        last_unit = Some(idx);
        *components += 1;
    }
    if !digits.is_empty() {
        return Err(invalid(input, "trailing digits without a unit"));
    }

    Ok(secs)
}

fn invalid(input: &str, reason: &str) -> DripError {
    DripError::Validation(format!("invalid ISO-8601 duration '{input}': {reason}"))
}
