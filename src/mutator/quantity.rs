//! Kubernetes resource quantities compared by value
//!
//! `1Gi` and `1024Mi` describe the same amount but differ as strings. Values are
//! parsed into integer nano-units (rounded up, as the API server does) so they
//! can be compared exactly.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a quantity string into nano-units. `None` when malformed or out of range.
pub fn parse(raw: &str) -> Option<i128> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let (negative, rest) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(number_end);

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if frac_part.contains('.') {
        return None;
    }

    let mut mantissa: i128 = 0;
    for digit in int_part.bytes().chain(frac_part.bytes()) {
        mantissa = mantissa
            .checked_mul(10)?
            .checked_add(i128::from(digit - b'0'))?;
    }

    let (exp10, exp2) = suffix_exponents(suffix)?;
    let scaled = mantissa.checked_mul(1i128.checked_shl(exp2)?)?;

    let frac_len = i32::try_from(frac_part.len()).ok()?;
    let power = 9 - frac_len + exp10;
    let nano = if power >= 0 {
        scaled.checked_mul(10i128.checked_pow(power as u32)?)?
    } else {
        let divisor = 10i128.checked_pow(power.unsigned_abs())?;
        let quotient = scaled / divisor;
        if scaled % divisor != 0 {
            quotient + 1
        } else {
            quotient
        }
    };

    Some(if negative { -nano } else { nano })
}

/// Decimal and binary exponents for a quantity suffix
fn suffix_exponents(suffix: &str) -> Option<(i32, u32)> {
    let exps = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 10),
        "Mi" => (0, 20),
        "Gi" => (0, 30),
        "Ti" => (0, 40),
        "Pi" => (0, 50),
        "Ei" => (0, 60),
        other => {
            let exp = other.strip_prefix(['e', 'E'])?;
            let exp: i32 = exp.parse().ok()?;
            if !(-30..=30).contains(&exp) {
                return None;
            }
            (exp, 0)
        }
    };
    Some(exps)
}

/// Value equality; unparseable quantities fall back to string equality.
pub fn equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse(&a.0), parse(&b.0)) {
        (Some(x), Some(y)) => x == y,
        _ => a.0 == b.0,
    }
}

/// Value-preserving normal form used before structural comparison.
pub fn canonical(q: &Quantity) -> Quantity {
    match parse(&q.0) {
        Some(nano) => Quantity(format!("{}n", nano)),
        None => q.clone(),
    }
}
