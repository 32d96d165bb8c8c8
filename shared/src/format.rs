use std::fmt::Write;

pub const NOT_AVAILABLE: &str = "N/A";
pub const EMPTY_LABEL: &str = "\u{2014}";

/// Compact currency for marker pills: `$1.5M`, `$45K`, `$999`.
/// Missing or non-finite values produce an empty string.
pub fn format_money(value: Option<f64>) -> String {
    let mut out = String::with_capacity(8);
    write_money(&mut out, value);
    out
}

fn write_money(buf: &mut String, value: Option<f64>) {
    buf.clear();
    let Some(v) = value.filter(|v| v.is_finite()) else {
        return;
    };
    if v >= 1_000_000.0 {
        let _ = write!(buf, "${:.1}M", v / 1_000_000.0);
    } else if v >= 1_000.0 {
        let _ = write!(buf, "${}K", (v / 1_000.0).round() as i64);
    } else {
        let _ = write!(buf, "${}", v.round() as i64);
    }
}

/// Marker label text, with an em-dash when there is no value to show.
pub fn marker_label(value: Option<f64>) -> String {
    let label = format_money(value);
    if label.is_empty() {
        EMPTY_LABEL.to_string()
    } else {
        label
    }
}

/// Full US-dollar amount with grouping and no decimals: `$1,234,568`.
pub fn format_money_full(value: Option<f64>) -> String {
    match value.filter(|v| v.is_finite()) {
        Some(v) => {
            let rounded = v.round();
            let sign = if rounded < 0.0 { "-" } else { "" };
            format!("{sign}${}", group_thousands(rounded.abs()))
        }
        None => NOT_AVAILABLE.to_string(),
    }
}

/// Grouped integer, e.g. floor area `2,150`.
pub fn format_number(value: Option<f64>) -> String {
    match value.filter(|v| v.is_finite()) {
        Some(v) => {
            let rounded = v.round();
            let sign = if rounded < 0.0 { "-" } else { "" };
            format!("{sign}{}", group_thousands(rounded.abs()))
        }
        None => NOT_AVAILABLE.to_string(),
    }
}

fn group_thousands(non_negative: f64) -> String {
    let digits = format!("{non_negative:.0}");
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Escapes text for interpolation into popup/marker markup.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
