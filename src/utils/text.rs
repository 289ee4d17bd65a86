//! Text extraction helpers shared by the catalog parser and message builder.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;

fn capacity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{3,})\s*(?i:ah)").unwrap())
}

fn grade_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "Grade A", "Grade B-", "A-Grade", plus the Ukrainian storefront
    // spellings "Клас"/"Група" and Cyrillic А/Б letters.
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:(?:Grade|Клас|Група)\s*([ABАБ])([-+])?|([ABАБ])-Grade)").unwrap()
    })
}

/// Pull a cell capacity (e.g. "280Ah", "314 ah") out of a product name.
///
/// Three digits minimum: catalog names carry pack voltages and model numbers
/// that would otherwise false-positive as tiny capacities.
pub fn extract_capacity(text: &str) -> Option<u32> {
    capacity_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse a storefront price string ("€ 89,95", "€1,234.50") into a decimal.
///
/// Returns `None` when no digits survive cleaning — callers must treat an
/// unparseable price as absent, never as zero.
pub fn clean_price(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let normalized = match (last_dot, last_comma) {
        // Both separators: whichever comes last is the decimal point.
        (Some(d), Some(c)) if d > c => cleaned.replace(',', ""),
        (Some(_), Some(_)) => cleaned.replace('.', "").replace(',', "."),
        (None, Some(c)) => {
            // Lone comma: decimal separator when followed by at most two
            // digits, thousands separator otherwise.
            if cleaned.len() - c - 1 <= 2 && cleaned.matches(',').count() == 1 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(d), None) => {
            if cleaned.len() - d - 1 <= 2 && cleaned.matches('.').count() == 1 {
                cleaned
            } else {
                cleaned.replace('.', "")
            }
        }
        (None, None) => cleaned,
    };

    Decimal::from_str(&normalized).ok()
}

/// Extract a normalized cell grade ("Grade A", "Grade B-") from a name.
pub fn extract_grade(text: &str) -> Option<String> {
    let caps = grade_re().captures(text)?;
    let letter = caps
        .get(1)
        .or_else(|| caps.get(3))
        .map(|m| m.as_str())
        .unwrap_or_default();
    let suffix = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

    let letter = match letter.to_uppercase().as_str() {
        "А" | "A" => "A",
        "Б" | "B" => "B",
        other => return Some(format!("Grade {other}{suffix}")),
    };
    Some(format!("Grade {letter}{suffix}"))
}

/// Compact a catalog name for one-line notification rows.
///
/// Grade and boilerplate chemistry words are stripped (they are rendered
/// separately), whitespace is collapsed, and the result is capped at 30 chars.
pub fn shorten_name(text: &str) -> String {
    static BOILERPLATE: OnceLock<Vec<Regex>> = OnceLock::new();
    let boilerplate = BOILERPLATE.get_or_init(|| {
        [
            r"LiFePO4",
            r"3\.2V",
            r"Prismatic",
            r"Rechargeable",
            r"Battery",
            r"Cell",
            r"\d+\s*Ah",
            r"Призматичний",
        ]
        .iter()
        .map(|w| Regex::new(&format!("(?i){w}")).unwrap())
        .collect()
    });

    let mut name = grade_re().replace_all(text, "").into_owned();
    for re in boilerplate {
        name = re.replace_all(&name, "").into_owned();
    }
    name = name.replace(" - ", " ").replace(" , ", " ");
    name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let name = name.trim_matches([' ', '-', '.', ',', '|']);

    if name.chars().count() > 30 {
        let head: String = name.chars().take(28).collect();
        format!("{head}..")
    } else {
        name.to_string()
    }
}

/// Mask chat ids and tokens before they reach the run log.
pub fn mask_sensitive(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
