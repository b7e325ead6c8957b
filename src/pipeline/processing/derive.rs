//! Field-level derivations for fact rows.
//!
//! Every function here absorbs bad input: a value that cannot be parsed turns into
//! `None` or a sentinel and never aborts the row.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::{NOT_INFORMED, NOT_SPECIFIED};

static DOSAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)?\s?(?:MG/ML|MG/G|MCG|MG|UI|G|ML)").unwrap());

/// Keyword rules for the dosage form, first match wins.
/// Coated tablets come before the generic tablet rule.
pub const DOSAGE_FORM_RULES: &[(&[&str], &str)] = &[
    (&["COM REV", "COMP REV"], "Coated tablet"),
    (&["COMP"], "Tablet"),
    (&["CAPS", "CAP"], "Capsule"),
    (&["SOL OR", "SOL"], "Oral solution"),
    (&["GTS"], "Drops"),
    (&["XPE"], "Syrup"),
    (&["CREM"], "Cream"),
    (&["POM"], "Ointment"),
    (&["SUSP"], "Suspension"),
    (&["INJ"], "Injectable"),
];

/// Reference mapping dates, most common layout first
const REFERENCE_DATE_FORMATS: [&str; 3] = ["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"];

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

/// Parse an integer, also accepting integral float text such as "2019.0".
pub fn parse_integral(text: Option<&str>) -> Option<i64> {
    let text = non_empty(text)?;
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    let value = text.parse::<f64>().ok()?;
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Year, month and the first day of that month; `None` excludes the row.
pub fn first_of_month(ano: Option<&str>, mes: Option<&str>) -> Option<(i32, u32, NaiveDate)> {
    let year = i32::try_from(parse_integral(ano)?).ok()?;
    let month = u32::try_from(parse_integral(mes)?).ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some((year, month, date))
}

/// First "<number><unit>" token of the presentation description
pub fn extract_dosage(description: Option<&str>) -> Option<String> {
    let upper = description?.to_uppercase();
    DOSAGE.find(&upper).map(|m| m.as_str().to_string())
}

pub fn classify_dosage_form(description: Option<&str>) -> &'static str {
    let Some(description) = description else {
        return NOT_SPECIFIED;
    };
    let upper = description.to_uppercase();
    DOSAGE_FORM_RULES
        .iter()
        .find(|(patterns, _)| patterns.iter().any(|p| upper.contains(p)))
        .map(|(_, form)| *form)
        .unwrap_or(NOT_SPECIFIED)
}

pub fn map_sex(code: Option<&str>) -> &'static str {
    match non_empty(code) {
        Some("1") | Some("1.0") => "Male",
        Some("2") | Some("2.0") => "Female",
        _ => NOT_INFORMED,
    }
}

/// Quantity with comma accepted as decimal separator
pub fn parse_quantity(text: Option<&str>) -> Option<f64> {
    let text = non_empty(text)?.replace(',', ".");
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_age(text: Option<&str>) -> Option<i64> {
    parse_integral(text)
}

pub fn normalize_state(text: Option<&str>) -> Option<String> {
    non_empty(text).map(str::to_uppercase)
}

pub fn cid_or_sentinel(text: Option<&str>) -> String {
    non_empty(text).unwrap_or(NOT_INFORMED).to_string()
}

/// Parse a date from a reference mapping (`dd/mm/yyyy`, `yyyy-mm-dd` or `dd-mm-yyyy`).
pub fn parse_reference_date(text: Option<&str>) -> Option<NaiveDate> {
    let text = non_empty(text)?;
    REFERENCE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_month_excludes_row() {
        assert_eq!(first_of_month(Some("2019"), Some("13")), None);
        assert_eq!(first_of_month(Some("2019"), Some("0")), None);
        assert_eq!(first_of_month(None, Some("1")), None);
        assert_eq!(first_of_month(Some("dois mil"), Some("1")), None);
    }

    #[test]
    fn test_first_of_month_accepts_float_text() {
        let (year, month, date) = first_of_month(Some("2019.0"), Some(" 7 ")).unwrap();
        assert_eq!((year, month), (2019, 7));
        assert_eq!(date.to_string(), "2019-07-01");
        assert_eq!(parse_integral(Some("7.5")), None);
    }

    #[test]
    fn test_dosage_extraction() {
        assert_eq!(
            extract_dosage(Some("50 mg com rev ct bl al plas trans x 30")),
            Some("50 MG".to_string())
        );
        assert_eq!(extract_dosage(Some("2,5MG/ML SOL OR")), Some("2,5MG/ML".to_string()));
        assert_eq!(extract_dosage(Some("0.25 MCG CAPS")), Some("0.25 MCG".to_string()));
        assert_eq!(extract_dosage(Some("FR 20 ML")), Some("20 ML".to_string()));
        assert_eq!(extract_dosage(Some("CX 10 ENV")), None);
        assert_eq!(extract_dosage(None), None);
    }

    #[test]
    fn test_dosage_form_rules_are_ordered() {
        assert_eq!(classify_dosage_form(Some("50 MG COM REV CT")), "Coated tablet");
        assert_eq!(classify_dosage_form(Some("50 MG COMP REV CT")), "Coated tablet");
        assert_eq!(classify_dosage_form(Some("2 mg comp ct bl")), "Tablet");
        assert_eq!(classify_dosage_form(Some("20 MG CAP DURA")), "Capsule");
        assert_eq!(classify_dosage_form(Some("2,5MG/ML SOL OR CT FR GOT")), "Oral solution");
        assert_eq!(classify_dosage_form(Some("GTS FR 20 ML")), "Drops");
        assert_eq!(classify_dosage_form(Some("XPE FR 100ML")), "Syrup");
        assert_eq!(classify_dosage_form(Some("SUSP INJ")), "Suspension");
        assert_eq!(classify_dosage_form(Some("AMP 2 ML INJ")), "Injectable");
        assert_eq!(classify_dosage_form(Some("ADESIVO")), NOT_SPECIFIED);
        assert_eq!(classify_dosage_form(None), NOT_SPECIFIED);
    }

    #[test]
    fn test_sex_codes() {
        assert_eq!(map_sex(Some("1")), "Male");
        assert_eq!(map_sex(Some("2.0")), "Female");
        assert_eq!(map_sex(Some("3")), NOT_INFORMED);
        assert_eq!(map_sex(None), NOT_INFORMED);
    }

    #[test]
    fn test_quantity_and_age_parsing() {
        assert_eq!(parse_quantity(Some("1,5")), Some(1.5));
        assert_eq!(parse_quantity(Some("-120")), Some(-120.0));
        assert_eq!(parse_quantity(Some("abc")), None);
        assert_eq!(parse_quantity(Some("inf")), None);
        assert_eq!(parse_age(Some("45")), Some(45));
        assert_eq!(parse_age(Some("45.0")), Some(45));
        assert_eq!(parse_age(Some("")), None);
        assert_eq!(parse_age(Some("x")), None);
    }

    #[test]
    fn test_state_and_cid() {
        assert_eq!(normalize_state(Some(" sp ")), Some("SP".to_string()));
        assert_eq!(normalize_state(Some("  ")), None);
        assert_eq!(cid_or_sentinel(None), NOT_INFORMED);
        assert_eq!(cid_or_sentinel(Some("F32")), "F32");
    }

    #[test]
    fn test_reference_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2012, 3, 5);
        assert_eq!(parse_reference_date(Some("05/03/2012")), expected);
        assert_eq!(parse_reference_date(Some("2012-03-05")), expected);
        assert_eq!(parse_reference_date(Some("05-03-2012")), expected);
        assert_eq!(parse_reference_date(Some("31/02/2012")), None);
        assert_eq!(parse_reference_date(Some("")), None);
    }
}
