use regex::Regex;

use crate::{
    config::PipelineConfig,
    pipeline::types::{NormalizedTradeline, ParsedTradelineCandidate, UNKNOWN_CREDITOR},
};

pub const MASK_CHAR: char = 'X';

/// Keywords that deterministically mark a tradeline negative. No inference
/// happens beyond this fixed set.
pub const NEGATIVE_KEYWORDS: &[&str] = &[
    "late",
    "charged off",
    "charge off",
    "collection",
    "past due",
    "derogatory",
    "repossession",
    "bankruptcy",
    "120 days",
];

const TYPE_SYNONYMS: &[(&str, &[&str])] = &[
    ("Credit Card", &["credit card", "revolving", "charge card", "flexible spending"]),
    ("Mortgage", &["mortgage", "real estate", "home loan", "fha", "conventional"]),
    ("Auto Loan", &["auto", "automobile", "vehicle"]),
    ("Student Loan", &["student", "education"]),
    ("Installment", &["installment", "personal loan", "unsecured", "note loan"]),
    ("Collection", &["collection", "factoring company"]),
    ("Line of Credit", &["line of credit", "check credit", "heloc"]),
];

const STATUS_SYNONYMS: &[(&str, &[&str])] = &[
    ("Open", &["open", "current", "pays as agreed", "paid as agreed", "exceptional"]),
    ("Closed", &["closed", "paid and closed", "account closed", "paid, closed"]),
    ("Charged Off", &["charged off", "charge off", "charge-off", "written off"]),
    ("Collection", &["collection", "placed for collection"]),
    ("Delinquent", &["late", "past due", "delinquent", "30 days", "60 days", "90 days", "120 days"]),
    ("Transferred", &["transferred", "sold", "refinanced"]),
];

/// Deterministic canonicalization of raw candidate fields. No guessing beyond
/// the defaults stated here; anything unparsable becomes a placeholder plus a
/// warning, never a fabricated value.
pub struct FieldNormalizer {
    prefix_len: usize,
    date_full: Regex,
    date_month_year: Regex,
}

impl FieldNormalizer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            prefix_len: config.account_prefix_len,
            date_full: Regex::new(r"^([0-9]{1,2})[/-]([0-9]{1,2})[/-]([0-9]{2,4})$")
                .expect("date regex"),
            date_month_year: Regex::new(r"^([0-9]{1,2})[/-]([0-9]{4})$").expect("date regex"),
        }
    }

    pub fn normalize(
        &self,
        candidate: &ParsedTradelineCandidate,
        user_id: &str,
    ) -> (NormalizedTradeline, Vec<String>) {
        let mut warnings = Vec::new();

        let creditor_name = candidate
            .creditor_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_CREDITOR.to_string());

        let (account_number, account_number_prefix) = match &candidate.account_number {
            Some(raw) => self.mask_account(raw),
            None => (String::new(), None),
        };

        let account_balance = candidate
            .balance
            .as_deref()
            .map(|raw| self.currency(raw, "account_balance", &mut warnings));
        let credit_limit = candidate
            .credit_limit
            .as_deref()
            .map(|raw| self.currency(raw, "credit_limit", &mut warnings));
        let monthly_payment = candidate
            .monthly_payment
            .as_deref()
            .map(|raw| self.currency(raw, "monthly_payment", &mut warnings));

        let date_opened = match candidate.date_opened.as_deref() {
            Some(raw) => {
                let parsed = self.date(raw);
                if parsed.is_none() {
                    warnings.push(format!("date_opened unparsable: {raw:?}"));
                }
                parsed
            }
            None => None,
        };

        let (account_type, type_unmapped) =
            map_enum(candidate.account_type.as_deref(), TYPE_SYNONYMS);
        if type_unmapped {
            warnings.push(format!(
                "account_type unmapped, kept verbatim: {:?}",
                candidate.account_type.as_deref().unwrap_or_default()
            ));
        }
        let (account_status, status_unmapped) =
            map_enum(candidate.account_status.as_deref(), STATUS_SYNONYMS);
        if status_unmapped {
            warnings.push(format!(
                "account_status unmapped, kept verbatim: {:?}",
                candidate.account_status.as_deref().unwrap_or_default()
            ));
        }

        let is_negative = is_negative(&candidate.snippet);

        let tradeline = NormalizedTradeline {
            id: String::new(),
            user_id: user_id.to_string(),
            creditor_name,
            account_number,
            account_number_prefix,
            account_balance,
            credit_limit,
            monthly_payment,
            date_opened,
            account_type,
            account_status,
            type_unmapped,
            status_unmapped,
            credit_bureau: candidate.bureau,
            is_negative,
            confidence_score: 0,
            low_confidence: false,
            parse_confidence: candidate.parse_confidence(),
            merge_conflicts: 0,
            created_at: None,
            updated_at: None,
        };

        (tradeline, warnings)
    }

    /// Strips everything but digits and the decimal point, then reformats as
    /// a currency string. Unparsable input becomes `"$0"` with a warning.
    fn currency(&self, raw: &str, field: &str, warnings: &mut Vec<String>) -> String {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        match cleaned.parse::<f64>() {
            Ok(value) if value >= 0.0 => format_currency(value),
            _ => {
                warnings.push(format!("{field} unparsable: {raw:?}, defaulted to $0"));
                "$0".to_string()
            }
        }
    }

    /// Accepts `MM/DD/YYYY`, `MM-DD-YYYY` and `MM/YYYY`; normalizes to
    /// `MM/DD/YYYY`. A year segment that cannot be read becomes the `XXXX`
    /// placeholder. Anything else is `None` — dates are never fabricated.
    fn date(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();

        if let Some(caps) = self.date_full.captures(raw) {
            let month: u32 = caps[1].parse().ok()?;
            let day: u32 = caps[2].parse().ok()?;
            if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
                return None;
            }
            let year = normalize_year(&caps[3]);
            return Some(format!("{month:02}/{day:02}/{year}"));
        }

        if let Some(caps) = self.date_month_year.captures(raw) {
            let month: u32 = caps[1].parse().ok()?;
            if !(1..=12).contains(&month) {
                return None;
            }
            let year = normalize_year(&caps[2]);
            return Some(format!("{month:02}/01/{year}"));
        }

        None
    }

    /// Keeps the leading prefix digits, masks the remainder across the
    /// original length. Input that already carries mask characters passes
    /// through unchanged and yields no prefix: prefixes are never fabricated.
    fn mask_account(&self, raw: &str) -> (String, Option<String>) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return (String::new(), None);
        }

        if trimmed.chars().any(|c| matches!(c, 'X' | 'x' | '*')) {
            return (trimmed.to_string(), None);
        }

        let prefix: String = trimmed
            .chars()
            .take(self.prefix_len)
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let masked: String = prefix
            .chars()
            .chain(trimmed.chars().skip(prefix.len()).map(|_| MASK_CHAR))
            .collect();

        let prefix = if prefix.is_empty() { None } else { Some(prefix) };
        (masked, prefix)
    }
}

/// True iff the block text contains any fixed negative keyword.
pub fn is_negative(block_text: &str) -> bool {
    let lower = block_text.to_lowercase();
    NEGATIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn map_enum(raw: Option<&str>, synonyms: &[(&str, &[&str])]) -> (Option<String>, bool) {
    let Some(raw) = raw else {
        return (None, false);
    };
    let lower = raw.trim().to_lowercase();
    if lower.is_empty() {
        return (None, false);
    }

    for (canonical, variants) in synonyms {
        if variants.iter().any(|v| lower.contains(v)) {
            return (Some((*canonical).to_string()), false);
        }
    }
    // Unmapped values are retained verbatim, never coerced to a near guess.
    (Some(raw.trim().to_string()), true)
}

fn format_currency(value: f64) -> String {
    if (value - value.trunc()).abs() < f64::EPSILON {
        format!("${}", value.trunc() as i64)
    } else {
        format!("${value:.2}")
    }
}

fn normalize_year(segment: &str) -> String {
    match segment.len() {
        4 => segment.to_string(),
        2 => {
            // Two-digit years pivot at 50, the usual report convention.
            let yy: u32 = match segment.parse() {
                Ok(v) => v,
                Err(_) => return "XXXX".to_string(),
            };
            if yy >= 50 {
                format!("19{yy:02}")
            } else {
                format!("20{yy:02}")
            }
        }
        _ => "XXXX".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Bureau;

    fn normalizer() -> FieldNormalizer {
        FieldNormalizer::new(&PipelineConfig::default())
    }

    fn candidate() -> ParsedTradelineCandidate {
        ParsedTradelineCandidate {
            creditor_name: Some("CHASE".into()),
            account_number: Some("4242424242424242".into()),
            balance: Some("$1,250.50".into()),
            bureau: Bureau::TransUnion,
            ..ParsedTradelineCandidate::default()
        }
    }

    #[test]
    fn masks_account_keeping_prefix() {
        let (tl, _) = normalizer().normalize(&candidate(), "user-1");
        assert_eq!(tl.account_number, "4242XXXXXXXXXXXX");
        assert_eq!(tl.account_number_prefix.as_deref(), Some("4242"));
        assert_eq!(tl.account_number.len(), 16);
    }

    #[test]
    fn premasked_account_passes_through() {
        let mut c = candidate();
        c.account_number = Some("XXXX5678".into());
        let (tl, _) = normalizer().normalize(&c, "user-1");
        assert_eq!(tl.account_number, "XXXX5678");
        assert_eq!(tl.account_number_prefix, None);
    }

    #[test]
    fn currency_rules() {
        let n = normalizer();
        let mut warnings = Vec::new();
        assert_eq!(n.currency("$1,250.50", "f", &mut warnings), "$1250.50");
        assert_eq!(n.currency("300", "f", &mut warnings), "$300");
        assert_eq!(n.currency("$5,000.00", "f", &mut warnings), "$5000");
        assert!(warnings.is_empty());

        assert_eq!(n.currency("n/a", "f", &mut warnings), "$0");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn date_rules() {
        let n = normalizer();
        assert_eq!(n.date("3/5/2019").as_deref(), Some("03/05/2019"));
        assert_eq!(n.date("03-15-2019").as_deref(), Some("03/15/2019"));
        assert_eq!(n.date("04/2020").as_deref(), Some("04/01/2020"));
        assert_eq!(n.date("06/01/99").as_deref(), Some("06/01/1999"));
        assert_eq!(n.date("13/05/2019"), None);
        assert_eq!(n.date("sometime"), None);
        // Unreadable year segment becomes the placeholder.
        assert_eq!(n.date("06/01/019").as_deref(), Some("06/01/XXXX"));
    }

    #[test]
    fn unmapped_enum_kept_verbatim_with_warning() {
        let mut c = candidate();
        c.account_type = Some("Quantum Flex Agreement".into());
        let (tl, warnings) = normalizer().normalize(&c, "user-1");
        assert_eq!(tl.account_type.as_deref(), Some("Quantum Flex Agreement"));
        assert!(tl.type_unmapped);
        assert!(warnings.iter().any(|w| w.contains("unmapped")));
    }

    #[test]
    fn known_synonyms_map_to_enum() {
        let mut c = candidate();
        c.account_type = Some("Revolving".into());
        c.account_status = Some("Pays as agreed".into());
        let (tl, _) = normalizer().normalize(&c, "user-1");
        assert_eq!(tl.account_type.as_deref(), Some("Credit Card"));
        assert_eq!(tl.account_status.as_deref(), Some("Open"));
        assert!(!tl.type_unmapped);
    }

    #[test]
    fn negative_keywords_are_deterministic() {
        assert!(is_negative("account was charged off in 2021"));
        assert!(is_negative("120 days past due"));
        assert!(!is_negative("pays as agreed, never delinquent in any way"));
    }
}
