use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{
    Bureau, BureauGuess, ParsedTradelineCandidate, UNKNOWN_CREDITOR,
};

/// One line of merged extraction output, tagged with its source page.
#[derive(Debug, Clone)]
pub struct MergedLine {
    pub page: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FieldKind {
    AccountNumber,
    DateOpened,
    Balance,
    CreditLimit,
    MonthlyPayment,
    AccountType,
    AccountStatus,
}

impl FieldKind {
    fn key(self) -> &'static str {
        match self {
            FieldKind::AccountNumber => "account_number",
            FieldKind::DateOpened => "date_opened",
            FieldKind::Balance => "balance",
            FieldKind::CreditLimit => "credit_limit",
            FieldKind::MonthlyPayment => "monthly_payment",
            FieldKind::AccountType => "account_type",
            FieldKind::AccountStatus => "account_status",
        }
    }
}

const ALL_FIELDS: &[FieldKind] = &[
    FieldKind::AccountNumber,
    FieldKind::DateOpened,
    FieldKind::Balance,
    FieldKind::CreditLimit,
    FieldKind::MonthlyPayment,
    FieldKind::AccountType,
    FieldKind::AccountStatus,
];

/// Creditors recognized by the generic grammar when no bureau format was
/// detected. Matching is on normalized text, substring-based.
const CREDITOR_DICTIONARY: &[&str] = &[
    "CHASE",
    "CAPITAL ONE",
    "BANK OF AMERICA",
    "WELLS FARGO",
    "DISCOVER",
    "AMERICAN EXPRESS",
    "AMEX",
    "CITIBANK",
    "CITI",
    "SYNCHRONY",
    "US BANK",
    "USAA",
    "NAVY FEDERAL",
    "PNC",
    "BARCLAYS",
    "GOLDMAN SACHS",
    "TD BANK",
    "FIFTH THIRD",
    "ALLY",
    "CREDIT ONE",
    "FIRST PREMIER",
    "PORTFOLIO RECOVERY",
    "MIDLAND CREDIT",
    "LVNV FUNDING",
];

/// Section headers that look like anchors but never start an account block.
const SECTION_HEADERS: &[&str] = &[
    "PERSONAL INFORMATION",
    "PUBLIC RECORDS",
    "INQUIRIES",
    "CREDITOR CONTACTS",
    "SUMMARY",
    "ACCOUNT HISTORY",
    "SATISFACTORY ACCOUNTS",
    "ADVERSE ACCOUNTS",
    "CONSUMER STATEMENT",
];

/// Lines an anchor must be corroborated by within this many following lines.
const ANCHOR_LOOKAHEAD: usize = 4;

struct FieldMatch {
    value: String,
    pattern_strength: f32,
    /// 1.0 when the value sat on the label's own line, decaying with distance.
    proximity: f32,
}

/// Segments merged report text into per-account blocks and cuts raw candidate
/// fields out of each block. Bureau-aware when a format was detected, generic
/// grammar otherwise.
pub struct TradelineParser {
    max_block_lines: usize,
    labels: HashMap<Bureau, Vec<(FieldKind, Regex)>>,
    account_token: Regex,
    currency_token: Regex,
    date_token: Regex,
    trailing_account: Regex,
}

impl TradelineParser {
    pub fn new(max_block_lines: usize) -> Self {
        let mut labels = HashMap::new();
        labels.insert(Bureau::TransUnion, build_labels(&TRANSUNION_LABELS));
        labels.insert(Bureau::Experian, build_labels(&EXPERIAN_LABELS));
        labels.insert(Bureau::Equifax, build_labels(&EQUIFAX_LABELS));
        labels.insert(Bureau::Unknown, build_labels(&GENERIC_LABELS));

        Self {
            max_block_lines,
            labels,
            account_token: Regex::new(r"\b[0-9Xx*]{4,}\b").expect("account token regex"),
            currency_token: Regex::new(r"\$\s?[0-9][0-9,]*(?:\.[0-9]{2})?|\b[0-9]{1,3}(?:,[0-9]{3})+(?:\.[0-9]{2})?\b")
                .expect("currency token regex"),
            date_token: Regex::new(r"\b[0-9]{1,2}[/-][0-9]{1,2}[/-][0-9]{2,4}\b|\b[0-9]{1,2}[/-][0-9]{4}\b")
                .expect("date token regex"),
            trailing_account: Regex::new(r"\s+[#0-9Xx*-]{4,}\s*$").expect("trailing account regex"),
        }
    }

    pub fn parse(
        &self,
        lines: &[MergedLine],
        guess: BureauGuess,
    ) -> Vec<ParsedTradelineCandidate> {
        let label_set = &self.labels[&guess.bureau];
        let anchors = self.find_anchors(lines, label_set);
        debug!(anchors = anchors.len(), bureau = %guess.bureau, "segmented account blocks");

        let mut candidates = Vec::new();
        for (i, &start) in anchors.iter().enumerate() {
            let natural_end = anchors.get(i + 1).copied().unwrap_or(lines.len());
            // Block cap stops a missed anchor from swallowing the document.
            let end = natural_end.min(start + self.max_block_lines);
            let block = &lines[start..end];
            candidates.push(self.extract_candidate(block, guess.bureau, label_set));
        }

        candidates
    }

    fn find_anchors(
        &self,
        lines: &[MergedLine],
        label_set: &[(FieldKind, Regex)],
    ) -> Vec<usize> {
        let mut anchors = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            if !self.is_anchor_line(&line.text, label_set) {
                continue;
            }
            // Corroboration: an account-ish token or a field label nearby.
            let lookahead = lines
                .iter()
                .skip(idx + 1)
                .take(ANCHOR_LOOKAHEAD)
                .any(|next| {
                    self.account_token.is_match(&next.text)
                        || label_set.iter().any(|(_, re)| re.is_match(&next.text))
                });
            if lookahead || self.trailing_account.is_match(&line.text) {
                anchors.push(idx);
            }
        }
        anchors
    }

    fn is_anchor_line(&self, text: &str, label_set: &[(FieldKind, Regex)]) -> bool {
        let trimmed = text.trim();
        if trimmed.len() < 3 || trimmed.len() > 70 {
            return false;
        }

        let upper = trimmed.to_uppercase();
        if SECTION_HEADERS.iter().any(|h| upper.starts_with(h)) {
            return false;
        }
        if label_set.iter().any(|(_, re)| re.is_match(trimmed)) {
            return false;
        }

        if dictionary_match(trimmed).is_some() {
            return true;
        }

        // Creditor heading heuristic: a mostly-uppercase name line.
        let alpha: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
        if alpha.len() < 3 {
            return false;
        }
        let upper_count = alpha.iter().filter(|c| c.is_uppercase()).count();
        upper_count as f32 / alpha.len() as f32 >= 0.6
    }

    fn extract_candidate(
        &self,
        block: &[MergedLine],
        bureau: Bureau,
        label_set: &[(FieldKind, Regex)],
    ) -> ParsedTradelineCandidate {
        let mut candidate = ParsedTradelineCandidate {
            bureau,
            page: block.first().map(|l| l.page).unwrap_or(0),
            snippet: snippet(block),
            ..ParsedTradelineCandidate::default()
        };

        self.extract_creditor(block, &mut candidate);

        let mut claimed_currency: Vec<(usize, usize)> = Vec::new();
        for &field in ALL_FIELDS {
            if let Some(found) =
                self.labeled_field(block, field, label_set, &mut claimed_currency)
            {
                let confidence =
                    0.5 + 0.3 * found.pattern_strength + 0.2 * found.proximity;
                self.assign(&mut candidate, field, found.value, confidence);
            }
        }

        // Generic fallback for value tokens that never had a label.
        self.unlabeled_fallback(block, &mut candidate, &claimed_currency);

        candidate
    }

    fn extract_creditor(&self, block: &[MergedLine], candidate: &mut ParsedTradelineCandidate) {
        let anchor = match block.first() {
            Some(line) => line.text.trim(),
            None => "",
        };

        let name = if let Some(hit) = dictionary_match(anchor) {
            hit.to_string()
        } else {
            self.trailing_account.replace(anchor, "").trim().to_string()
        };

        if name.is_empty() {
            // Never silently dropped: emit the placeholder, flagged low.
            candidate.creditor_name = Some(UNKNOWN_CREDITOR.to_string());
            candidate.field_confidence.insert("creditor_name", 0.1);
        } else {
            let strength = if dictionary_match(&name).is_some() { 1.0 } else { 0.6 };
            candidate.creditor_name = Some(name);
            candidate
                .field_confidence
                .insert("creditor_name", 0.5 + 0.3 * strength + 0.2);
        }
    }

    /// Finds a field by its label: the value is the remainder of the label's
    /// line, or the following line when the label stands alone. Among
    /// competing same-type tokens the one nearest its label wins.
    fn labeled_field(
        &self,
        block: &[MergedLine],
        field: FieldKind,
        label_set: &[(FieldKind, Regex)],
        claimed_currency: &mut Vec<(usize, usize)>,
    ) -> Option<FieldMatch> {
        let label_re = label_set.iter().find(|(f, _)| *f == field).map(|(_, re)| re)?;

        for (idx, line) in block.iter().enumerate() {
            let Some(m) = label_re.find(&line.text) else {
                continue;
            };
            let after = &line.text[m.end()..];
            let stripped = after.trim_start_matches([':', '-', '.', ' ']);
            // Offset keeps claimed-token positions absolute within the line.
            let offset = m.end() + (after.len() - stripped.len());
            let remainder = stripped.trim_end();

            if let Some(found) =
                self.field_value(field, remainder, idx, offset, 1.0, claimed_currency)
            {
                return Some(found);
            }
            if let Some(next) = block.get(idx + 1) {
                let next_stripped = next.text.trim_start();
                let next_offset = next.text.len() - next_stripped.len();
                if let Some(found) = self.field_value(
                    field,
                    next_stripped.trim_end(),
                    idx + 1,
                    next_offset,
                    0.5,
                    claimed_currency,
                ) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn field_value(
        &self,
        field: FieldKind,
        text: &str,
        line_idx: usize,
        offset: usize,
        proximity: f32,
        claimed_currency: &mut Vec<(usize, usize)>,
    ) -> Option<FieldMatch> {
        if text.is_empty() {
            return None;
        }

        match field {
            FieldKind::AccountNumber => {
                let m = self.account_token.find(text)?;
                Some(FieldMatch {
                    value: m.as_str().to_string(),
                    pattern_strength: 1.0,
                    proximity,
                })
            }
            FieldKind::DateOpened => {
                let m = self.date_token.find(text)?;
                Some(FieldMatch {
                    value: m.as_str().to_string(),
                    pattern_strength: 1.0,
                    proximity,
                })
            }
            FieldKind::Balance | FieldKind::CreditLimit | FieldKind::MonthlyPayment => {
                for m in self.currency_token.find_iter(text) {
                    if claimed_currency.contains(&(line_idx, offset + m.start())) {
                        continue;
                    }
                    claimed_currency.push((line_idx, offset + m.start()));
                    return Some(FieldMatch {
                        value: m.as_str().to_string(),
                        pattern_strength: 1.0,
                        proximity,
                    });
                }
                None
            }
            FieldKind::AccountType | FieldKind::AccountStatus => {
                // Free-text fields: take the remainder verbatim, but not a
                // value that is clearly some other token type.
                if self.currency_token.is_match(text) || self.date_token.is_match(text) {
                    return None;
                }
                let value: String = text
                    .split(&[':', ';'][..])
                    .next()
                    .unwrap_or(text)
                    .trim()
                    .to_string();
                if value.is_empty() || value.len() > 50 {
                    return None;
                }
                Some(FieldMatch {
                    value,
                    pattern_strength: 0.7,
                    proximity,
                })
            }
        }
    }

    /// Generic grammar pass: digit runs, currency tokens and date tokens that
    /// no label claimed, assigned in order of appearance.
    fn unlabeled_fallback(
        &self,
        block: &[MergedLine],
        candidate: &mut ParsedTradelineCandidate,
        claimed_currency: &[(usize, usize)],
    ) {
        if candidate.account_number.is_none() {
            // Skip the anchor line; a digit run there is part of the heading.
            for line in block.iter().skip(1) {
                if let Some(m) = self.account_token.find(&line.text) {
                    let digits = m.as_str().chars().filter(|c| c.is_ascii_digit()).count();
                    let masked = m.as_str().chars().any(|c| matches!(c, 'X' | 'x' | '*'));
                    if digits >= 4 || masked {
                        self.assign(
                            candidate,
                            FieldKind::AccountNumber,
                            m.as_str().to_string(),
                            0.5 + 0.3 * 0.6,
                        );
                        break;
                    }
                }
            }
        }

        if candidate.date_opened.is_none() {
            if let Some(m) = block
                .iter()
                .find_map(|line| self.date_token.find(&line.text))
            {
                self.assign(
                    candidate,
                    FieldKind::DateOpened,
                    m.as_str().to_string(),
                    0.5 + 0.3 * 0.6,
                );
            }
        }

        let mut leftovers = Vec::new();
        for (idx, line) in block.iter().enumerate() {
            for m in self.currency_token.find_iter(&line.text) {
                if !claimed_currency.contains(&(idx, m.start())) {
                    leftovers.push(m.as_str().to_string());
                }
            }
        }
        let mut leftovers = leftovers.into_iter();
        for field in [FieldKind::Balance, FieldKind::CreditLimit, FieldKind::MonthlyPayment] {
            if self.get(candidate, field).is_none() {
                if let Some(value) = leftovers.next() {
                    self.assign(candidate, field, value, 0.5 + 0.3 * 0.4);
                }
            }
        }
    }

    fn assign(
        &self,
        candidate: &mut ParsedTradelineCandidate,
        field: FieldKind,
        value: String,
        confidence: f32,
    ) {
        let slot = match field {
            FieldKind::AccountNumber => &mut candidate.account_number,
            FieldKind::DateOpened => &mut candidate.date_opened,
            FieldKind::Balance => &mut candidate.balance,
            FieldKind::CreditLimit => &mut candidate.credit_limit,
            FieldKind::MonthlyPayment => &mut candidate.monthly_payment,
            FieldKind::AccountType => &mut candidate.account_type,
            FieldKind::AccountStatus => &mut candidate.account_status,
        };
        if slot.is_none() {
            *slot = Some(value);
            candidate
                .field_confidence
                .insert(field.key(), confidence.min(1.0));
        }
    }

    fn get<'a>(
        &self,
        candidate: &'a ParsedTradelineCandidate,
        field: FieldKind,
    ) -> Option<&'a String> {
        match field {
            FieldKind::AccountNumber => candidate.account_number.as_ref(),
            FieldKind::DateOpened => candidate.date_opened.as_ref(),
            FieldKind::Balance => candidate.balance.as_ref(),
            FieldKind::CreditLimit => candidate.credit_limit.as_ref(),
            FieldKind::MonthlyPayment => candidate.monthly_payment.as_ref(),
            FieldKind::AccountType => candidate.account_type.as_ref(),
            FieldKind::AccountStatus => candidate.account_status.as_ref(),
        }
    }
}

fn dictionary_match(text: &str) -> Option<&'static str> {
    let normalized: String = text
        .to_uppercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    CREDITOR_DICTIONARY
        .iter()
        .find(|name| normalized.contains(**name))
        .copied()
}

fn snippet(block: &[MergedLine]) -> String {
    let joined = block
        .iter()
        .map(|l| l.text.trim())
        .collect::<Vec<_>>()
        .join("\n");
    joined.chars().take(240).collect()
}

fn build_labels(defs: &[(FieldKind, &str)]) -> Vec<(FieldKind, Regex)> {
    defs.iter()
        .map(|(field, pattern)| (*field, Regex::new(pattern).expect("label regex")))
        .collect()
}

const TRANSUNION_LABELS: [(FieldKind, &str); 7] = [
    (FieldKind::AccountNumber, r"(?i)\baccount\s*(?:number|#|no\.?)"),
    (FieldKind::DateOpened, r"(?i)\bdate\s+opened\b"),
    (FieldKind::CreditLimit, r"(?i)\bcredit\s+limit\b"),
    (FieldKind::MonthlyPayment, r"(?i)\b(?:monthly|scheduled)\s+payment\b"),
    (FieldKind::Balance, r"(?i)\b(?:current\s+)?balance\b"),
    (FieldKind::AccountStatus, r"(?i)\b(?:pay\s+status|account\s+status)\b"),
    (FieldKind::AccountType, r"(?i)\b(?:account|loan)\s+type\b"),
];

const EXPERIAN_LABELS: [(FieldKind, &str); 7] = [
    (FieldKind::AccountNumber, r"(?i)\baccount\s*(?:number|#|no\.?)"),
    (FieldKind::DateOpened, r"(?i)\bdate\s+opened\b"),
    (
        FieldKind::CreditLimit,
        r"(?i)\bcredit\s+limit(?:\s+or\s+original\s+amount)?\b",
    ),
    (FieldKind::MonthlyPayment, r"(?i)\bmonthly\s+payment\b"),
    (FieldKind::Balance, r"(?i)\b(?:recent\s+)?balance\b"),
    (FieldKind::AccountStatus, r"(?i)\bstatus\b"),
    (FieldKind::AccountType, r"(?i)\btype\b"),
];

const EQUIFAX_LABELS: [(FieldKind, &str); 7] = [
    (FieldKind::AccountNumber, r"(?i)\baccount\s*(?:number|#|no\.?)"),
    (FieldKind::DateOpened, r"(?i)\bdate\s+opened\b"),
    (FieldKind::CreditLimit, r"(?i)\bcredit\s+limit\b"),
    (
        FieldKind::MonthlyPayment,
        r"(?i)\b(?:scheduled\s+payment(?:\s+amount)?|monthly\s+payment)\b",
    ),
    (FieldKind::Balance, r"(?i)\bbalance(?:\s+owed)?\b"),
    (FieldKind::AccountStatus, r"(?i)\baccount\s+status\b|\bstatus\b"),
    (FieldKind::AccountType, r"(?i)\baccount\s+type\b|\btype\b"),
];

const GENERIC_LABELS: [(FieldKind, &str); 7] = [
    (FieldKind::AccountNumber, r"(?i)\baccount\s*(?:number|#|no\.?)"),
    (FieldKind::DateOpened, r"(?i)\b(?:date\s+opened|opened)\b"),
    (FieldKind::CreditLimit, r"(?i)\b(?:credit\s+limit|limit)\b"),
    (
        FieldKind::MonthlyPayment,
        r"(?i)\b(?:monthly|scheduled)\s+payment\b|\bpayment\s+amount\b",
    ),
    (FieldKind::Balance, r"(?i)\bbalance\b"),
    (FieldKind::AccountStatus, r"(?i)\b(?:pay\s+status|account\s+status|status)\b"),
    (FieldKind::AccountType, r"(?i)\b(?:account|loan)\s+type\b"),
];
