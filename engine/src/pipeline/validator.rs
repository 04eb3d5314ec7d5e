use tracing::debug;

use crate::{
    config::PipelineConfig,
    pipeline::{
        extract::CloudEntity,
        types::{Bureau, NormalizedTradeline, UNKNOWN_CREDITOR, ValidationResult},
    },
};

/// Signals available to a validator beyond the record itself.
#[derive(Debug, Default)]
pub struct ValidationContext {
    pub entities: Vec<CloudEntity>,
}

/// Scores a normalized record and decides whether it may be stored.
pub trait Validator: Send + Sync {
    fn validate(&self, tradeline: &NormalizedTradeline, ctx: &ValidationContext)
    -> ValidationResult;
}

/// Picks the validator implementation from declared capability: entity data
/// from the document-intelligence service upgrades to the assisted variant.
pub fn select_validator(config: &PipelineConfig, entities_available: bool) -> Box<dyn Validator> {
    if entities_available {
        debug!("entity signals available, using ml-assisted validation");
        Box::new(MlAssistedValidator::new(config))
    } else {
        Box::new(RuleBasedValidator::new(config))
    }
}

const W_CREDITOR: u32 = 25;
const W_ACCOUNT: u32 = 20;
const W_DATE: u32 = 15;
const W_BALANCE: u32 = 10;
const W_BUREAU: u32 = 10;
const W_LIMIT: u32 = 5;
const W_PAYMENT: u32 = 5;
const W_TYPE: u32 = 5;
const W_STATUS: u32 = 5;

/// Score ceiling. Rule checks alone never certify a record as perfect.
const SCORE_CAP: u32 = 95;

/// Deterministic per-field checks with a weighted score. The stored
/// confidence blends the rule score with how confidently the fields were
/// parsed out of the page text in the first place.
pub struct RuleBasedValidator {
    min_score: u8,
}

impl RuleBasedValidator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            min_score: config.min_validation_score,
        }
    }

    fn rule_score(
        &self,
        tl: &NormalizedTradeline,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> u32 {
        let mut score = 0u32;

        let has_creditor = !tl.creditor_name.is_empty() && tl.creditor_name != UNKNOWN_CREDITOR;
        let has_account = !tl.account_number.is_empty();
        if has_creditor {
            score += W_CREDITOR;
        }
        if has_account {
            score += W_ACCOUNT;
        }
        if !has_creditor && !has_account {
            errors.push("both creditor_name and account_number are missing".into());
        }

        score += currency_score(tl.account_balance.as_deref(), "account_balance", W_BALANCE, errors);
        score += currency_score(tl.credit_limit.as_deref(), "credit_limit", W_LIMIT, errors);
        score += currency_score(tl.monthly_payment.as_deref(), "monthly_payment", W_PAYMENT, errors);

        match tl.date_opened.as_deref() {
            Some(date) if date.contains("XXXX") => {
                warnings.push("date_opened year unresolved".into());
                score += W_DATE / 2;
            }
            Some(_) => score += W_DATE,
            None => {}
        }

        if tl.credit_bureau != Bureau::Unknown {
            score += W_BUREAU;
        } else {
            warnings.push("credit_bureau unresolved, kept as Unknown".into());
        }

        match (&tl.account_type, tl.type_unmapped) {
            (Some(_), false) => score += W_TYPE,
            (Some(raw), true) => warnings.push(format!("account_type outside known set: {raw:?}")),
            (None, _) => {}
        }
        match (&tl.account_status, tl.status_unmapped) {
            (Some(_), false) => score += W_STATUS,
            (Some(raw), true) => {
                warnings.push(format!("account_status outside known set: {raw:?}"));
            }
            (None, _) => {}
        }

        score
    }

    fn finish(
        &self,
        tl: &NormalizedTradeline,
        rule_score: u32,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> ValidationResult {
        let blended = (0.7 * rule_score as f32 + 0.3 * tl.parse_confidence * 100.0).round() as u32;
        let score = blended.min(SCORE_CAP) as u8;
        let valid = errors.is_empty() && score >= self.min_score;

        ValidationResult {
            valid,
            score,
            errors,
            warnings,
        }
    }
}

impl Validator for RuleBasedValidator {
    fn validate(&self, tl: &NormalizedTradeline, _ctx: &ValidationContext) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let score = self.rule_score(tl, &mut errors, &mut warnings);
        self.finish(tl, score, errors, warnings)
    }
}

/// Rule-based checks plus corroboration from document-intelligence entities:
/// a field the service also extracted earns a small bonus, capped so the
/// assisted path can only refine the rule score, not replace it.
pub struct MlAssistedValidator {
    rules: RuleBasedValidator,
}

const ENTITY_BONUS: u32 = 3;
const ENTITY_BONUS_CAP: u32 = 9;

impl MlAssistedValidator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            rules: RuleBasedValidator::new(config),
        }
    }

    fn corroboration(&self, tl: &NormalizedTradeline, entities: &[CloudEntity]) -> u32 {
        let mut bonus = 0u32;
        let creditor = tl.creditor_name.to_lowercase();

        for entity in entities {
            if entity.confidence < 0.5 {
                continue;
            }
            let label = entity.label.to_lowercase();
            let value = entity.value.to_lowercase();

            let hit = (label.contains("creditor") && value.contains(&creditor))
                || (label.contains("account")
                    && tl
                        .account_number_prefix
                        .as_deref()
                        .is_some_and(|p| entity.value.contains(p)))
                || (label.contains("balance")
                    && tl
                        .account_balance
                        .as_deref()
                        .is_some_and(|b| digits(&value) == digits(b) && !digits(b).is_empty()));
            if hit {
                bonus += ENTITY_BONUS;
                if bonus >= ENTITY_BONUS_CAP {
                    break;
                }
            }
        }

        bonus.min(ENTITY_BONUS_CAP)
    }
}

impl Validator for MlAssistedValidator {
    fn validate(&self, tl: &NormalizedTradeline, ctx: &ValidationContext) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut score = self.rules.rule_score(tl, &mut errors, &mut warnings);
        score = (score + self.corroboration(tl, &ctx.entities)).min(100);
        self.rules.finish(tl, score, errors, warnings)
    }
}

fn currency_score(
    value: Option<&str>,
    field: &str,
    weight: u32,
    errors: &mut Vec<String>,
) -> u32 {
    match value {
        None => 0,
        Some(raw) => match parse_currency(raw) {
            Some(amount) if amount >= 0.0 => weight,
            _ => {
                errors.push(format!("{field} is not a non-negative currency: {raw:?}"));
                0
            }
        },
    }
}

fn parse_currency(value: &str) -> Option<f64> {
    value.strip_prefix('$')?.parse::<f64>().ok()
}

fn digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}
