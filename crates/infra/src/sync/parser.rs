//! Email parsers: turn a stored email into a finance record.
//!
//! Parsing never fails a run; the service only counts outcomes.

use std::sync::LazyLock;

use regex::Regex;

use finsync_core::RawEmail;

/// What a parser recognised in an email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEmail {
    /// A single debit/credit, amount in minor units.
    Transaction { amount_minor: i64, currency: String },
    /// An account or card statement.
    Statement,
    /// Not finance related.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("email has no subject or text")]
    Empty,
    #[error("malformed email: {0}")]
    Malformed(String),
}

pub trait EmailParser: Send + Sync {
    fn parse(&self, email: &RawEmail) -> Result<ParsedEmail, ParseError>;
}

static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rs\.?|inr|usd|eur|gbp|[$₹€£])\s?([0-9][0-9,]*(?:\.[0-9]{1,2})?)")
        .expect("amount pattern is valid")
});

const TRANSACTION_KEYWORDS: &[&str] = &[
    "debited",
    "credited",
    "spent",
    "transaction",
    "payment",
    "purchase",
    "withdrawn",
    "charged",
];

/// Keyword/regex parser for bank alert emails.
#[derive(Debug, Clone, Default)]
pub struct KeywordParser;

impl KeywordParser {
    pub fn new() -> Self {
        Self
    }
}

impl EmailParser for KeywordParser {
    fn parse(&self, email: &RawEmail) -> Result<ParsedEmail, ParseError> {
        let subject = email.subject.as_deref().unwrap_or("").trim();
        let text = email.text().unwrap_or("").trim();
        if subject.is_empty() && text.is_empty() {
            return Err(ParseError::Empty);
        }

        let subject_lower = subject.to_lowercase();
        if subject_lower.contains("statement") {
            return Ok(ParsedEmail::Statement);
        }

        let haystack = format!("{subject}\n{text}");
        let lower = haystack.to_lowercase();
        if !TRANSACTION_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return Ok(ParsedEmail::Ignored);
        }

        let Some(captures) = AMOUNT.captures(&haystack) else {
            return Err(ParseError::Malformed(
                "transaction alert without an amount".to_string(),
            ));
        };
        let currency = currency_code(&captures[1]);
        let amount_minor = parse_minor_units(&captures[2])
            .ok_or_else(|| ParseError::Malformed(format!("unreadable amount {}", &captures[2])))?;

        Ok(ParsedEmail::Transaction {
            amount_minor,
            currency: currency.to_string(),
        })
    }
}

fn currency_code(symbol: &str) -> &'static str {
    match symbol.to_lowercase().trim_end_matches('.') {
        "rs" | "inr" | "₹" => "INR",
        "usd" | "$" => "USD",
        "eur" | "€" => "EUR",
        "gbp" | "£" => "GBP",
        _ => "XXX",
    }
}

/// "1,234.5" -> 123450
fn parse_minor_units(amount: &str) -> Option<i64> {
    let cleaned: String = amount.chars().filter(|c| *c != ',').collect();
    let (whole, fraction) = match cleaned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (cleaned.as_str(), ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        2 => fraction.parse().ok()?,
        _ => return None,
    };
    whole.checked_mul(100)?.checked_add(cents)
}
