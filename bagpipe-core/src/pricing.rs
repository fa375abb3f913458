//! Storage rental pricing. All amounts are nano-units (10^-9 of a coin).

use serde::Serialize;

pub const NANO: u128 = 1_000_000_000;
/// Paid to the contract for every provider added on deploy (0.05).
pub const PROVIDER_FEE: u128 = NANO / 20;

const MB: u128 = 1 << 20;
const DAY_SECS: u128 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("provider is not available for new bags")]
    Unavailable,
    #[error("proof span {span}s is outside provider range {min}..={max}")]
    SpanOutOfRange { span: u32, min: u32, max: u32 },
    #[error("bag of {size} bytes does not fit into {space_mb} MB offered")]
    NotEnoughSpace { size: u64, space_mb: u64 },
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
    #[error("amount overflow")]
    Overflow,
}

/// Offer a provider returns for one bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRates {
    pub available: bool,
    pub rate_per_mb_day: u128,
    pub min_bounty: u128,
    pub space_available_mb: u64,
    pub min_span: u32,
    pub max_span: u32,
    /// Bag size the offer was asked for.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageQuote {
    pub span_secs: u32,
    pub per_day: u128,
    pub per_proof: u128,
}

/// Daily price for `size` bytes, rounded up to a whole nano-unit.
pub fn per_day(rate_per_mb_day: u128, size: u64) -> Result<u128, PricingError> {
    let total = rate_per_mb_day
        .checked_mul(u128::from(size))
        .ok_or(PricingError::Overflow)?;
    Ok(total.div_ceil(MB))
}

/// Validate an offer against the bag and price it for proofs every `span_secs`.
pub fn quote(rates: &ProviderRates, span_secs: u32) -> Result<StorageQuote, PricingError> {
    if !rates.available {
        return Err(PricingError::Unavailable);
    }
    if span_secs < rates.min_span || span_secs > rates.max_span {
        return Err(PricingError::SpanOutOfRange {
            span: span_secs,
            min: rates.min_span,
            max: rates.max_span,
        });
    }
    if u128::from(rates.size) > u128::from(rates.space_available_mb) * MB {
        return Err(PricingError::NotEnoughSpace {
            size: rates.size,
            space_mb: rates.space_available_mb,
        });
    }
    let per_day = per_day(rates.rate_per_mb_day, rates.size)?;
    let per_proof = (per_day * u128::from(span_secs) / DAY_SECS).max(rates.min_bounty);
    Ok(StorageQuote {
        span_secs,
        per_day,
        per_proof,
    })
}

/// Whole days a contract balance lasts with the given providers. `None` when nothing is charged.
pub fn amortized_days(balance: u128, quotes: &[StorageQuote]) -> Option<u128> {
    let daily: u128 = quotes.iter().map(|q| q.per_day).sum();
    balance.checked_div(daily)
}

/// Amount to attach to a deploy: the storage top-up plus a fee per provider.
pub fn deploy_amount(top_up: u128, providers: usize) -> Result<u128, PricingError> {
    (providers as u128)
        .checked_mul(PROVIDER_FEE)
        .and_then(|fee| fee.checked_add(top_up))
        .ok_or(PricingError::Overflow)
}

pub fn format_amount(nano: u128) -> String {
    format!("{}.{:09}", nano / NANO, nano % NANO)
}

/// Parse a decimal amount with at most 9 fractional digits.
pub fn parse_amount(s: &str) -> Result<u128, PricingError> {
    let invalid = || PricingError::InvalidAmount(s.to_string());
    let s = s.trim();
    let (int, frac) = s.split_once('.').unwrap_or((s, ""));
    if int.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > 9 || !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let whole: u128 = if int.is_empty() {
        0
    } else {
        int.parse().map_err(|_| invalid())?
    };
    let fraction: u128 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<9}").parse().map_err(|_| invalid())?
    };
    whole
        .checked_mul(NANO)
        .and_then(|w| w.checked_add(fraction))
        .ok_or(PricingError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rates() -> ProviderRates {
        ProviderRates {
            available: true,
            rate_per_mb_day: 1_000_000, // 0.001 per MB per day
            min_bounty: 50_000_000,
            space_available_mb: 1024,
            min_span: 3600,
            max_span: 86_400 * 7,
            size: 100 * 1024 * 1024,
        }
    }

    #[test]
    fn quote_for_hundred_megabytes() {
        let q = quote(&rates(), 86_400).unwrap();
        assert_eq!(q.per_day, 100_000_000);
        assert_eq!(q.per_proof, 100_000_000);

        let hourly = quote(&rates(), 3600).unwrap();
        assert_eq!(hourly.per_proof, 50_000_000);
    }

    #[test]
    fn per_day_rounds_up() {
        assert_eq!(per_day(1, 1).unwrap(), 1);
        assert_eq!(per_day(3, 1 << 20).unwrap(), 3);
    }

    #[test]
    fn offer_validation() {
        let mut r = rates();
        assert!(matches!(
            quote(&r, 60),
            Err(PricingError::SpanOutOfRange { .. })
        ));
        r.space_available_mb = 10;
        assert!(matches!(
            quote(&r, 3600),
            Err(PricingError::NotEnoughSpace { .. })
        ));
        r.available = false;
        assert_eq!(quote(&r, 3600), Err(PricingError::Unavailable));
    }

    #[test]
    fn amortization_and_deploy() {
        let q = quote(&rates(), 86_400).unwrap();
        assert_eq!(amortized_days(1_000_000_000, &[q, q]), Some(5));
        assert_eq!(amortized_days(1, &[]), None);
        assert_eq!(deploy_amount(NANO, 2).unwrap(), 1_100_000_000);
    }

    #[test]
    fn amounts_parse_and_format() {
        assert_eq!(parse_amount("1.5").unwrap(), 1_500_000_000);
        assert_eq!(parse_amount("0.000000001").unwrap(), 1);
        assert_eq!(parse_amount("3").unwrap(), 3 * NANO);
        assert_eq!(parse_amount(".25").unwrap(), 250_000_000);
        assert!(parse_amount("1.0000000001").is_err());
        assert!(parse_amount("-1").is_err());
        assert!(parse_amount(".").is_err());
        assert_eq!(format_amount(1_050_000_000), "1.050000000");
        assert_eq!(format_amount(PROVIDER_FEE), "0.050000000");
    }
}
