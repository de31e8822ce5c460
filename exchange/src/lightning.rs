//! BOLT-11 amount decoding. Deposits and withdrawal dispatch live in
//! external adapters; the core only needs the amount encoded in an invoice's
//! human-readable part so a withdrawal request can be cross-checked against
//! the invoice it will pay.

use matching::Sats;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvoiceError {
    #[error("not a bolt11 invoice")]
    NotBolt11,
    #[error("invalid amount in invoice")]
    InvalidAmount,
}

/// Amount encoded in a BOLT-11 invoice, in satoshis. `None` when the invoice
/// carries no amount. Multipliers per BOLT 11: m ×10^5 sats, u ×10^2,
/// n ÷10 rounded up, p ÷10^4 rounded up, bare number ×10^8.
pub fn bolt11_amount_sats(invoice: &str) -> Result<Option<Sats>, InvoiceError> {
    let lowered = invoice.trim().to_ascii_lowercase();
    let body = lowered.strip_prefix("lightning:").unwrap_or(&lowered);
    if !body.starts_with("ln") {
        return Err(InvoiceError::NotBolt11);
    }

    // The bech32 data charset excludes '1', so the last '1' separates the
    // human-readable part.
    let sep = body.rfind('1').ok_or(InvoiceError::NotBolt11)?;
    let hrp = &body[..sep];

    // Skip "ln" and the currency prefix letters; digits start the amount.
    let after_ln = &hrp[2..];
    let Some(start) = after_ln.find(|c: char| c.is_ascii_digit()) else {
        return Ok(None);
    };
    let amount = &after_ln[start..];

    let (digits, multiplier) = match amount.chars().last() {
        Some(c) if c.is_ascii_digit() => (amount, None),
        Some(c) => (&amount[..amount.len() - 1], Some(c)),
        None => return Ok(None),
    };
    if digits.is_empty() || digits.chars().any(|c| !c.is_ascii_digit()) {
        return Err(InvoiceError::InvalidAmount);
    }
    let value: i64 = digits.parse().map_err(|_| InvoiceError::InvalidAmount)?;

    let sats = match multiplier {
        None => value.checked_mul(100_000_000),
        Some('m') => value.checked_mul(100_000),
        Some('u') => value.checked_mul(100),
        Some('n') => Some((value + 9) / 10),
        Some('p') => Some((value + 9_999) / 10_000),
        Some(_) => return Err(InvoiceError::InvalidAmount),
    }
    .ok_or(InvoiceError::InvalidAmount)?;

    Ok(Some(sats))
}
