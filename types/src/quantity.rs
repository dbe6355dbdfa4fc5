use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::fmt;

/// Failure to interpret a Kubernetes quantity as a byte count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantityError(pub String);

impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity: {}", self.0)
    }
}

impl std::error::Error for QuantityError {}

/// Parses a Kubernetes quantity (`"4Gi"`, `"512M"`, `"4294967296"`) into
/// bytes. Fractional values are rejected; RAM sizes are whole bytes.
pub fn parse_quantity(quantity: &Quantity) -> Result<u64, QuantityError> {
    let s = quantity.0.trim();
    if s.is_empty() {
        return Err(QuantityError(quantity.0.clone()));
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| QuantityError(quantity.0.clone()))?;
    let factor: u64 = match suffix {
        "" => 1,
        "k" => 1000,
        "M" => 1000u64.pow(2),
        "G" => 1000u64.pow(3),
        "T" => 1000u64.pow(4),
        "P" => 1000u64.pow(5),
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        _ => return Err(QuantityError(quantity.0.clone())),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| QuantityError(quantity.0.clone()))
}

/// Renders a byte count as a plain-number quantity, the form the status
/// subresource reports.
pub fn from_bytes(bytes: u64) -> Quantity {
    Quantity(bytes.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_owned())
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_quantity(&q("4Gi")).unwrap(), 4 << 30);
        assert_eq!(parse_quantity(&q("512Mi")).unwrap(), 512 << 20);
        assert_eq!(parse_quantity(&q("1Ki")).unwrap(), 1024);
    }

    #[test]
    fn parses_decimal_suffixes() {
        assert_eq!(parse_quantity(&q("2G")).unwrap(), 2_000_000_000);
        assert_eq!(parse_quantity(&q("500k")).unwrap(), 500_000);
    }

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_quantity(&q("4294967296")).unwrap(), 4 << 30);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity(&q("")).is_err());
        assert!(parse_quantity(&q("4Gb")).is_err());
        assert!(parse_quantity(&q("Gi")).is_err());
        assert!(parse_quantity(&q("1.5Gi")).is_err());
    }

    #[test]
    fn round_trips_status_form() {
        let rendered = from_bytes(4 << 30);
        assert_eq!(rendered.0, "4294967296");
        assert_eq!(parse_quantity(&rendered).unwrap(), 4 << 30);
    }
}
