use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// An accounting period, identified by its month and year.
#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub const MIN_YEAR: i32 = 2000;
    pub const MAX_YEAR: i32 = 2100;

    /// Create a period, rejecting months outside 1-12 and years outside the supported range.
    pub fn new(month: u32, year: i32) -> Result<Self, anyhow::Error> {
        let period = Self { year, month };
        period.validate()?;
        Ok(period)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !(1..=12).contains(&self.month) {
            bail!("invalid month {} (expected 1-12)", self.month);
        }
        if !(Self::MIN_YEAR..=Self::MAX_YEAR).contains(&self.year) {
            bail!(
                "invalid year {} (expected {}-{})",
                self.year,
                Self::MIN_YEAR,
                Self::MAX_YEAR
            );
        }
        Ok(())
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[cfg(test)]
mod tests {
    use super::Period;

    #[test]
    fn period_displays_as_year_month() -> Result<(), anyhow::Error> {
        assert_eq!(Period::new(3, 2025)?.to_string(), "2025-03");
        Ok(())
    }

    #[test]
    fn period_rejects_out_of_range_month() {
        let err = Period::new(13, 2025).unwrap_err();
        assert_eq!(err.to_string(), "invalid month 13 (expected 1-12)");
        assert!(Period::new(0, 2025).is_err());
    }

    #[test]
    fn period_rejects_out_of_range_year() {
        assert!(Period::new(1, 1999).is_err());
        assert!(Period::new(1, 2101).is_err());
    }

    #[test]
    fn deserialized_period_can_still_be_invalid() -> Result<(), anyhow::Error> {
        let period: Period = serde_json::from_str(r#"{"month": 14, "year": 2025}"#)?;
        assert!(period.validate().is_err());
        Ok(())
    }
}
